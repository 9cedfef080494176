//! Persistent trust store: command fingerprint → approval record.
//!
//! The store is a single JSON file (mode 0600) rewritten atomically on every
//! mutation via write-temp-and-rename. Readers tolerate a missing or
//! malformed file by treating the store as empty; concurrent processes
//! coexist because each rewrite is atomic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// A trusted command with optional expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntry {
    /// SHA-256 over the canonical command form.
    pub fingerprint: String,
    /// The original command text, kept for audit display.
    pub command_display: String,
    pub added_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub use_count: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

impl TrustEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// On-disk envelope for the store file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    entries: Vec<TrustEntry>,
}

/// Canonical form: lowercased argv joined by single spaces with internal
/// whitespace collapsed.
pub fn canonical_command(command: &[String]) -> String {
    command
        .iter()
        .flat_map(|arg| arg.split_whitespace())
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 fingerprint of the canonical command form, as lowercase hex.
pub fn fingerprint(command: &[String]) -> String {
    let canonical = canonical_command(command);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Emitted at most once per process when the store file cannot be read.
static READ_WARNING_EMITTED: AtomicBool = AtomicBool::new(false);

pub struct TrustStore {
    path: PathBuf,
    entries: HashMap<String, TrustEntry>,
}

impl TrustStore {
    /// Open the store at `path`. A missing file is an empty store; an
    /// unreadable or malformed file degrades to empty with a warning logged
    /// once per process lifetime, and is replaced on the next write.
    pub fn open(path: &Path) -> Self {
        let entries = match fs::read(path) {
            Ok(data) => match serde_json::from_slice::<StoreFile>(&data) {
                Ok(file) => file
                    .entries
                    .into_iter()
                    .map(|e| (e.fingerprint.clone(), e))
                    .collect(),
                Err(e) => {
                    warn_once(path, &format!("malformed trust store: {e}"));
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn_once(path, &format!("cannot read trust store: {e}"));
                HashMap::new()
            }
        };
        TrustStore {
            path: path.to_path_buf(),
            entries,
        }
    }

    /// Look up a command vector. Returns the entry only if present and not
    /// expired at `now`.
    pub fn lookup(&self, command: &[String]) -> Option<&TrustEntry> {
        let fp = fingerprint(command);
        self.entries
            .get(&fp)
            .filter(|e| !e.is_expired(Utc::now()))
    }

    /// Insert or replace a trusted command. A duration sets the expiry
    /// relative to now.
    pub fn add(
        &mut self,
        command: &[String],
        note: &str,
        duration: Option<Duration>,
    ) -> io::Result<&TrustEntry> {
        let fp = fingerprint(command);
        let entry = TrustEntry {
            fingerprint: fp.clone(),
            command_display: command.join(" "),
            added_at: Utc::now(),
            expires_at: duration.map(|d| Utc::now() + d),
            use_count: 0,
            note: note.to_string(),
        };
        self.entries.insert(fp.clone(), entry);
        self.persist()?;
        Ok(&self.entries[&fp])
    }

    /// Remove a trusted command. Returns whether an entry was present.
    pub fn remove(&mut self, command: &[String]) -> io::Result<bool> {
        let fp = fingerprint(command);
        let removed = self.entries.remove(&fp).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Drop every entry whose expiry has passed. Returns how many were
    /// removed.
    pub fn clean_expired(&mut self) -> io::Result<usize> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Increment the use counter for a fingerprint and persist.
    pub fn record_use(&mut self, fp: &str) -> io::Result<()> {
        if let Some(entry) = self.entries.get_mut(fp) {
            entry.use_count += 1;
            self.persist()?;
        }
        Ok(())
    }

    /// All entries, sorted by `added_at` ascending.
    pub fn list(&self) -> Vec<&TrustEntry> {
        let mut entries: Vec<&TrustEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.added_at);
        entries
    }

    /// Serialize the whole store and atomically replace the file.
    fn persist(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entries: Vec<&TrustEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.added_at);
        let file = StoreFile {
            entries: entries.into_iter().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        set_owner_only(&tmp)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn warn_once(path: &Path, message: &str) {
    if !READ_WARNING_EMITTED.swap(true, Ordering::Relaxed) {
        tracing::warn!(path = %path.display(), "{message}; treating store as empty");
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Parse a human duration like `24h`, `7d`, `30m`, or `90s`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".into());
    }
    let (value, unit) = raw.split_at(raw.len() - 1);
    let n: i64 = value
        .parse()
        .map_err(|_| format!("invalid duration value: {raw}"))?;
    if n < 0 {
        return Err(format!("negative duration: {raw}"));
    }
    match unit {
        "s" => Ok(Duration::seconds(n)),
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        _ => Err(format!("unknown duration unit in {raw} (use s, m, h, or d)")),
    }
}
