//! Per-agent, per-workspace session ledger.
//!
//! Each session is one JSON file under `<workspace>/.vectra-guard/sessions/`.
//! Command and file-operation sequences are append-only: no update ever
//! mutates a past element, and the risk score never decreases. The whole
//! file is rewritten atomically on each append, which is acceptable at the
//! scale of a developer session.

use crate::analyzer::Severity;
use crate::config;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable carrying the active session id across a process tree.
pub const SESSION_ID_ENV: &str = "VECTRAGUARD_SESSION_ID";

/// An agent's tracked activity between `start` and `end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    pub workspace: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub commands: Vec<CommandRecord>,
    pub file_operations: Vec<FileOperation>,
    pub risk_score: u64,
    pub violations: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A single supervised command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in nanoseconds.
    pub duration: u64,
    pub risk_level: Severity,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A single filesystem operation observed during the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOperation {
    pub timestamp: DateTime<Utc>,
    /// create, modify, delete, or read.
    pub operation: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub risk_level: Severity,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Handles session lifecycle and persistence for one workspace.
pub struct SessionManager {
    session_dir: PathBuf,
}

impl SessionManager {
    pub fn new(workspace: &Path) -> io::Result<Self> {
        let session_dir = config::sessions_dir(workspace);
        fs::create_dir_all(&session_dir)?;
        Ok(SessionManager { session_dir })
    }

    /// Create and persist a new session.
    pub fn start(&self, agent_name: &str, workspace: &Path) -> io::Result<Session> {
        let session = Session {
            id: generate_session_id(),
            agent_name: agent_name.to_string(),
            workspace: workspace.display().to_string(),
            start_time: Utc::now(),
            end_time: None,
            commands: Vec::new(),
            file_operations: Vec::new(),
            risk_score: 0,
            violations: 0,
            metadata: HashMap::new(),
        };
        self.save(&session)?;
        tracing::info!(
            session_id = %session.id,
            agent = agent_name,
            workspace = %workspace.display(),
            "session started"
        );
        Ok(session)
    }

    /// Read and parse an existing session; fails if missing or malformed.
    pub fn load(&self, id: &str) -> io::Result<Session> {
        let path = self.session_path(id);
        let data = fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed session {id}: {e}"),
            )
        })
    }

    /// Mark the session as ended and persist.
    pub fn end(&self, session: &mut Session) -> io::Result<()> {
        let now = Utc::now();
        session.end_time = Some(now);
        self.save(session)?;
        tracing::info!(
            session_id = %session.id,
            commands = session.commands.len(),
            violations = session.violations,
            risk_score = session.risk_score,
            "session ended"
        );
        Ok(())
    }

    /// Append a command record, updating the risk score and violation count.
    pub fn add_command(&self, session: &mut Session, cmd: CommandRecord) -> io::Result<()> {
        match cmd.risk_level {
            Severity::Critical => {
                session.risk_score += 100;
                session.violations += 1;
            }
            Severity::High => {
                session.risk_score += 50;
                session.violations += 1;
            }
            Severity::Medium => {
                session.risk_score += 10;
            }
            Severity::Low => {}
        }
        session.commands.push(cmd);
        self.save(session)
    }

    /// Append a file operation; a denied operation counts as a violation.
    pub fn add_file_operation(
        &self,
        session: &mut Session,
        op: FileOperation,
    ) -> io::Result<()> {
        if !op.allowed {
            session.violations += 1;
            session.risk_score += 25;
        }
        session.file_operations.push(op);
        self.save(session)
    }

    /// All sessions in the workspace; malformed files are skipped with a
    /// logged warning.
    pub fn list(&self) -> io::Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.session_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            match self.load(id) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(session_id = id, "skipping unreadable session: {e}");
                }
            }
        }
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.session_dir.join(format!("{id}.json"))
    }

    /// Persist atomically: write a temp file in the same directory, then
    /// rename over the target.
    fn save(&self, session: &Session) -> io::Result<()> {
        let path = self.session_path(&session.id);
        let data = serde_json::to_vec_pretty(session)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Unique within a workspace and sortable by creation time: nanosecond
/// timestamp plus the process id as a disambiguator.
pub fn generate_session_id() -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1000));
    format!("session-{nanos}-{}", std::process::id())
}

/// The active session id bound to this process tree, if any.
pub fn current_session_id() -> Option<String> {
    std::env::var(SESSION_ID_ENV).ok().filter(|s| !s.is_empty())
}
