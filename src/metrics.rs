//! Write-only counter sink for supervision metrics.
//!
//! Counters persist in a single JSON file so `metrics show` works across
//! processes. Recording is best-effort: a failed write is logged and never
//! changes the outcome of the pipeline.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardMetrics {
    pub commands_analyzed: u64,
    pub findings_emitted: u64,
    pub host_executions: u64,
    pub sandboxed_executions: u64,
    pub mandatory_blocks: u64,
    pub approvals_requested: u64,
    pub approvals_denied: u64,
    pub trust_hits: u64,
}

/// Load counters; a missing or malformed file reads as all zeros.
pub fn load(path: &Path) -> GuardMetrics {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
        Err(_) => GuardMetrics::default(),
    }
}

/// Persist counters atomically.
pub fn save(path: &Path, metrics: &GuardMetrics) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(metrics)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Apply an update to the persisted counters. Failures are logged, not
/// surfaced; the sink is write-only and never blocks the pipeline.
pub fn record(path: &Path, update: impl FnOnce(&mut GuardMetrics)) {
    let mut metrics = load(path);
    update(&mut metrics);
    if let Err(e) = save(path, &metrics) {
        tracing::warn!(path = %path.display(), "failed to persist metrics: {e}");
    }
}

/// Reset all counters to zero.
pub fn reset(path: &Path) -> io::Result<()> {
    save(path, &GuardMetrics::default())
}
