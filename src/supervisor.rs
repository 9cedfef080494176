//! The exec pipeline: analyze → decide → approve → execute → record.
//!
//! Control flow is strictly sequential per command. The only blocking
//! points are the child's wait, trust store and ledger I/O, and the
//! interactive approval read.

use crate::analyzer::{self, Finding, FindingCode, Severity};
use crate::config::{self, Config};
use crate::errors::{GuardError, Result};
use crate::metrics;
use crate::sandbox::{Executor, ExecutionMode, MANDATORY_SANDBOX_CODES};
use crate::session::{self, CommandRecord, SessionManager};
use crate::trust::TrustStore;
use chrono::Utc;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// One `exec` invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub interactive: bool,
    pub session_id: Option<String>,
}

/// Outcome of the interactive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Approval {
    Once,
    OnceAndRemember,
    Denied,
}

/// Run the full pipeline for one command and return the child's exit code.
pub fn run_exec(cfg: &Config, req: &ExecRequest) -> Result<i32> {
    if req.command.is_empty() {
        return Err(GuardError::config_msg("no command specified"));
    }
    let command_string = req.command.join(" ");
    let work_dir = std::env::current_dir()?;

    // 1-2. Analyze and compute the overall risk level.
    let findings = analyzer::analyze_script(
        "inline-command",
        command_string.as_bytes(),
        &cfg.policies,
        &cfg.production_indicators,
    );
    let risk = analyzer::risk_level(&findings);

    for f in &findings {
        tracing::warn!(
            command = %command_string,
            code = %f.code,
            severity = %f.severity,
            description = %f.description,
            recommendation = %f.recommendation,
            "command risk detected"
        );
    }

    record_metrics(cfg, |m| {
        m.commands_analyzed += 1;
        m.findings_emitted += findings.len() as u64;
    });

    // 3. Routing decision.
    let executor = Executor::new(cfg.clone());
    let decision = executor.decide(&req.command, risk, &findings);
    tracing::debug!(
        mode = ?decision.mode,
        reason = %decision.reason,
        mandatory = decision.mandatory,
        "execution decision"
    );

    // 4. Mandatory-block check: a forced-sandbox command with sandboxing
    //    disabled never executes.
    if decision.mandatory && !cfg.sandbox.enabled {
        let code = mandatory_code(&findings);
        record_metrics(cfg, |m| m.mandatory_blocks += 1);
        tracing::error!(command = %command_string, code = %code, "mandatory sandbox unavailable");
        return Err(GuardError::MandatorySandbox {
            code: code.to_string(),
        });
    }

    // Sensitive-variable access can be hard-blocked outright by env
    // protection, sandbox or not.
    if cfg.env_protection.enabled
        && cfg.env_protection.block_env_access
        && findings
            .iter()
            .any(|f| f.code == FindingCode::SensitiveEnvAccess)
    {
        return Err(GuardError::PolicyViolation {
            reason: "sensitive environment access is blocked".into(),
            codes: finding_codes(&findings),
        });
    }

    // 5. Trust lookup. A non-expired match downgrades the required approval
    //    but never changes the execution mode.
    let trusted: Option<(PathBuf, String)> = if risk != Severity::Low && !decision.mandatory {
        match config::trust_store_path(cfg) {
            Ok(path) => {
                let store = TrustStore::open(&path);
                store
                    .lookup(&req.command)
                    .map(|entry| (path.clone(), entry.fingerprint.clone()))
            }
            Err(e) => {
                tracing::warn!("trust store unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    // 6. Approval.
    let threshold = cfg.guard_level.approval_threshold();
    let needs_approval = threshold.map(|t| risk > t).unwrap_or(false);
    let bypass = std::env::var(config::BYPASS_ENV).is_ok()
        && cfg.guard_level.bypass_allowed()
        && !decision.mandatory;

    let mut approved_by: Option<String> = None;
    if trusted.is_some() {
        approved_by = Some("trust-store".into());
        record_metrics(cfg, |m| m.trust_hits += 1);
    } else if bypass {
        approved_by = Some("bypass".into());
        tracing::info!(command = %command_string, "approval bypassed by {}", config::BYPASS_ENV);
    } else if needs_approval {
        if req.interactive {
            record_metrics(cfg, |m| m.approvals_requested += 1);
            match prompt_for_approval(&command_string, risk, &findings)? {
                Approval::Once => approved_by = Some("user".into()),
                Approval::OnceAndRemember => {
                    approved_by = Some("user".into());
                    remember_command(cfg, &req.command);
                }
                Approval::Denied => {
                    record_metrics(cfg, |m| m.approvals_denied += 1);
                    tracing::info!(command = %command_string, "execution denied by user");
                    return Err(GuardError::PolicyViolation {
                        reason: "denied by user".into(),
                        codes: finding_codes(&findings),
                    });
                }
            }
        } else if risk == Severity::Critical {
            // Non-interactive critical commands are always refused; the
            // sandbox-disabled case was already refused at step 4.
            record_metrics(cfg, |m| m.approvals_denied += 1);
            return Err(GuardError::PolicyViolation {
                reason: "critical command refused without interactive approval".into(),
                codes: finding_codes(&findings),
            });
        }
    }

    if let Some((path, fp)) = &trusted {
        let mut store = TrustStore::open(path);
        if let Err(e) = store.record_use(fp) {
            tracing::warn!("failed to record trust use: {e}");
        }
    }

    // 7. Execute.
    let start = Utc::now();
    let outcome = executor.execute(&req.command, &decision, &work_dir)?;
    record_metrics(cfg, |m| match decision.mode {
        ExecutionMode::Host => m.host_executions += 1,
        ExecutionMode::Sandbox => m.sandboxed_executions += 1,
    });

    // 8. Record into the bound session, if any. Ledger failures after
    //    execution are logged and never change the exit code.
    let bound_session = req
        .session_id
        .clone()
        .or_else(session::current_session_id);
    if let Some(session_id) = bound_session {
        let record = CommandRecord {
            timestamp: start,
            command: req.command[0].clone(),
            args: req.command[1..].to_vec(),
            exit_code: outcome.exit_code,
            output: None,
            error: None,
            duration: outcome.duration.as_nanos() as u64,
            risk_level: risk,
            approved: req.interactive || risk == Severity::Low || approved_by.is_some(),
            approved_by,
            findings: findings.iter().map(|f| f.code.to_string()).collect(),
            metadata: HashMap::new(),
        };
        if let Err(e) = append_to_session(&work_dir, &session_id, record) {
            tracing::error!(session_id = %session_id, "failed to record command: {e}");
        }
    }

    tracing::info!(
        command = %command_string,
        exit_code = outcome.exit_code,
        duration_ms = outcome.duration.as_millis() as u64,
        risk = %risk,
        runtime = %outcome.runtime_used,
        "command executed"
    );

    Ok(outcome.exit_code)
}

/// The first mandatory code among the findings, for the refusal message.
fn mandatory_code(findings: &[Finding]) -> FindingCode {
    findings
        .iter()
        .map(|f| f.code)
        .find(|c| MANDATORY_SANDBOX_CODES.contains(c))
        .unwrap_or(FindingCode::PolicyDenylist)
}

fn finding_codes(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| f.code.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn record_metrics(cfg: &Config, update: impl FnOnce(&mut metrics::GuardMetrics)) {
    if !cfg.sandbox.enable_metrics {
        return;
    }
    if let Ok(path) = config::metrics_path() {
        metrics::record(&path, update);
    }
}

fn remember_command(cfg: &Config, command: &[String]) {
    match config::trust_store_path(cfg) {
        Ok(path) => {
            let mut store = TrustStore::open(&path);
            if let Err(e) = store.add(command, "approved interactively", None) {
                tracing::warn!("failed to remember command: {e}");
            }
        }
        Err(e) => tracing::warn!("trust store unavailable: {e}"),
    }
}

fn append_to_session(
    work_dir: &PathBuf,
    session_id: &str,
    record: CommandRecord,
) -> std::io::Result<()> {
    let mgr = SessionManager::new(work_dir)?;
    let mut session = mgr.load(session_id)?;
    mgr.add_command(&mut session, record)
}

/// Ask the user to approve a risky command: `y` runs it once, `r` runs it
/// and remembers it in the trust store, anything else cancels.
fn prompt_for_approval(
    command: &str,
    risk: Severity,
    findings: &[Finding],
) -> Result<Approval> {
    let mut stderr = std::io::stderr().lock();
    writeln!(stderr, "\nCommand requires approval")?;
    writeln!(stderr, "Command: {command}")?;
    writeln!(
        stderr,
        "Risk level: {}\n",
        risk.to_string().to_uppercase()
    )?;
    if !findings.is_empty() {
        writeln!(stderr, "Security concerns:")?;
        for (i, f) in findings.iter().enumerate() {
            writeln!(stderr, "{}. [{}] {}", i + 1, f.code, f.description)?;
            writeln!(stderr, "   Recommendation: {}", f.recommendation)?;
        }
        writeln!(stderr)?;
    }
    write!(
        stderr,
        "Proceed? [y = once, r = once and remember, N = cancel]: "
    )?;
    stderr.flush()?;

    let mut response = String::new();
    std::io::stdin().lock().read_line(&mut response)?;
    Ok(match response.trim().to_lowercase().as_str() {
        "y" | "yes" => Approval::Once,
        "r" | "remember" => Approval::OnceAndRemember,
        _ => Approval::Denied,
    })
}
