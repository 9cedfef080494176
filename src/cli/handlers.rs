//! Subcommand handlers. Output that callers consume (session ids, dumps,
//! metrics) goes to stdout; diagnostics go through the log sink.

use crate::analyzer::{self, Severity};
use crate::config::{self, Config};
use crate::daemon::{running_daemon_pid, Daemon};
use crate::errors::{GuardError, Result};
use crate::metrics;
use crate::session::SessionManager;
use crate::supervisor::{self, ExecRequest};
use crate::trust::{parse_duration, TrustStore};
use std::fs;
use std::path::Path;

/// Create the default config file at the project root.
pub fn init(workdir: &Path, force: bool, as_toml: bool) -> Result<()> {
    let (name, content) = if as_toml {
        ("vectra-guard.toml", Config::default_toml())
    } else {
        ("vectra-guard.yaml", Config::default_yaml())
    };
    let path = workdir.join(name);
    if path.exists() && !force {
        return Err(GuardError::config_msg(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    fs::write(&path, content)?;
    println!("Created {}", path.display());
    Ok(())
}

/// Analyze a script and print its findings; exit 2 when anything at or
/// above medium severity is present.
pub fn validate(cfg: &Config, script: &Path) -> Result<()> {
    let findings = analyze_file(cfg, script)?;

    if findings.is_empty() {
        println!("{}: no issues found", script.display());
        return Ok(());
    }

    for f in &findings {
        let location = f
            .line
            .map(|l| format!("{}:{l}", script.display()))
            .unwrap_or_else(|| script.display().to_string());
        println!("{location}: [{}] {}: {}", f.severity, f.code, f.description);
    }

    let blocking = findings
        .iter()
        .filter(|f| f.severity >= Severity::Medium)
        .count();
    if blocking > 0 {
        return Err(GuardError::ValidationFindings {
            script: script.display().to_string(),
            count: blocking,
        });
    }
    Ok(())
}

/// Analyze a script and print the human rationale for each finding.
pub fn explain(cfg: &Config, script: &Path) -> Result<()> {
    let findings = analyze_file(cfg, script)?;

    println!("Analysis of {}", script.display());
    if findings.is_empty() {
        println!("No security risks detected.");
        return Ok(());
    }

    println!(
        "Overall risk level: {}\n",
        analyzer::risk_level(&findings).to_string().to_uppercase()
    );
    for (i, f) in findings.iter().enumerate() {
        println!("{}. [{}] {} ({})", i + 1, f.code, f.description, f.severity);
        if let Some(line) = f.line {
            if let Some(snippet) = &f.snippet {
                println!("   line {line}: {snippet}");
            }
        }
        println!("   Recommendation: {}", f.recommendation);
    }
    Ok(())
}

fn analyze_file(cfg: &Config, script: &Path) -> Result<Vec<analyzer::Finding>> {
    let content = fs::read(script)
        .map_err(|e| GuardError::config(format!("cannot read {}", script.display()), e))?;
    let name = script.display().to_string();
    Ok(analyzer::analyze_script(
        &name,
        &content,
        &cfg.policies,
        &cfg.production_indicators,
    ))
}

/// Run the supervised-execution pipeline; a non-zero child becomes the
/// process exit code.
pub fn exec(
    cfg: &Config,
    command: Vec<String>,
    interactive: bool,
    session_id: Option<String>,
) -> Result<()> {
    let request = ExecRequest {
        command,
        interactive,
        session_id,
    };
    let code = supervisor::run_exec(cfg, &request)?;
    if code != 0 {
        return Err(GuardError::ChildFailure { code });
    }
    Ok(())
}

pub fn session_start(agent: &str, workspace: &Path) -> Result<()> {
    let mgr = SessionManager::new(workspace).map_err(ledger_err("create session directory"))?;
    let session = mgr
        .start(agent, workspace)
        .map_err(ledger_err("start session"))?;
    // The id on stdout is the contract; callers export it as
    // VECTRAGUARD_SESSION_ID for the process tree they supervise.
    println!("{}", session.id);
    Ok(())
}

pub fn session_end(workspace: &Path, id: &str) -> Result<()> {
    let mgr = SessionManager::new(workspace).map_err(ledger_err("open session directory"))?;
    let mut session = mgr.load(id).map_err(ledger_err("load session"))?;
    mgr.end(&mut session).map_err(ledger_err("end session"))?;
    println!(
        "Session {} ended ({} commands, risk score {}, {} violations)",
        session.id,
        session.commands.len(),
        session.risk_score,
        session.violations
    );
    Ok(())
}

pub fn session_list(workspace: &Path) -> Result<()> {
    let mgr = SessionManager::new(workspace).map_err(ledger_err("open session directory"))?;
    let sessions = mgr.list().map_err(ledger_err("list sessions"))?;
    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }
    println!(
        "{:<40} {:<12} {:<25} {:>8} {:>6} {:>10}",
        "ID", "AGENT", "STARTED", "COMMANDS", "RISK", "VIOLATIONS"
    );
    for s in sessions {
        println!(
            "{:<40} {:<12} {:<25} {:>8} {:>6} {:>10}",
            s.id,
            s.agent_name,
            s.start_time.to_rfc3339(),
            s.commands.len(),
            s.risk_score,
            s.violations
        );
    }
    Ok(())
}

pub fn session_show(workspace: &Path, id: &str) -> Result<()> {
    let mgr = SessionManager::new(workspace).map_err(ledger_err("open session directory"))?;
    let session = mgr.load(id).map_err(ledger_err("load session"))?;
    let dump = serde_json::to_string_pretty(&session)
        .map_err(|e| GuardError::config("serialize session", e))?;
    println!("{dump}");
    Ok(())
}

pub fn trust_list(cfg: &Config) -> Result<()> {
    let path = config::trust_store_path(cfg)?;
    let store = TrustStore::open(&path);
    let entries = store.list();
    if entries.is_empty() {
        println!("Trust store is empty.");
        return Ok(());
    }
    println!(
        "{:<14} {:<32} {:<25} {:<25} {:>5}  NOTE",
        "FINGERPRINT", "COMMAND", "ADDED", "EXPIRES", "USES"
    );
    for e in entries {
        let expires = e
            .expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        println!(
            "{:<14} {:<32} {:<25} {:<25} {:>5}  {}",
            &e.fingerprint[..12.min(e.fingerprint.len())],
            e.command_display,
            e.added_at.to_rfc3339(),
            expires,
            e.use_count,
            e.note
        );
    }
    Ok(())
}

pub fn trust_add(cfg: &Config, command: &str, note: &str, duration: Option<&str>) -> Result<()> {
    let parts: Vec<String> = command.split_whitespace().map(|s| s.to_string()).collect();
    if parts.is_empty() {
        return Err(GuardError::config_msg("empty command"));
    }
    let duration = duration
        .map(parse_duration)
        .transpose()
        .map_err(GuardError::config_msg)?;

    let path = config::trust_store_path(cfg)?;
    let mut store = TrustStore::open(&path);
    let entry = store
        .add(&parts, note, duration)
        .map_err(|e| GuardError::TrustStore {
            context: "add entry".into(),
            source: e,
        })?;
    match entry.expires_at {
        Some(exp) => println!("Trusted '{command}' until {}", exp.to_rfc3339()),
        None => println!("Trusted '{command}' (no expiry)"),
    }
    Ok(())
}

pub fn trust_remove(cfg: &Config, command: &str) -> Result<()> {
    let parts: Vec<String> = command.split_whitespace().map(|s| s.to_string()).collect();
    let path = config::trust_store_path(cfg)?;
    let mut store = TrustStore::open(&path);
    let removed = store.remove(&parts).map_err(|e| GuardError::TrustStore {
        context: "remove entry".into(),
        source: e,
    })?;
    if removed {
        println!("Removed '{command}' from the trust store");
    } else {
        println!("'{command}' was not in the trust store");
    }
    Ok(())
}

pub fn trust_clean(cfg: &Config) -> Result<()> {
    let path = config::trust_store_path(cfg)?;
    let mut store = TrustStore::open(&path);
    let removed = store.clean_expired().map_err(|e| GuardError::TrustStore {
        context: "clean expired entries".into(),
        source: e,
    })?;
    println!("Removed {removed} expired entries");
    Ok(())
}

pub fn metrics_show(json: bool) -> Result<()> {
    let path = config::metrics_path()?;
    let m = metrics::load(&path);
    if json {
        let dump = serde_json::to_string_pretty(&m)
            .map_err(|e| GuardError::config("serialize metrics", e))?;
        println!("{dump}");
    } else {
        println!("Commands analyzed:     {}", m.commands_analyzed);
        println!("Findings emitted:      {}", m.findings_emitted);
        println!("Host executions:       {}", m.host_executions);
        println!("Sandboxed executions:  {}", m.sandboxed_executions);
        println!("Mandatory blocks:      {}", m.mandatory_blocks);
        println!("Approvals requested:   {}", m.approvals_requested);
        println!("Approvals denied:      {}", m.approvals_denied);
        println!("Trust-store hits:      {}", m.trust_hits);
    }
    Ok(())
}

pub fn metrics_reset() -> Result<()> {
    let path = config::metrics_path()?;
    metrics::reset(&path)?;
    println!("Metrics reset");
    Ok(())
}

pub fn daemon_run(cfg: &Config, agent: &str, workspace: &Path) -> Result<()> {
    let mut daemon = Daemon::new(workspace, agent, cfg.clone())?;
    daemon.run()
}

pub fn daemon_status(workspace: &Path) -> Result<()> {
    match running_daemon_pid(workspace) {
        Some(pid) => println!("Daemon running (pid {pid})"),
        None => println!("No daemon running for {}", workspace.display()),
    }
    Ok(())
}

fn ledger_err(context: &'static str) -> impl FnOnce(std::io::Error) -> GuardError {
    move |e| GuardError::Ledger {
        context: context.into(),
        source: e,
    }
}
