//! Long-lived supervising daemon: one instance per workspace.
//!
//! Liveness is enforced with a lockfile (exclusive create) plus a PID file;
//! both are removed on every exit path, including panics, via a drop guard.
//! Two worker threads run beside the main loop: an approval queue draining
//! intercepted commands one at a time, and an integrity ticker verifying
//! the session file and PID file every five seconds.

use crate::analyzer;
use crate::config::{self, Config};
use crate::errors::{GuardError, Result};
use crate::sandbox::{Executor, ExecutionMode};
use crate::session::{self, SessionManager};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capacity of the approval queue.
const INTERCEPT_QUEUE_CAPACITY: usize = 100;

/// A submitter waits this long for a verdict before denying by default.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Integrity checks run on this cadence.
const INTEGRITY_INTERVAL: Duration = Duration::from_secs(5);

/// Set by the signal handler; polled by the main loop.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// An intercepted command awaiting a verdict.
pub struct InterceptRequest {
    pub command: String,
    pub args: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub ppid: i32,
    pub uid: u32,
    reply: SyncSender<bool>,
}

/// Removes the lockfile and PID file when dropped, so cleanup happens on
/// normal exit, errors, and panics alike.
struct LivenessGuard {
    lock_file: PathBuf,
    pid_file: PathBuf,
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.pid_file);
        let _ = fs::remove_file(&self.lock_file);
    }
}

pub struct Daemon {
    workspace: PathBuf,
    agent_name: String,
    config: Config,
    pid_file: PathBuf,
    lock_file: PathBuf,
    intercept_tx: SyncSender<InterceptRequest>,
    intercept_rx: Option<Receiver<InterceptRequest>>,
    stop: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(workspace: &Path, agent_name: &str, config: Config) -> Result<Self> {
        let daemon_dir = config::daemon_dir(workspace);
        fs::create_dir_all(&daemon_dir)?;
        let (tx, rx) = mpsc::sync_channel(INTERCEPT_QUEUE_CAPACITY);
        Ok(Daemon {
            workspace: workspace.to_path_buf(),
            agent_name: agent_name.to_string(),
            config,
            pid_file: daemon_dir.join("daemon.pid"),
            lock_file: daemon_dir.join("daemon.lock"),
            intercept_tx: tx,
            intercept_rx: Some(rx),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle for submitting commands to the approval queue.
    pub fn intercept_handle(&self) -> InterceptHandle {
        InterceptHandle {
            tx: self.intercept_tx.clone(),
        }
    }

    /// Request a graceful stop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Run until a stop request or a termination signal, then end the
    /// session and release the lock and PID files.
    pub fn run(&mut self) -> Result<()> {
        if running_daemon_pid(&self.workspace).is_some() {
            return Err(GuardError::Daemon(format!(
                "already running (pid file: {})",
                self.pid_file.display()
            )));
        }

        acquire_lock(&self.lock_file).map_err(|e| {
            GuardError::Daemon(format!("acquire lock {}: {e}", self.lock_file.display()))
        })?;
        let _liveness = LivenessGuard {
            lock_file: self.lock_file.clone(),
            pid_file: self.pid_file.clone(),
        };
        fs::write(&self.pid_file, std::process::id().to_string())?;

        let session_mgr = SessionManager::new(&self.workspace)
            .map_err(|e| GuardError::Daemon(format!("create session manager: {e}")))?;
        let mut active = session_mgr.start(&self.agent_name, &self.workspace)?;
        std::env::set_var(session::SESSION_ID_ENV, &active.id);

        tracing::info!(
            session_id = %active.id,
            agent = %self.agent_name,
            workspace = %self.workspace.display(),
            pid = std::process::id(),
            "daemon started"
        );

        install_signal_handlers()?;
        SHUTDOWN.store(false, Ordering::SeqCst);

        let rx = self
            .intercept_rx
            .take()
            .ok_or_else(|| GuardError::Daemon("daemon already ran".into()))?;
        let processor = {
            let stop = Arc::clone(&self.stop);
            let cfg = self.config.clone();
            std::thread::spawn(move || process_intercepts(rx, cfg, stop))
        };
        let ticker = {
            let stop = Arc::clone(&self.stop);
            let workspace = self.workspace.clone();
            let pid_file = self.pid_file.clone();
            let session_id = active.id.clone();
            std::thread::spawn(move || integrity_loop(workspace, pid_file, session_id, stop))
        };

        while !self.stop.load(Ordering::SeqCst) && !SHUTDOWN.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
        let reason = if SHUTDOWN.load(Ordering::SeqCst) {
            "signal received"
        } else {
            "stop requested"
        };
        tracing::info!(reason, "daemon stopping");

        // Stop accepting work, then end the session through the ledger.
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = session_mgr.end(&mut active) {
            tracing::error!("failed to end session: {e}");
        }
        let _ = processor.join();
        let _ = ticker.join();

        tracing::info!(
            session_id = %active.id,
            commands = active.commands.len(),
            violations = active.violations,
            "daemon stopped"
        );
        Ok(())
    }
}

/// Submitter side of the approval queue.
#[derive(Clone)]
pub struct InterceptHandle {
    tx: SyncSender<InterceptRequest>,
}

impl InterceptHandle {
    /// Submit a command for validation. Returns true when the daemon
    /// approves it; a full queue or a timeout denies by default.
    pub fn intercept_command(&self, command: &str, args: &[String]) -> bool {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let request = InterceptRequest {
            command: command.to_string(),
            args: args.to_vec(),
            timestamp: Utc::now(),
            pid: std::process::id(),
            ppid: nix::unistd::getppid().as_raw(),
            uid: nix::unistd::getuid().as_raw(),
            reply: reply_tx,
        };
        if self.tx.try_send(request).is_err() {
            tracing::warn!(command, "approval queue unavailable, denying");
            return false;
        }
        match reply_rx.recv_timeout(APPROVAL_TIMEOUT) {
            Ok(verdict) => verdict,
            Err(_) => {
                tracing::warn!(command, "command approval timeout, denying");
                false
            }
        }
    }
}

/// Drain the approval queue one request at a time.
fn process_intercepts(rx: Receiver<InterceptRequest>, cfg: Config, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(request) => {
                let verdict = validate_intercept(&cfg, &request);
                tracing::debug!(
                    command = %request.command,
                    pid = request.pid,
                    ppid = request.ppid,
                    uid = request.uid,
                    approved = verdict,
                    "command intercepted"
                );
                // The submitter may have timed out already.
                let _ = request.reply.try_send(verdict);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Verdict for an intercepted command: deny anything that would be forced
/// into the sandbox or is critical, approve the rest.
fn validate_intercept(cfg: &Config, request: &InterceptRequest) -> bool {
    let mut line = request.command.clone();
    for arg in &request.args {
        line.push(' ');
        line.push_str(arg);
    }
    let findings = analyzer::analyze_script(
        "intercepted",
        line.as_bytes(),
        &cfg.policies,
        &cfg.production_indicators,
    );
    let risk = analyzer::risk_level(&findings);

    let mut cmd_args = vec![request.command.clone()];
    cmd_args.extend(request.args.iter().cloned());
    let decision = Executor::new(cfg.clone()).decide(&cmd_args, risk, &findings);

    !(decision.mandatory
        || risk == analyzer::Severity::Critical
        || decision.mode == ExecutionMode::Sandbox && !cfg.sandbox.enabled)
}

/// Periodic tamper checks: the session file must exist and the PID file
/// must still carry our PID. Deviations are logged, never fatal.
fn integrity_loop(workspace: PathBuf, pid_file: PathBuf, session_id: String, stop: Arc<AtomicBool>) {
    let mut last_check = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last_check.elapsed() < INTEGRITY_INTERVAL {
            continue;
        }
        last_check = Instant::now();
        if let Err(e) = check_integrity(&workspace, &pid_file, &session_id) {
            tracing::warn!("integrity check failed: {e}");
        }
    }
}

fn check_integrity(workspace: &Path, pid_file: &Path, session_id: &str) -> io::Result<()> {
    let session_path = config::sessions_dir(workspace).join(format!("{session_id}.json"));
    if !session_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "session file deleted: possible tampering",
        ));
    }

    let pid_data = fs::read_to_string(pid_file)?;
    let expected = std::process::id().to_string();
    if pid_data.trim() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("pid file tampered: expected {expected}"),
        ));
    }
    Ok(())
}

/// Exclusive-create the lockfile; its existence is the only synchronization
/// primitive between would-be daemons.
fn acquire_lock(path: &Path) -> io::Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
}

fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        // Safety: the handler only stores into an atomic flag.
        unsafe {
            sigaction(signal, &action)
                .map_err(|e| GuardError::Daemon(format!("install {signal} handler: {e}")))?;
        }
    }
    Ok(())
}

/// The PID of a live daemon for this workspace, if any. Stale PID files
/// (process gone) read as "not running".
pub fn running_daemon_pid(workspace: &Path) -> Option<i32> {
    let pid_file = config::daemon_dir(workspace).join("daemon.pid");
    let data = fs::read_to_string(pid_file).ok()?;
    let pid: i32 = data.trim().parse().ok()?;
    if pid <= 0 {
        return None;
    }
    // Signal 0 probes existence without delivering anything.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None)
        .ok()
        .map(|_| pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[test]
    fn test_lockfile_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let lock = tmp.path().join("daemon.lock");
        acquire_lock(&lock).unwrap();
        assert!(acquire_lock(&lock).is_err());
        fs::remove_file(&lock).unwrap();
        acquire_lock(&lock).unwrap();
    }

    #[test]
    fn test_liveness_guard_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let lock = tmp.path().join("daemon.lock");
        let pid = tmp.path().join("daemon.pid");
        fs::write(&lock, b"").unwrap();
        fs::write(&pid, b"123").unwrap();
        {
            let _guard = LivenessGuard {
                lock_file: lock.clone(),
                pid_file: pid.clone(),
            };
        }
        assert!(!lock.exists());
        assert!(!pid.exists());
    }

    #[test]
    fn test_running_daemon_pid_live_and_stale() {
        let tmp = TempDir::new().unwrap();
        let daemon_dir = config::daemon_dir(tmp.path());
        fs::create_dir_all(&daemon_dir).unwrap();

        // Our own PID is alive.
        fs::write(
            daemon_dir.join("daemon.pid"),
            std::process::id().to_string(),
        )
        .unwrap();
        assert_eq!(
            running_daemon_pid(tmp.path()),
            Some(std::process::id() as i32)
        );

        // A stale PID reads as not running.
        fs::write(daemon_dir.join("daemon.pid"), "999999999").unwrap();
        assert_eq!(running_daemon_pid(tmp.path()), None);

        // Garbage reads as not running.
        fs::write(daemon_dir.join("daemon.pid"), "bogus").unwrap();
        assert_eq!(running_daemon_pid(tmp.path()), None);
    }

    #[test]
    fn test_validate_intercept_denies_mandatory() {
        let cfg = Config::default();
        let (tx, _rx) = mpsc::sync_channel(1);
        let request = InterceptRequest {
            command: "rm".into(),
            args: vec!["-r".into(), "/*".into()],
            timestamp: Utc::now(),
            pid: 1,
            ppid: 1,
            uid: 0,
            reply: tx,
        };
        assert!(!validate_intercept(&cfg, &request));
    }

    #[test]
    fn test_validate_intercept_approves_benign() {
        let cfg = Config::default();
        let (tx, _rx) = mpsc::sync_channel(1);
        let request = InterceptRequest {
            command: "ls".into(),
            args: vec!["-la".into()],
            timestamp: Utc::now(),
            pid: 1,
            ppid: 1,
            uid: 0,
            reply: tx,
        };
        assert!(validate_intercept(&cfg, &request));
    }

    #[test]
    fn test_approval_timeout_denies_by_default() {
        // A handle whose queue nobody drains must deny after the timeout;
        // use a tiny direct channel to avoid waiting the full five seconds
        // for the queue-full case.
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = InterceptHandle { tx };

        // Fill the queue so try_send fails immediately.
        let (reply_tx, _reply_rx) = mpsc::sync_channel(1);
        handle
            .tx
            .try_send(InterceptRequest {
                command: "filler".into(),
                args: vec![],
                timestamp: Utc::now(),
                pid: 1,
                ppid: 1,
                uid: 0,
                reply: reply_tx,
            })
            .unwrap();
        assert!(!handle.intercept_command("echo", &[]));
        drop(rx);
    }

    #[test]
    fn test_intercept_roundtrip_through_processor() {
        let cfg = Config::default();
        let (tx, rx) = mpsc::sync_channel(INTERCEPT_QUEUE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let processor = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || process_intercepts(rx, cfg, stop))
        };

        let handle = InterceptHandle { tx };
        assert!(handle.intercept_command("echo", &["hi".to_string()]));
        assert!(!handle.intercept_command("rm", &["-rf".to_string(), "/".to_string()]));

        stop.store(true, Ordering::SeqCst);
        drop(handle);
        processor.join().unwrap();
    }

    #[test]
    fn test_check_integrity() {
        let tmp = TempDir::new().unwrap();
        let mgr = SessionManager::new(tmp.path()).unwrap();
        let session = mgr.start("agent", tmp.path()).unwrap();

        let pid_file = tmp.path().join("daemon.pid");
        fs::write(&pid_file, std::process::id().to_string()).unwrap();
        assert!(check_integrity(tmp.path(), &pid_file, &session.id).is_ok());

        // Tampered PID file.
        fs::write(&pid_file, "1").unwrap();
        assert!(check_integrity(tmp.path(), &pid_file, &session.id).is_err());

        // Deleted session file.
        fs::write(&pid_file, std::process::id().to_string()).unwrap();
        fs::remove_file(
            config::sessions_dir(tmp.path()).join(format!("{}.json", session.id)),
        )
        .unwrap();
        assert!(check_integrity(tmp.path(), &pid_file, &session.id).is_err());
    }

    #[test]
    fn test_second_daemon_refused_while_pid_live() {
        let tmp = TempDir::new().unwrap();
        let daemon_dir = config::daemon_dir(tmp.path());
        fs::create_dir_all(&daemon_dir).unwrap();
        fs::write(
            daemon_dir.join("daemon.pid"),
            std::process::id().to_string(),
        )
        .unwrap();

        let mut daemon = Daemon::new(tmp.path(), "agent", Config::default()).unwrap();
        let err = daemon.run().unwrap_err();
        assert!(matches!(err, GuardError::Daemon(_)));
    }
}
