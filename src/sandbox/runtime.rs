//! Container runtime argument construction and child execution.
//!
//! The docker/podman argument vector is built in a fixed order so that the
//! output is reproducible and testable: run flags, security options,
//! resource limits, environment, mounts, image, then the user command
//! verbatim. The process runtime uses OS namespace primitives via
//! `unshare(1)` and refuses to run when they are unavailable rather than
//! silently degrading.

use crate::config::{Config, MaskingMode, NetworkMode, SandboxRuntime};
use crate::errors::{GuardError, Result};
use crate::sandbox::{profile, ExecutionDecision, ExecutionOutcome};
use std::io::IsTerminal;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Grace period between SIGTERM at timeout expiry and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Map the abstract network mode onto a container network argument.
/// Restricted relies on runtime-default egress policies applied externally.
fn network_arg(mode: NetworkMode) -> &'static str {
    match mode {
        NetworkMode::None => "none",
        NetworkMode::Restricted => "bridge",
        NetworkMode::Full => "host",
    }
}

/// Build the `docker run` / `podman run` argument vector.
///
/// The order is fixed: run flags, network, filesystem and privilege
/// restrictions, capability drops, resource limits, seccomp, environment,
/// workspace mount and workdir, user mounts, cache mounts, image, command.
pub fn build_container_args(
    prof: &profile::SandboxProfile,
    cmd_args: &[String],
    cache_mounts: &[(std::path::PathBuf, String)],
    env_pairs: &[(String, String)],
    tty: bool,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    args.push("run".into());
    args.push("--rm".into());
    args.push("-i".into());
    if tty {
        args.push("-t".into());
    }

    args.push("--network".into());
    args.push(network_arg(prof.network_mode).into());

    if prof.read_only_root {
        args.push("--read-only".into());
    }
    if prof.no_new_privileges {
        args.push("--security-opt".into());
        args.push("no-new-privileges".into());
    }
    for cap in &prof.cap_drop {
        args.push("--cap-drop".into());
        args.push(cap.clone());
    }

    args.push("--memory".into());
    args.push(prof.memory_limit.clone());
    args.push("--cpus".into());
    args.push(prof.cpu_limit.clone());
    args.push("--pids-limit".into());
    args.push(prof.pids_limit.to_string());

    if let Some(seccomp) = &prof.seccomp_profile {
        args.push("--seccomp".into());
        args.push(seccomp.display().to_string());
    }

    for (name, value) in env_pairs {
        args.push("-e".into());
        args.push(format!("{name}={value}"));
    }

    let workspace = prof.work_dir.display().to_string();
    args.push("-v".into());
    args.push(format!("{workspace}:{workspace}:rw"));
    args.push("-w".into());
    args.push(workspace);

    for mount in &prof.bind_mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        args.push("-v".into());
        args.push(format!(
            "{}:{}:{mode}",
            mount.host.display(),
            mount.container
        ));
    }

    for (host, container) in cache_mounts {
        args.push("-v".into());
        args.push(format!("{}:{container}:rw", host.display()));
    }

    args.push(prof.image.clone());
    args.extend(cmd_args.iter().cloned());
    args
}

/// Build the `unshare(1)` argument vector for the process runtime.
///
/// Isolation: unprivileged user namespace, mount namespace, PID namespace
/// with fork, and a fresh (empty) network namespace when the profile calls
/// for no network. Restricted and full network share the host namespace;
/// egress policy for restricted is applied externally. The user namespace
/// confines capabilities to the namespace itself.
pub fn build_process_args(prof: &profile::SandboxProfile, cmd_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--map-root-user".into(),
        "--mount".into(),
        "--pid".into(),
        "--fork".into(),
        "--kill-child".into(),
    ];
    if prof.network_mode == NetworkMode::None {
        args.push("--net".into());
    }
    args.push("--".into());
    args.extend(cmd_args.iter().cloned());
    args
}

/// Environment propagated into the sandbox: whitelist order, only variables
/// set in the parent, filtered through env protection. Protected variables
/// are substituted when fake values are configured.
pub fn resolve_env_pairs(cfg: &Config) -> Vec<(String, String)> {
    let ep = &cfg.env_protection;
    let mut pairs = Vec::new();
    for name in &cfg.sandbox.env_whitelist {
        let Ok(value) = std::env::var(name) else {
            continue;
        };
        if ep.permits(name) {
            pairs.push((name.clone(), value));
        } else if ep.masking_mode == MaskingMode::Fake {
            if let Some(fake) = ep.fake_values.get(name) {
                pairs.push((name.clone(), fake.clone()));
            }
        }
    }
    pairs
}

/// Verify a container runtime responds to a version probe.
pub fn probe_container_runtime(runtime: SandboxRuntime) -> Result<()> {
    let binary = runtime.binary();
    let status = Command::new(binary)
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| GuardError::RuntimeUnavailable {
            runtime: runtime.to_string(),
            source: Some(e),
        })?;
    if !status.success() {
        return Err(GuardError::RuntimeUnavailable {
            runtime: runtime.to_string(),
            source: None,
        });
    }
    Ok(())
}

/// Verify the OS primitives the process runtime needs. Missing namespaces or
/// a missing `unshare` binary are a refusal, never a silent fallback.
pub fn probe_process_isolation() -> Result<()> {
    for ns in ["user", "mnt", "pid", "net"] {
        if !Path::new("/proc/self/ns").join(ns).exists() {
            return Err(GuardError::RuntimeUnavailable {
                runtime: "process".into(),
                source: Some(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("{ns} namespace not available"),
                )),
            });
        }
    }
    let probe = Command::new("unshare")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match probe {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => Err(GuardError::RuntimeUnavailable {
            runtime: "process".into(),
            source: None,
        }),
        Err(e) => Err(GuardError::RuntimeUnavailable {
            runtime: "process".into(),
            source: Some(e),
        }),
    }
}

/// Run the command directly on the host with inherited stdio.
pub fn execute_on_host(cfg: &Config, cmd_args: &[String]) -> Result<ExecutionOutcome> {
    let (program, rest) = cmd_args
        .split_first()
        .ok_or_else(|| GuardError::config_msg("no command specified"))?;
    let mut command = Command::new(program);
    command.args(rest);
    spawn_supervised(command, cfg.sandbox.timeout, "host")
}

/// Run the command inside the configured sandbox runtime.
pub fn execute_in_sandbox(
    cfg: &Config,
    cmd_args: &[String],
    decision: &ExecutionDecision,
    work_dir: &Path,
) -> Result<ExecutionOutcome> {
    let prof = profile::build_profile(cfg, work_dir);
    let runtime = cfg.sandbox.runtime;

    match runtime {
        SandboxRuntime::Docker | SandboxRuntime::Podman => {
            probe_container_runtime(runtime)?;
            let cache = if decision.should_cache {
                profile::cache_mounts(cfg)
            } else {
                Vec::new()
            };
            let env_pairs = resolve_env_pairs(cfg);
            let tty = std::io::stdin().is_terminal();
            let args = build_container_args(&prof, cmd_args, &cache, &env_pairs, tty);

            tracing::info!(
                runtime = %runtime,
                image = %prof.image,
                network = network_arg(prof.network_mode),
                cached = decision.should_cache,
                "running command in sandbox"
            );

            let mut command = Command::new(runtime.binary());
            command.args(&args);
            spawn_supervised(command, prof.timeout, runtime.binary())
        }
        SandboxRuntime::Process => {
            probe_process_isolation()?;
            let args = build_process_args(&prof, cmd_args);

            tracing::info!(runtime = "process", "running command in namespace sandbox");

            let mut command = Command::new("unshare");
            command.args(&args).current_dir(&prof.work_dir);
            spawn_supervised(command, prof.timeout, "process")
        }
    }
}

/// Spawn with inherited stdio and enforce the timeout: SIGTERM at expiry,
/// SIGKILL after a grace period.
fn spawn_supervised(
    mut command: Command,
    timeout_secs: u64,
    runtime_used: &str,
) -> Result<ExecutionOutcome> {
    let started = Instant::now();
    let mut child = command.spawn()?;

    let status = if timeout_secs == 0 {
        child.wait()?
    } else {
        let deadline = started + Duration::from_secs(timeout_secs);
        let mut term_sent: Option<Instant> = None;
        loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            let now = Instant::now();
            match term_sent {
                None if now >= deadline => {
                    tracing::warn!(timeout_secs, "timeout expired, sending SIGTERM");
                    send_term(&child);
                    term_sent = Some(now);
                }
                Some(at) if now >= at + KILL_GRACE => {
                    tracing::warn!("grace period expired, killing child");
                    child.kill()?;
                    break child.wait()?;
                }
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    };

    Ok(ExecutionOutcome {
        exit_code: exit_code_of(status),
        duration: started.elapsed(),
        runtime_used: runtime_used.to_string(),
    })
}

fn send_term(child: &std::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
