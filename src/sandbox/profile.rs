//! Security postures: mapping from [`SecurityLevel`] to concrete container
//! restrictions, and the package-manager cache-mount table.

use crate::config::{BindMount, Config, NetworkMode, SecurityLevel};
use std::path::{Path, PathBuf};

/// Concrete sandbox parameters derived from the configured security level.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    pub image: String,
    pub work_dir: PathBuf,
    /// Seconds; 0 disables the timeout.
    pub timeout: u64,
    pub network_mode: NetworkMode,
    pub read_only_root: bool,
    /// Capability names, sorted for deterministic argument order.
    pub cap_drop: Vec<String>,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub pids_limit: u32,
    pub no_new_privileges: bool,
    pub bind_mounts: Vec<BindMount>,
    pub env_whitelist: Vec<String>,
    pub seccomp_profile: Option<PathBuf>,
    pub container_user: String,
}

/// Capabilities granted by container runtimes by default. The strict level
/// drops everything here except the file-ownership set.
const DEFAULT_CAPABILITIES: &[&str] = &[
    "AUDIT_WRITE",
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "MKNOD",
    "NET_BIND_SERVICE",
    "NET_RAW",
    "SETFCAP",
    "SETGID",
    "SETPCAP",
    "SETUID",
    "SYS_CHROOT",
];

const STRICT_KEEP: &[&str] = &["CHOWN", "DAC_OVERRIDE", "SETGID", "SETUID"];

/// Build the sandbox profile for one execution.
pub fn build_profile(cfg: &Config, work_dir: &Path) -> SandboxProfile {
    let sandbox = &cfg.sandbox;

    let (network, read_only, cap_drop, memory, cpus, pids, no_new_privs) =
        match sandbox.security_level {
            SecurityLevel::Permissive => (
                NetworkMode::Full,
                false,
                Vec::new(),
                "2g",
                "2.0",
                1024,
                false,
            ),
            SecurityLevel::Balanced => (
                NetworkMode::Restricted,
                false,
                vec!["NET_RAW".to_string(), "SYS_ADMIN".to_string()],
                "1g",
                "1.0",
                512,
                true,
            ),
            SecurityLevel::Strict => {
                let mut drops: Vec<String> = DEFAULT_CAPABILITIES
                    .iter()
                    .filter(|c| !STRICT_KEEP.contains(c))
                    .map(|c| c.to_string())
                    .collect();
                drops.sort();
                (
                    NetworkMode::Restricted,
                    true,
                    drops,
                    "512m",
                    "0.5",
                    256,
                    true,
                )
            }
            SecurityLevel::Paranoid => (
                NetworkMode::None,
                true,
                vec!["ALL".to_string()],
                "256m",
                "0.25",
                64,
                true,
            ),
        };

    SandboxProfile {
        image: sandbox.image.clone(),
        work_dir: work_dir.to_path_buf(),
        timeout: sandbox.timeout,
        network_mode: sandbox.network_mode.unwrap_or(network),
        read_only_root: read_only,
        cap_drop,
        memory_limit: memory.to_string(),
        cpu_limit: cpus.to_string(),
        pids_limit: pids,
        no_new_privileges: no_new_privs,
        bind_mounts: sandbox.bind_mounts.clone(),
        env_whitelist: sandbox.env_whitelist.clone(),
        seccomp_profile: sandbox.seccomp_profile.clone(),
        container_user: sandbox.container_user.clone(),
    }
}

/// The container-side home directory for the configured user.
fn container_home(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    }
}

/// Package-manager cache mounts as (host, container) pairs, in table order.
/// Host paths that do not exist are skipped silently.
pub fn cache_mounts(cfg: &Config) -> Vec<(PathBuf, String)> {
    let Ok(home) = std::env::var("HOME") else {
        return Vec::new();
    };
    let home = PathBuf::from(home);
    let chome = container_home(&cfg.sandbox.container_user);

    let table: [(PathBuf, String); 9] = [
        (home.join(".npm"), format!("{chome}/.npm")),
        (home.join(".yarn"), format!("{chome}/.yarn")),
        (home.join(".pnpm-store"), format!("{chome}/.pnpm-store")),
        (home.join(".cache/pip"), format!("{chome}/.cache/pip")),
        (home.join(".cargo"), format!("{chome}/.cargo")),
        // GOPATH convention, independent of the container user.
        (home.join("go/pkg"), "/go/pkg".to_string()),
        (home.join(".gem"), format!("{chome}/.gem")),
        (home.join(".m2"), format!("{chome}/.m2")),
        (home.join(".gradle"), format!("{chome}/.gradle")),
    ];

    let mut mounts: Vec<(PathBuf, String)> = table
        .into_iter()
        .filter(|(host, _)| host.exists())
        .collect();

    // Extra `host:container` pairs from the config, appended after the
    // built-in table.
    for spec in &cfg.sandbox.cache_dirs {
        if let Some((host, container)) = spec.split_once(':') {
            let host = PathBuf::from(host);
            if host.exists() {
                mounts.push((host, container.to_string()));
            }
        }
    }

    mounts
}
