//! Configuration schema, discovery, and on-disk layout.
//!
//! Configuration is resolved from (highest precedence first):
//! 1. an explicit `--config FILE` override,
//! 2. the project config `./vectra-guard.yaml` (or `.toml`),
//! 3. the user config `<user-config>/vectra-guard/config.yaml`.
//!
//! Project and user configs are deep-merged key by key, project winning.
//! `VECTRA_GUARD_LEVEL` overrides the guard level for a single invocation.

use crate::analyzer::Severity;
use crate::errors::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Project-level config file names, probed in order.
pub const PROJECT_CONFIG_FILES: &[&str] = &["vectra-guard.yaml", "vectra-guard.toml"];

/// Per-invocation guard level override.
pub const GUARD_LEVEL_ENV: &str = "VECTRA_GUARD_LEVEL";

/// Skips approval for one invocation when user bypass is allowed.
pub const BYPASS_ENV: &str = "VECTRAGUARD_BYPASS";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub guard_level: GuardLevelConfig,
    pub policies: PolicyConfig,
    pub production_indicators: ProductionIndicators,
    pub sandbox: SandboxSettings,
    pub env_protection: EnvProtectionConfig,
    pub logging: LoggingConfig,
}

/// Overall enforcement posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuardLevel {
    Low,
    Medium,
    #[default]
    High,
    Paranoid,
    Off,
}

impl std::str::FromStr for GuardLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(GuardLevel::Low),
            "medium" => Ok(GuardLevel::Medium),
            "high" => Ok(GuardLevel::High),
            "paranoid" => Ok(GuardLevel::Paranoid),
            "off" => Ok(GuardLevel::Off),
            other => Err(format!("unknown guard level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardLevelConfig {
    pub level: GuardLevel,
    pub allow_user_bypass: bool,
    /// Findings strictly above this severity require approval. Unset means
    /// the threshold derives from `level`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_approval_above: Option<Severity>,
}

impl Default for GuardLevelConfig {
    fn default() -> Self {
        GuardLevelConfig {
            level: GuardLevel::High,
            allow_user_bypass: false,
            require_approval_above: None,
        }
    }
}

impl GuardLevelConfig {
    /// The severity above which approval is required, or None when approvals
    /// are disabled entirely (`level: off`).
    pub fn approval_threshold(&self) -> Option<Severity> {
        if let Some(explicit) = self.require_approval_above {
            return Some(explicit);
        }
        match self.level {
            GuardLevel::Off => None,
            GuardLevel::Low => Some(Severity::High),
            GuardLevel::Medium => Some(Severity::Medium),
            GuardLevel::High | GuardLevel::Paranoid => Some(Severity::Low),
        }
    }

    /// User bypass is honored only below paranoid.
    pub fn bypass_allowed(&self) -> bool {
        self.allow_user_bypass && self.level != GuardLevel::Paranoid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub monitor_git_ops: bool,
    pub block_force_git: bool,
    pub detect_prod_env: bool,
    pub only_destructive_sql: bool,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            monitor_git_ops: false,
            block_force_git: true,
            detect_prod_env: true,
            only_destructive_sql: true,
            allowlist: Vec::new(),
            denylist: Vec::new(),
        }
    }
}

impl PolicyConfig {
    pub fn matches_allowlist(&self, command: &str) -> bool {
        matches_any_pattern(&self.allowlist, command)
    }

    pub fn matches_denylist(&self, command: &str) -> bool {
        matches_any_pattern(&self.denylist, command)
    }
}

/// A glob matches either the whole command string or its first token, so a
/// bare program name like `echo` allowlists every `echo ...` invocation.
fn matches_any_pattern(patterns: &[String], command: &str) -> bool {
    let first = command.split_whitespace().next().unwrap_or("");
    patterns.iter().any(|p| match glob::Pattern::new(p) {
        Ok(pat) => pat.matches(command) || pat.matches(first),
        Err(_) => p == command || p == first,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductionIndicators {
    pub branches: Vec<String>,
    pub keywords: Vec<String>,
}

impl Default for ProductionIndicators {
    fn default() -> Self {
        ProductionIndicators {
            branches: vec!["main".into(), "master".into(), "production".into()],
            keywords: vec!["prod".into(), "production".into(), "live".into()],
        }
    }
}

/// When to route execution into the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    #[default]
    Auto,
    Always,
    Risky,
    Never,
}

/// Security posture mapped to concrete container restrictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Permissive,
    #[default]
    Balanced,
    Strict,
    Paranoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    #[default]
    Docker,
    Podman,
    Process,
}

impl SandboxRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            SandboxRuntime::Docker => "docker",
            SandboxRuntime::Podman => "podman",
            SandboxRuntime::Process => "unshare",
        }
    }
}

impl std::fmt::Display for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxRuntime::Docker => write!(f, "docker"),
            SandboxRuntime::Podman => write!(f, "podman"),
            SandboxRuntime::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    None,
    #[default]
    Restricted,
    Full,
}

/// A user-specified bind mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub mode: SandboxMode,
    pub security_level: SecurityLevel,
    pub runtime: SandboxRuntime,
    pub image: String,
    /// Child timeout in seconds; 0 disables the timeout.
    pub timeout: u64,
    pub enable_cache: bool,
    /// Extra cache mounts as `host:container` pairs, appended after the
    /// built-in package-manager table.
    pub cache_dirs: Vec<String>,
    /// Overrides the network mode the security level would pick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<NetworkMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<PathBuf>,
    pub env_whitelist: Vec<String>,
    pub bind_mounts: Vec<BindMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_store_path: Option<PathBuf>,
    pub enable_metrics: bool,
    /// User the container image runs as; cache mounts land in its home.
    pub container_user: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        SandboxSettings {
            enabled: true,
            mode: SandboxMode::Auto,
            security_level: SecurityLevel::Balanced,
            runtime: SandboxRuntime::Docker,
            image: "ubuntu:22.04".into(),
            timeout: 300,
            enable_cache: true,
            cache_dirs: Vec::new(),
            network_mode: None,
            seccomp_profile: None,
            env_whitelist: vec![
                "PATH".into(),
                "HOME".into(),
                "LANG".into(),
                "TERM".into(),
                "USER".into(),
            ],
            bind_mounts: Vec::new(),
            trust_store_path: None,
            enable_metrics: true,
            container_user: "root".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MaskingMode {
    #[default]
    Mask,
    Fake,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvProtectionConfig {
    pub enabled: bool,
    pub masking_mode: MaskingMode,
    /// Variables never propagated into a sandboxed child.
    pub protected_vars: Vec<String>,
    /// Variables exempt from protection even when they match a pattern.
    pub allow_read_vars: Vec<String>,
    /// Substitute values used when `masking_mode: fake`.
    pub fake_values: HashMap<String, String>,
    pub block_env_access: bool,
    pub block_dotenv_read: bool,
}

impl Default for EnvProtectionConfig {
    fn default() -> Self {
        EnvProtectionConfig {
            enabled: true,
            masking_mode: MaskingMode::Mask,
            protected_vars: Vec::new(),
            allow_read_vars: Vec::new(),
            fake_values: HashMap::new(),
            block_env_access: false,
            block_dotenv_read: true,
        }
    }
}

impl EnvProtectionConfig {
    /// Whether a variable may be propagated into a sandboxed child.
    pub fn permits(&self, name: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if self.allow_read_vars.iter().any(|v| v == name) {
            return true;
        }
        !self.protected_vars.iter().any(|v| v == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

// ---------------------------------------------------------------------------
// Discovery and loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration for `workdir`, honoring an explicit override path.
    /// Returns the config and the path it primarily came from, if any.
    pub fn load(explicit: Option<&Path>, workdir: &Path) -> Result<(Config, Option<PathBuf>)> {
        if let Some(path) = explicit {
            let value = read_config_value(path)?;
            let mut cfg: Config = serde_yaml::from_value(value)
                .map_err(|e| GuardError::config(format!("invalid config {}", path.display()), e))?;
            cfg.apply_env_overrides();
            return Ok((cfg, Some(path.to_path_buf())));
        }

        let mut merged = serde_yaml::Value::Mapping(Default::default());
        let mut primary = None;

        if let Ok(dir) = user_config_dir() {
            let user_path = dir.join("config.yaml");
            if user_path.exists() {
                merge_value(&mut merged, read_config_value(&user_path)?);
                primary = Some(user_path);
            }
        }

        for name in PROJECT_CONFIG_FILES {
            let project_path = workdir.join(name);
            if project_path.exists() {
                merge_value(&mut merged, read_config_value(&project_path)?);
                primary = Some(project_path);
                break;
            }
        }

        let mut cfg: Config = serde_yaml::from_value(merged)
            .map_err(|e| GuardError::config("invalid merged configuration", e))?;
        cfg.apply_env_overrides();
        Ok((cfg, primary))
    }

    /// Apply per-invocation environment overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(GUARD_LEVEL_ENV) {
            match raw.parse::<GuardLevel>() {
                Ok(level) => {
                    self.guard_level.level = level;
                    self.guard_level.require_approval_above = None;
                }
                Err(e) => tracing::warn!(value = %raw, "ignoring {GUARD_LEVEL_ENV}: {e}"),
            }
        }
    }

    /// Serialize the default configuration as YAML, for `init`.
    pub fn default_yaml() -> String {
        serde_yaml::to_string(&Config::default()).expect("default config serializes")
    }

    /// Serialize the default configuration as TOML, for `init --toml`.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).expect("default config serializes")
    }
}

/// Parse a config file as YAML or, by extension, TOML into a YAML value.
fn read_config_value(path: &Path) -> Result<serde_yaml::Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GuardError::config(format!("cannot read {}", path.display()), e))?;
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        let value: toml::Value = toml::from_str(&content)
            .map_err(|e| GuardError::config(format!("invalid TOML in {}", path.display()), e))?;
        serde_yaml::to_value(&value)
            .map_err(|e| GuardError::config(format!("cannot convert {}", path.display()), e))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| GuardError::config(format!("invalid YAML in {}", path.display()), e))
    }
}

/// Deep-merge `overlay` into `base`; mappings merge per key, everything else
/// is replaced by the overlay.
fn merge_value(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

// ---------------------------------------------------------------------------
// On-disk layout
// ---------------------------------------------------------------------------

/// Per-user configuration directory for vectra-guard.
///
/// Resolution: `$XDG_CONFIG_HOME/vectra-guard`, else `$HOME/.config/vectra-guard`.
/// Refuses to fall back to a world-writable location.
pub fn user_config_dir() -> io::Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join("vectra-guard"));
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => Ok(PathBuf::from(home).join(".config").join("vectra-guard")),
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "neither XDG_CONFIG_HOME nor HOME is set; refusing to guess a config directory",
        )),
    }
}

/// Path of the persistent trust store.
pub fn trust_store_path(cfg: &Config) -> io::Result<PathBuf> {
    if let Some(path) = &cfg.sandbox.trust_store_path {
        return Ok(path.clone());
    }
    Ok(user_config_dir()?.join("trust.json"))
}

/// Path of the persistent metrics counters.
pub fn metrics_path() -> io::Result<PathBuf> {
    Ok(user_config_dir()?.join("metrics.json"))
}

/// Workspace-local state directory.
pub fn workspace_guard_dir(workspace: &Path) -> PathBuf {
    workspace.join(".vectra-guard")
}

/// Per-workspace session files live here, one JSON file per session.
pub fn sessions_dir(workspace: &Path) -> PathBuf {
    workspace_guard_dir(workspace).join("sessions")
}

/// Daemon lockfile and PID file live here.
pub fn daemon_dir(workspace: &Path) -> PathBuf {
    workspace_guard_dir(workspace).join("daemon")
}
