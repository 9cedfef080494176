//! Sandbox executor: decides host-vs-sandbox routing and runs the child.
//!
//! The decision rules are evaluated in a fixed order; the mandatory rule is
//! pinned first and cannot be disabled by configuration: a finding whose
//! code is in [`MANDATORY_SANDBOX_CODES`] always routes into the sandbox,
//! even when sandboxing is disabled (the supervisor then refuses to run).

pub mod profile;
pub mod runtime;

use crate::analyzer::{Finding, FindingCode, Severity};
use crate::config::{Config, SandboxMode};
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

/// Finding codes that force sandbox routing regardless of mode, allowlist,
/// or trust. Evaluated before any user policy.
pub const MANDATORY_SANDBOX_CODES: &[FindingCode] = &[
    FindingCode::DangerousDeleteRoot,
    FindingCode::DangerousDeleteHome,
    FindingCode::ForkBomb,
    FindingCode::DeviceWrite,
    FindingCode::SensitiveEnvAccess,
    FindingCode::DotenvFileRead,
    FindingCode::PolicyDenylist,
];

/// Package managers whose invocations count as networked installs.
const INSTALL_MANAGERS: &[&str] = &[
    "npm", "yarn", "pnpm", "pip", "pip3", "cargo", "go", "gem", "apt", "apt-get", "brew",
];

/// Install-style verbs.
const INSTALL_VERBS: &[&str] = &["install", "get", "add", "i"];

/// Package managers whose caches are worth mounting into the sandbox.
const CACHE_MANAGERS: &[&str] = &[
    "npm", "yarn", "pnpm", "pip", "pip3", "cargo", "go", "gem", "mvn", "gradle",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Host,
    Sandbox,
}

/// The routing decision for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDecision {
    pub mode: ExecutionMode,
    pub reason: String,
    pub should_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// True iff the decision was forced by a critical code and may not be
    /// downgraded by trust or allowlist.
    pub mandatory: bool,
}

impl ExecutionDecision {
    fn host(reason: &str) -> Self {
        ExecutionDecision {
            mode: ExecutionMode::Host,
            reason: reason.to_string(),
            should_cache: false,
            cache_key: None,
            mandatory: false,
        }
    }
}

/// What happened when the child ran.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub duration: Duration,
    pub runtime_used: String,
}

/// Stable cache key: SHA-256 over argv joined by NUL.
pub fn cache_key(cmd_args: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cmd_args.join("\0").as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Executor {
    config: Config,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Executor { config }
    }

    /// Decide host vs. sandbox. Rules are evaluated in this exact order;
    /// the first match fixes the result.
    pub fn decide(
        &self,
        cmd_args: &[String],
        risk_level: Severity,
        findings: &[Finding],
    ) -> ExecutionDecision {
        let sandbox = &self.config.sandbox;

        // 1. Mandatory sandbox. Fires even when sandboxing is disabled; the
        //    supervisor must then refuse to execute.
        if findings
            .iter()
            .any(|f| MANDATORY_SANDBOX_CODES.contains(&f.code))
        {
            return self.sandbox_decision(cmd_args, "mandatory sandbox for critical command", true);
        }

        // 2. Sandboxing disabled.
        if !sandbox.enabled {
            return ExecutionDecision::host("sandboxing disabled in config");
        }

        // 3. Mode never.
        if sandbox.mode == SandboxMode::Never {
            return ExecutionDecision::host("sandboxing disabled by mode");
        }

        // 4. Mode always.
        if sandbox.mode == SandboxMode::Always {
            return self.sandbox_decision(cmd_args, "always-sandbox mode enabled", false);
        }

        // 5. Allowlist match. Subordinate to rule 1 only.
        let command_string = cmd_args.join(" ");
        if self.config.policies.matches_allowlist(&command_string) {
            return ExecutionDecision::host("matches allowlist pattern");
        }

        // 6. Low risk, not a networked install.
        let networked = self.is_networked_install(cmd_args);
        if risk_level == Severity::Low && !networked {
            return ExecutionDecision::host("low risk, no isolation needed");
        }

        // 7. Mode risky with elevated risk.
        if sandbox.mode == SandboxMode::Risky && risk_level >= Severity::Medium {
            return self.sandbox_decision(cmd_args, "risky mode: elevated risk requires isolation", false);
        }

        // 8. Mode auto with elevated risk or a networked install.
        if sandbox.mode == SandboxMode::Auto && (risk_level >= Severity::Medium || networked) {
            let reason = if risk_level >= Severity::Medium {
                "auto mode: elevated risk requires isolation"
            } else {
                "auto mode: networked install isolated"
            };
            return self.sandbox_decision(cmd_args, reason, false);
        }

        // 9. Default.
        ExecutionDecision::host("no isolation required")
    }

    fn sandbox_decision(
        &self,
        cmd_args: &[String],
        reason: &str,
        mandatory: bool,
    ) -> ExecutionDecision {
        let should_cache = self.should_enable_cache(cmd_args);
        ExecutionDecision {
            mode: ExecutionMode::Sandbox,
            reason: reason.to_string(),
            should_cache,
            cache_key: Some(cache_key(cmd_args)),
            mandatory,
        }
    }

    /// First token is a package manager and some later token is an
    /// install-style verb.
    pub fn is_networked_install(&self, cmd_args: &[String]) -> bool {
        let Some(first) = cmd_args.first() else {
            return false;
        };
        if !INSTALL_MANAGERS.contains(&first.as_str()) {
            return false;
        }
        cmd_args[1..]
            .iter()
            .any(|t| INSTALL_VERBS.contains(&t.as_str()))
    }

    /// Cache mounts are worth it for package-manager invocations when the
    /// config enables them.
    pub fn should_enable_cache(&self, cmd_args: &[String]) -> bool {
        if !self.config.sandbox.enable_cache {
            return false;
        }
        cmd_args
            .first()
            .map(|t| CACHE_MANAGERS.contains(&t.as_str()))
            .unwrap_or(false)
    }

    /// Run the command per the decision, returning the child's outcome.
    pub fn execute(
        &self,
        cmd_args: &[String],
        decision: &ExecutionDecision,
        work_dir: &Path,
    ) -> Result<ExecutionOutcome> {
        match decision.mode {
            ExecutionMode::Host => runtime::execute_on_host(&self.config, cmd_args),
            ExecutionMode::Sandbox => {
                runtime::execute_in_sandbox(&self.config, cmd_args, decision, work_dir)
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
