use std::io;
use thiserror::Error;

/// Process exit code used for policy refusals (declined approval,
/// non-interactive critical, mandatory sandbox without a runtime).
pub const EXIT_POLICY_REFUSAL: i32 = 3;

/// Process exit code used by `validate` when a script carries findings at or
/// above medium severity.
pub const EXIT_VALIDATION_FINDINGS: i32 = 2;

/// Top-level error taxonomy. Every variant keeps its lower-level cause so
/// the CLI can render a single-line message, plus the full chain in verbose
/// mode.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Missing or malformed configuration. Startup fails.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A finding at or above the approval threshold was declined by the user
    /// or refused on a non-interactive run.
    #[error("execution denied: {reason} [{codes}]")]
    PolicyViolation { reason: String, codes: String },

    /// A mandatory-sandbox decision could not be honored because sandboxing
    /// is disabled or no runtime is available. Execution never starts.
    #[error("CRITICAL: sandbox required for {code}")]
    MandatorySandbox { code: String },

    /// `validate` found issues at or above medium severity.
    #[error("{count} finding(s) at or above medium severity in {script}")]
    ValidationFindings { script: String, count: usize },

    /// The selected container runtime is missing from PATH, failed its
    /// version probe, or the OS lacks the required isolation primitives.
    #[error("runtime unavailable: {runtime}")]
    RuntimeUnavailable {
        runtime: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The supervised command exited non-zero. Its code is propagated as the
    /// process exit code.
    #[error("command exited with code {code}")]
    ChildFailure { code: i32 },

    /// Session ledger I/O failure.
    #[error("session ledger: {context}")]
    Ledger {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Trust store I/O failure on a mutation. Lookup failures degrade to
    /// "absent" instead of erroring.
    #[error("trust store: {context}")]
    TrustStore {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The daemon could not be started or is already running.
    #[error("daemon: {0}")]
    Daemon(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GuardError {
    /// Construct a config error wrapping a lower-level cause.
    pub fn config<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        GuardError::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Construct a config error with no underlying cause.
    pub fn config_msg(message: impl Into<String>) -> Self {
        GuardError::Config {
            message: message.into(),
            source: None,
        }
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardError::Config { .. } => 1,
            GuardError::PolicyViolation { .. } => EXIT_POLICY_REFUSAL,
            GuardError::MandatorySandbox { .. } => EXIT_POLICY_REFUSAL,
            GuardError::ValidationFindings { .. } => EXIT_VALIDATION_FINDINGS,
            GuardError::RuntimeUnavailable { .. } => 1,
            GuardError::ChildFailure { code } => *code,
            GuardError::Ledger { .. } => 1,
            GuardError::TrustStore { .. } => 1,
            GuardError::Daemon(_) => 1,
            GuardError::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;

/// Render the full cause chain, one line per cause, for verbose output.
pub fn render_chain(err: &GuardError) -> String {
    use std::error::Error as _;

    let mut out = err.to_string();
    let mut cause: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(c) = cause {
        out.push_str("\n  caused by: ");
        out.push_str(&c.to_string());
        cause = c.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            GuardError::config_msg("missing file").exit_code(),
            1
        );
        assert_eq!(
            GuardError::PolicyViolation {
                reason: "denied".into(),
                codes: "FORK_BOMB".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            GuardError::MandatorySandbox {
                code: "DANGEROUS_DELETE_ROOT".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(GuardError::ChildFailure { code: 42 }.exit_code(), 42);
        assert_eq!(
            GuardError::ValidationFindings {
                script: "x.sh".into(),
                count: 2
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn test_chain_rendering() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let err = GuardError::config("cannot read vectra-guard.yaml", inner);
        let rendered = render_chain(&err);
        assert!(rendered.contains("configuration error"));
        assert!(rendered.contains("caused by: no such file"));
    }

    #[test]
    fn test_mandatory_message_names_code() {
        let err = GuardError::MandatorySandbox {
            code: "DEVICE_WRITE".into(),
        };
        assert!(err.to_string().contains("sandbox required for DEVICE_WRITE"));
    }
}
