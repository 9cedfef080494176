pub mod handlers;

use crate::config::{Config, LogFormat};
use crate::errors::{render_chain, GuardError};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vectra-guard")]
#[command(about = "Command-execution supervisor: risk analysis, sandbox routing, session audit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to config file (overrides auto-discovery)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format for logs and version info
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Print full error cause chains
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a configuration file at the project root
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
        /// Write TOML instead of YAML
        #[arg(long)]
        toml: bool,
    },
    /// Validate a shell script for security issues
    Validate {
        /// Script file to analyze
        script: PathBuf,
    },
    /// Explain the security risks found in a script
    Explain {
        /// Script file to analyze
        script: PathBuf,
    },
    /// Execute a command with security validation
    Exec {
        /// Prompt for approval on risky commands
        #[arg(long)]
        interactive: bool,
        /// Track execution in an existing session
        #[arg(long)]
        session: Option<String>,
        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Session ledger operations
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Trust store operations
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
    /// Metrics sink operations
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
    /// Supervising daemon for a workspace
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// Start an agent session and print its id
    Start {
        /// Agent name
        #[arg(long, default_value = "unknown")]
        agent: String,
        /// Workspace path (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Mark a session as ended
    End {
        /// Session id
        id: String,
    },
    /// List all sessions in the workspace
    List,
    /// Show a full session dump
    Show {
        /// Session id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TrustAction {
    /// List trusted commands
    List,
    /// Add a command to the trust store
    Add {
        /// Command text, e.g. "npm test"
        command: String,
        /// Why this command is trusted
        #[arg(long, default_value = "")]
        note: String,
        /// Trust duration, e.g. 24h or 7d (omit for no expiry)
        #[arg(long)]
        duration: Option<String>,
    },
    /// Remove a command from the trust store
    Remove {
        /// Command text
        command: String,
    },
    /// Remove expired entries
    Clean,
}

#[derive(Subcommand)]
pub enum MetricsAction {
    /// Show supervision counters
    Show {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Reset all counters
    Reset,
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Run the daemon in the foreground until signalled
    Run {
        /// Agent name
        #[arg(long, default_value = "unknown")]
        agent: String,
        /// Workspace path (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Report whether a daemon is running for the workspace
    Status {
        /// Workspace path (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

/// Parse arguments, load config, dispatch, and map errors to exit codes.
pub fn run() -> i32 {
    let cli = Cli::parse();

    let workdir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("resolve working directory: {e}");
            return 1;
        }
    };

    let (cfg, _config_path) = match Config::load(cli.config.as_deref(), &workdir) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e}");
            return e.exit_code();
        }
    };

    init_tracing(&cfg, cli.output);

    let result = dispatch(&cli, &cfg, &workdir);
    match result {
        Ok(()) => 0,
        Err(err) => {
            if cli.verbose {
                eprintln!("{}", render_chain(&err));
            } else {
                eprintln!("{err}");
            }
            err.exit_code()
        }
    }
}

fn dispatch(cli: &Cli, cfg: &Config, workdir: &std::path::Path) -> Result<(), GuardError> {
    match &cli.command {
        Commands::Init { force, toml } => handlers::init(workdir, *force, *toml),
        Commands::Validate { script } => handlers::validate(cfg, script),
        Commands::Explain { script } => handlers::explain(cfg, script),
        Commands::Exec {
            interactive,
            session,
            command,
        } => handlers::exec(cfg, command.clone(), *interactive, session.clone()),
        Commands::Session { action } => match action {
            SessionAction::Start { agent, workspace } => {
                handlers::session_start(agent, workspace.as_deref().unwrap_or(workdir))
            }
            SessionAction::End { id } => handlers::session_end(workdir, id),
            SessionAction::List => handlers::session_list(workdir),
            SessionAction::Show { id } => handlers::session_show(workdir, id),
        },
        Commands::Trust { action } => match action {
            TrustAction::List => handlers::trust_list(cfg),
            TrustAction::Add {
                command,
                note,
                duration,
            } => handlers::trust_add(cfg, command, note, duration.as_deref()),
            TrustAction::Remove { command } => handlers::trust_remove(cfg, command),
            TrustAction::Clean => handlers::trust_clean(cfg),
        },
        Commands::Metrics { action } => match action {
            MetricsAction::Show { json } => handlers::metrics_show(*json),
            MetricsAction::Reset => handlers::metrics_reset(),
        },
        Commands::Daemon { action } => match action {
            DaemonAction::Run { agent, workspace } => {
                handlers::daemon_run(cfg, agent, workspace.as_deref().unwrap_or(workdir))
            }
            DaemonAction::Status { workspace } => {
                handlers::daemon_status(workspace.as_deref().unwrap_or(workdir))
            }
        },
        Commands::Version => {
            version(cli.output);
            Ok(())
        }
    }
}

fn version(output: OutputFormat) {
    match output {
        OutputFormat::Json => {
            println!(
                "{{\"version\":\"{}\",\"name\":\"vectra-guard\"}}",
                env!("CARGO_PKG_VERSION")
            );
        }
        OutputFormat::Text => {
            println!("vectra-guard version {}", env!("CARGO_PKG_VERSION"));
        }
    }
}

/// Initialize the structured log sink. `--output json` wins over the config
/// file's logging format.
fn init_tracing(cfg: &Config, output: OutputFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vectra_guard=info"));
    let json = output == OutputFormat::Json || cfg.logging.format == LogFormat::Json;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    // A second init (e.g. under tests) is harmless.
    let _ = result;
}
