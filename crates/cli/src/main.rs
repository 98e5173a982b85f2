// cardrecon CLI - credit-card statement reconciliation against a JSON ledger store

mod exit_codes;
mod recon;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cardrecon::ReconError;
use exit_codes::{recon_exit_code, EXIT_ERROR, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "cardrecon")]
#[command(about = "Reconcile credit-card statements against recorded ledger entries")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Debug-level logging on stderr
    #[arg(long, short = 'v', global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize OCR rows of one bill and add them to the store
    #[command(after_help = "\
Examples:
  cardrecon import-statement --store books --card gogo --month 2025-12 --rows rows.json
  cardrecon import-statement --store books --card gogo --month 2025-12 --rows rows.csv --json

Rows are a JSON array of {\"page\", \"position\", \"text\"} objects, or a CSV
file with page,position,text headers.")]
    ImportStatement {
        /// Store directory (ledger.json, statement_lines.json)
        #[arg(long, env = "CARDRECON_STORE")]
        store: PathBuf,

        /// Card label the bill belongs to
        #[arg(long)]
        card: String,

        /// Bill month (YYYY-MM)
        #[arg(long)]
        month: String,

        /// Raw rows file (.json or .csv)
        #[arg(long)]
        rows: PathBuf,

        /// Reconciliation config (TOML)
        #[arg(long, env = "CARDRECON_CONFIG")]
        config: Option<PathBuf>,

        /// Print the imported line ids as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Match one card's bill for one month against the ledger
    #[command(after_help = "\
Examples:
  cardrecon run-reconciliation --store books --card gogo --month 2025-12
  cardrecon run-reconciliation --store books --card gogo --month 2025-12 --json
  cardrecon run-reconciliation --store books --card gogo --month 2025-12 --dry-run

Unresolved lines are reported and do not change the exit code.")]
    RunReconciliation {
        /// Store directory (ledger.json, statement_lines.json)
        #[arg(long, env = "CARDRECON_STORE")]
        store: PathBuf,

        /// Card label to reconcile
        #[arg(long)]
        card: String,

        /// Bill month (YYYY-MM)
        #[arg(long)]
        month: String,

        /// Reconciliation config (TOML)
        #[arg(long, env = "CARDRECON_CONFIG")]
        config: Option<PathBuf>,

        /// Print the full run report as JSON on stdout
        #[arg(long)]
        json: bool,

        /// Compute the report without writing anything back
        #[arg(long)]
        dry_run: bool,
    },

    /// Check a config file without running anything
    #[command(after_help = "\
Examples:
  cardrecon validate-config recon.toml")]
    ValidateConfig {
        /// Path to the TOML config
        config: PathBuf,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_COMMIT_HASH"), ")",
        "\nengine:  cardrecon ", env!("CARGO_PKG_VERSION"),
        "\ntarget:  ", env!("TARGET"),
    )
}

fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::ImportStatement {
            store,
            card,
            month,
            rows,
            config,
            json,
        } => recon::cmd_import_statement(store, card, month, rows, config, json),
        Commands::RunReconciliation {
            store,
            card,
            month,
            config,
            json,
            dry_run,
        } => recon::cmd_run_reconciliation(store, card, month, config, json, dry_run),
        Commands::ValidateConfig { config } => recon::cmd_validate_config(config),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_USAGE,
            message: msg.into(),
            hint: None,
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_ERROR,
            message: msg.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<ReconError> for CliError {
    fn from(err: ReconError) -> Self {
        let hint = match &err {
            ReconError::InvalidInput(_) => Some("card must be non-empty and month must be YYYY-MM".to_string()),
            ReconError::RunConflict { .. } => Some("wait for the active run to finish, then retry".to_string()),
            ReconError::ConfigParse(_) | ReconError::ConfigValidation(_) => {
                Some("run `cardrecon validate-config <file>` for details".to_string())
            }
            _ => None,
        };
        Self {
            code: recon_exit_code(&err),
            message: err.to_string(),
            hint,
        }
    }
}
