//! Embeddable `setupctl` command surface.
//!
//! Hosts can drive the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_setup_with_db`] for direct [`SetupCommand`] execution against a DB path.
//! - [`run_setup`] for execution against an existing [`SqliteDecisionStore`].

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use setup_lifecycle_core::{
    evaluate, evaluate_and_record, parse_setup_key, Direction, EngineSettings, EvaluationRequest,
    PersistenceStatus, SetupKey, SetupState, StateMachineRecord, TransitionQuery,
    TransitionRecord,
};
use setup_lifecycle_store_sqlite::{
    LedgerCheck, LedgerDriftKey, LedgerIssueSeverity, LedgerStatus, SqliteDecisionStore,
};

#[derive(Debug, Parser)]
#[command(name = "setupctl")]
#[command(about = "Setup lifecycle decision engine CLI")]
pub struct Cli {
    #[arg(long, default_value = "./setup_lifecycle.sqlite3")]
    db: PathBuf,

    /// JSON engine settings file; defaults apply when omitted.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter, e.g. `info` or `setup_lifecycle_core=debug`. Overrides `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Setup {
        #[command(subcommand)]
        command: Box<SetupCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SetupCommand {
    /// Evaluate a request against stored state and record the decision.
    Evaluate(EvaluateArgs),
    /// Evaluate a request without touching the database.
    Preview(PreviewArgs),
    Show(ShowArgs),
    List(ListArgs),
    Transitions(TransitionsArgs),
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    #[arg(long)]
    workspace: String,
    #[arg(long)]
    symbol: String,
    /// Request JSON file, or `-` for stdin.
    #[arg(long)]
    request: String,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    /// Request JSON file, or `-` for stdin.
    #[arg(long)]
    request: String,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// `<workspace_id>:<symbol>:<playbook>:<direction>`
    #[arg(long)]
    key: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    workspace: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TransitionsArgs {
    #[arg(long)]
    workspace: String,
    #[arg(long)]
    symbol: String,
    #[arg(long)]
    playbook: Option<String>,
    #[arg(long)]
    direction: Option<DirectionArg>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    Status(LedgerStatusArgs),
    Check(LedgerCheckArgs),
    Drift(LedgerDriftArgs),
}

#[derive(Debug, Args)]
pub struct LedgerStatusArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LedgerCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LedgerDriftArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Long,
    Short,
}

impl From<DirectionArg> for Direction {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Long => Self::Long,
            DirectionArg::Short => Self::Short,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when settings loading, migration, or command execution
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.settings.as_deref())?;
    match cli.command {
        Command::Setup { command } => run_setup_with_db(&cli.db, *command, &settings),
    }
}

/// Executes a parsed setup command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_setup_with_db(
    db_path: &Path,
    command: SetupCommand,
    settings: &EngineSettings,
) -> Result<()> {
    match command {
        SetupCommand::Preview(args) => run_preview(&args, settings),
        setup_command => {
            let mut store = SqliteDecisionStore::open(db_path)?;
            store.migrate()?;
            run_setup(setup_command, &mut store, settings)
        }
    }
}

/// Executes a parsed setup command against an existing store handle.
///
/// # Errors
/// Returns an error when request validation or store reads fail. A failed
/// write during `evaluate` is reported in the printed decision instead.
pub fn run_setup(
    command: SetupCommand,
    store: &mut SqliteDecisionStore,
    settings: &EngineSettings,
) -> Result<()> {
    match command {
        SetupCommand::Evaluate(args) => {
            let request = read_request(&args.request)?;
            let key = SetupKey::new(
                &args.workspace,
                &args.symbol,
                &request.playbook,
                request.direction,
            )
            .map_err(|err| anyhow!(err.to_string()))?;

            let recorded = evaluate_and_record(store, &key, &request, settings)
                .map_err(|err| anyhow!(err.to_string()))?;
            if let PersistenceStatus::Persisted {
                revision, attempts, ..
            } = &recorded.persistence
            {
                tracing::debug!(key = %key, revision, attempts, "decision recorded");
            }
            println!("{}", serde_json::to_string_pretty(&recorded)?);
            Ok(())
        }
        SetupCommand::Preview(args) => run_preview(&args, settings),
        SetupCommand::Show(args) => {
            let key = parse_setup_key(&args.key).map_err(|err| anyhow!(err.to_string()))?;
            let Some(record) = store.load_latest(&key)? else {
                return Err(anyhow!("state record not found for key {key}"));
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        SetupCommand::List(args) => {
            let rows = store.list_workspace_states(&args.workspace, args.limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_state_table(&rows);
            }
            Ok(())
        }
        SetupCommand::Transitions(args) => {
            let query = TransitionQuery {
                workspace_id: args.workspace,
                symbol: args.symbol,
                playbook: args.playbook,
                direction: args.direction.map(Direction::from),
                limit: args.limit,
            };
            let rows = store.query_transitions(&query)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_transition_table(&rows);
            }
            Ok(())
        }
        SetupCommand::Ledger { command } => run_ledger(*command, store),
    }
}

fn run_preview(args: &PreviewArgs, settings: &EngineSettings) -> Result<()> {
    let request = read_request(&args.request)?;
    let output = evaluate(&request, settings).map_err(|err| anyhow!(err.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_ledger(command: LedgerCommand, store: &SqliteDecisionStore) -> Result<()> {
    match command {
        LedgerCommand::Status(args) => {
            let status = store.ledger_status()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_ledger_status(&status);
            }
            Ok(())
        }
        LedgerCommand::Check(args) => {
            let check = store.ledger_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_ledger_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "ledger consistency check failed: {}",
                    check
                        .issues
                        .iter()
                        .filter(|item| item.severity == LedgerIssueSeverity::Error)
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
        LedgerCommand::Drift(args) => {
            let drift = store.ledger_drift_keys(args.limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&drift)?);
            } else {
                print_drift_keys(&drift);
            }
            Ok(())
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<EngineSettings> {
    let Some(path) = path else {
        return Ok(EngineSettings::v1());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("settings file must be valid JSON: {}", path.display()))?;
    EngineSettings::from_json(&value).map_err(|err| anyhow!(err.to_string()))
}

fn read_request(source: &str) -> Result<EvaluationRequest> {
    let raw = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read request from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("failed to read request file {source}"))?
    };

    EvaluationRequest::from_json_str(&raw).map_err(|err| anyhow!(err.to_string()))
}

fn print_state_table(rows: &[StateMachineRecord]) {
    println!(
        "{:<40} {:<9} {:<9} {:<25} {:<6} reason",
        "key", "state", "previous", "state_since", "brain"
    );
    println!("{}", "-".repeat(120));
    for row in rows {
        println!(
            "{:<40} {:<9} {:<9} {:<25} {:<6.1} {}",
            row.key.to_string(),
            row.state.as_str(),
            row.previous_state.map_or("-", SetupState::as_str),
            row.state_since,
            row.brain_score,
            row.last_transition_reason
        );
    }
}

fn print_transition_table(rows: &[TransitionRecord]) {
    println!(
        "{:<8} {:<25} {:<18} {:<9} {:<9} {:<7} reason",
        "seq", "emitted_at", "event", "old", "new", "changed"
    );
    println!("{}", "-".repeat(120));
    for row in rows {
        let emitted_at = setup_lifecycle_core::format_rfc3339(row.emitted_at)
            .unwrap_or_else(|_| "invalid".to_string());
        println!(
            "{:<8} {:<25} {:<18} {:<9} {:<9} {:<7} {}",
            row.transition_seq,
            emitted_at,
            row.event_type.as_str(),
            row.old_state.as_str(),
            row.new_state.as_str(),
            if row.changed { "yes" } else { "no" },
            row.transition_reason
        );
    }
}

fn print_ledger_status(status: &LedgerStatus) {
    println!(
        "contract={} state_rows={} transition_rows={} latest_transition_seq={}",
        status.contract_version,
        status.state_rows,
        status.transition_rows,
        status.latest_transition_seq
    );
    println!(
        "states_without_transitions={} state_drift_keys={} revision_gap_keys={}",
        status.states_without_transitions, status.state_drift_keys, status.revision_gap_keys
    );
}

fn print_ledger_check(check: &LedgerCheck) {
    println!("contract={}", check.contract_version);
    print_ledger_status(&check.status);
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    LedgerIssueSeverity::Warning => "warning",
                    LedgerIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
        println!("hint=run `setupctl setup ledger drift --json` for affected keys");
    }
}

fn print_drift_keys(drift: &[LedgerDriftKey]) {
    println!(
        "{:<40} {:<9} {:<8} {:<11} transitions",
        "key", "state", "revision", "latest"
    );
    println!("{}", "-".repeat(90));
    for item in drift {
        println!(
            "{:<40} {:<9} {:<8} {:<11} {}",
            item.key.to_string(),
            item.state.as_str(),
            item.revision,
            item.latest_transition_state.map_or("none", SetupState::as_str),
            item.transition_count
        );
    }
}
