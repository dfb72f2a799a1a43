//! Embeddable `tl` command surface.
//!
//! Hosts embed the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for a parsed [`Command`] against a DB path.
//! - [`run_command`] for a parsed [`Command`] against an open store.
//!
//! Successful commands print one JSON document to stdout. Failures are
//! rendered by [`error_envelope`]; logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use trip_ledger_core::{
    derive_travel_reference, validate_all_trip_boundaries, ConfigError, DocDate,
    ErrorKind, ExpenseLinkingService, LedgerConfig, LinkOutcome, LinkTarget, LinkingError,
    NewTrip, SplitMode, StoreError, TravelItemKind, TripBlobStore, TripId, TripUpdate,
    UnifiedDataStore, UpdateError, ValidationError,
};
use trip_ledger_store_sqlite::SqliteTripStore;

#[derive(Debug, Parser)]
#[command(name = "tl")]
#[command(about = "Trip ledger: versioned trip documents and expense links")]
pub struct Cli {
    #[arg(long, env = "TRIP_LEDGER_DB", default_value = "./trip_ledger.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "TRIP_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Trip {
        #[command(subcommand)]
        command: Box<TripCommand>,
    },
    Link {
        #[command(subcommand)]
        command: Box<LinkCommand>,
    },
    CleanupLog {
        #[command(subcommand)]
        command: CleanupLogCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum TripCommand {
    Create(CreateArgs),
    Show(TripArgs),
    List,
    /// Import a raw stored document as-is; it is migrated on first load
    Import(ImportArgs),
    Migrate(MigrateArgs),
    Validate(TripArgs),
    Patch(PatchArgs),
}

#[derive(Debug, Args)]
pub struct TripArgs {
    #[arg(long)]
    trip: String,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    start_date: Option<String>,
    #[arg(long)]
    end_date: Option<String>,
    #[arg(long, default_value = "")]
    currency: String,
    #[arg(long, default_value_t = 0.0)]
    budget: f64,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    trip: Option<String>,
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Args)]
pub struct PatchArgs {
    #[arg(long)]
    trip: String,
    #[arg(long, conflicts_with = "update_file", required_unless_present = "update_file")]
    update_json: Option<String>,
    #[arg(long)]
    update_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum LinkCommand {
    /// Link an expense to exactly one travel item, replacing earlier links
    Set(LinkSetArgs),
    /// Split an expense across several travel items
    Split(LinkSplitArgs),
    Remove(ExpenseArgs),
    Show(ExpenseArgs),
}

#[derive(Debug, Args)]
pub struct ExpenseArgs {
    #[arg(long)]
    trip: String,
    #[arg(long)]
    expense: String,
}

#[derive(Debug, Args)]
pub struct LinkSetArgs {
    #[arg(long)]
    trip: String,
    #[arg(long)]
    expense: String,
    #[arg(long)]
    kind: ItemKindArg,
    #[arg(long)]
    item: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    split_mode: Option<SplitModeArg>,
    #[arg(long)]
    split_value: Option<f64>,
}

#[derive(Debug, Args)]
pub struct LinkSplitArgs {
    #[arg(long)]
    trip: String,
    #[arg(long)]
    expense: String,
    /// JSON array of `{kind, itemId, description?, splitMode?, splitValue?}`
    #[arg(long)]
    targets_json: String,
}

#[derive(Debug, Subcommand)]
pub enum CleanupLogCommand {
    List(TripArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ItemKindArg {
    Location,
    Route,
    Accommodation,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SplitModeArg {
    Equal,
    Percentage,
    Fixed,
}

/// Installs the stderr log subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "trip_ledger_core=info,trip_ledger_store_sqlite=info,trip_ledger_cli=info",
        )
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes a fully parsed CLI invocation.
///
/// # Errors
/// Returns an error when config loading, store open/migrate, or the requested
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    run_command_with_db(&cli.db, config, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, config: LedgerConfig, command: Command) -> Result<()> {
    let backend = SqliteTripStore::open(db_path)?;
    backend.migrate()?;
    tracing::debug!(db = %db_path.display(), "trip store ready");
    let mut store = UnifiedDataStore::new(backend, config);
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input parsing, validation, linking, or persistence fails.
pub fn run_command<S: TripBlobStore>(command: Command, store: &mut UnifiedDataStore<S>) -> Result<()> {
    match command {
        Command::Trip { command } => run_trip(*command, store),
        Command::Link { command } => run_link(*command, store),
        Command::CleanupLog {
            command: CleanupLogCommand::List(args),
        } => {
            let trip_id = parse_trip_id(&args.trip)?;
            let entries = store.cleanup_log(&trip_id)?;
            print_json(&json!({"tripId": trip_id, "entries": entries}))
        }
    }
}

fn run_trip<S: TripBlobStore>(command: TripCommand, store: &mut UnifiedDataStore<S>) -> Result<()> {
    match command {
        TripCommand::Create(args) => {
            let doc = store.create_trip(NewTrip {
                title: args.title,
                description: args.description,
                start_date: args.start_date.as_deref().map(DocDate::revive),
                end_date: args.end_date.as_deref().map(DocDate::revive),
                currency: args.currency,
                overall_budget: args.budget,
            })?;
            print_json(&doc)
        }
        TripCommand::Show(args) => {
            let doc = store.load(&parse_trip_id(&args.trip)?)?;
            print_json(&doc)
        }
        TripCommand::List => print_json(&store.list_trips()?),
        TripCommand::Import(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let body: Value = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", args.file.display()))?;
            let trip_id = body
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("imported document needs a string id"))
                .and_then(parse_trip_id)?;
            let version = store.backend_mut().write(&trip_id, &body, None)?;
            print_json(&json!({"tripId": trip_id, "documentVersion": version}))
        }
        TripCommand::Migrate(args) => {
            let trip_ids = match args.trip {
                Some(raw) => vec![parse_trip_id(&raw)?],
                None => store.backend().trip_ids()?,
            };
            let mut reports = Vec::with_capacity(trip_ids.len());
            for trip_id in &trip_ids {
                reports.push(store.migrate_trip(trip_id)?);
            }
            print_json(&reports)
        }
        TripCommand::Validate(args) => {
            let doc = store.load(&parse_trip_id(&args.trip)?)?;
            print_json(&validate_all_trip_boundaries(&doc))
        }
        TripCommand::Patch(args) => {
            let raw = match (args.update_json, args.update_file) {
                (Some(raw), _) => raw,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => return Err(anyhow!("either --update-json or --update-file is required")),
            };
            let update: TripUpdate =
                serde_json::from_str(&raw).context("invalid trip update payload")?;
            let outcome = store.apply_update(&parse_trip_id(&args.trip)?, &update)?;
            print_json(&json!({
                "written": outcome.written,
                "sweep": outcome.sweep,
                "document": outcome.document,
            }))
        }
    }
}

fn run_link<S: TripBlobStore>(command: LinkCommand, store: &mut UnifiedDataStore<S>) -> Result<()> {
    match command {
        LinkCommand::Set(args) => {
            let target = LinkTarget {
                kind: map_kind(args.kind),
                item_id: args.item,
                description: args.description,
                split_mode: args.split_mode.map(map_split_mode),
                split_value: args.split_value,
            };
            let outcome = ExpenseLinkingService::new(store, parse_trip_id(&args.trip)?)
                .create_or_update_link(&args.expense, &target)?;
            print_link_outcome(&args.expense, &outcome)
        }
        LinkCommand::Split(args) => {
            let targets: Vec<LinkTarget> =
                serde_json::from_str(&args.targets_json).context("invalid --targets-json payload")?;
            let outcome = ExpenseLinkingService::new(store, parse_trip_id(&args.trip)?)
                .create_multiple_links(&args.expense, &targets)?;
            print_link_outcome(&args.expense, &outcome)
        }
        LinkCommand::Remove(args) => {
            let outcome = ExpenseLinkingService::new(store, parse_trip_id(&args.trip)?)
                .remove_link(&args.expense)?;
            print_link_outcome(&args.expense, &outcome)
        }
        LinkCommand::Show(args) => {
            let trip_id = parse_trip_id(&args.trip)?;
            let links = ExpenseLinkingService::new(store, trip_id.clone())
                .expense_links(&args.expense)?;
            let doc = store.load(&trip_id)?;
            print_json(&json!({
                "tripId": trip_id,
                "expenseId": args.expense,
                "links": links,
                "travelReference": derive_travel_reference(&doc, &args.expense),
            }))
        }
    }
}

fn print_link_outcome(expense_id: &str, outcome: &LinkOutcome) -> Result<()> {
    print_json(&json!({
        "tripId": outcome.document.id,
        "expenseId": expense_id,
        "documentVersion": outcome.document.document_version,
        "replaced": outcome.replaced,
        "links": outcome.links,
        "travelReference": derive_travel_reference(&outcome.document, expense_id),
        "sweep": outcome.sweep,
    }))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<LedgerConfig> {
    LedgerConfig::load_or_default(path).map_err(anyhow::Error::from)
}

fn parse_trip_id(raw: &str) -> Result<TripId> {
    TripId::parse(raw).map_err(anyhow::Error::from)
}

fn map_kind(value: ItemKindArg) -> TravelItemKind {
    match value {
        ItemKindArg::Location => TravelItemKind::Location,
        ItemKindArg::Route => TravelItemKind::Route,
        ItemKindArg::Accommodation => TravelItemKind::Accommodation,
    }
}

fn map_split_mode(value: SplitModeArg) -> SplitMode {
    match value {
        SplitModeArg::Equal => SplitMode::Equal,
        SplitModeArg::Percentage => SplitMode::Percentage,
        SplitModeArg::Fixed => SplitMode::Fixed,
    }
}

/// Classifies a command failure onto the ledger error taxonomy.
#[must_use]
pub fn classify_error(err: &anyhow::Error) -> (ErrorKind, Vec<ValidationError>) {
    if let Some(err) = err.downcast_ref::<LinkingError>() {
        return (err.kind(), err.details());
    }
    if let Some(err) = err.downcast_ref::<UpdateError>() {
        let details = match err {
            UpdateError::Boundary(result) => result.errors.clone(),
            UpdateError::Store(_) => Vec::new(),
        };
        return (err.kind(), details);
    }
    if let Some(err) = err.downcast_ref::<StoreError>() {
        return (err.kind(), Vec::new());
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return (ErrorKind::ValidationError, Vec::new());
    }
    if err.chain().any(|cause| cause.is::<rusqlite::Error>()) {
        return (ErrorKind::StoreError, Vec::new());
    }
    (ErrorKind::ValidationError, Vec::new())
}

/// Caller-facing failure payload:
/// `{"error": {"kind", "status", "message", "details": [ValidationError]}}`.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    let (kind, details) = classify_error(err);
    json!({
        "error": {
            "kind": kind,
            "status": kind.status().http_status(),
            "message": format!("{err:#}"),
            "details": details,
        }
    })
}
