//! Outbox CLI - Command line interface for the offline action queue.
//!
//! This tool inspects and edits a persisted queue of pending actions and
//! can replay it against a REST endpoint.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use outbox_common::ActionId;
use outbox_storage::create_default_registry;
use outbox_sync::{
    ActionKind, ActionStore, ConnectivityGate, HttpRemote, PassOutcome, PendingAction,
    RemoteExecutor, SyncConfig, SyncEngine,
};

#[derive(Parser)]
#[command(name = "outbox")]
#[command(about = "Outbox - Offline mutation queue")]
#[command(version)]
struct Cli {
    /// Directory holding the persisted queue.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// JSON sync configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending actions in replay order.
    List,

    /// Queue a record mutation.
    Enqueue {
        /// Entity type the action targets.
        #[arg(short, long)]
        entity: String,

        /// Mutation kind: create, update or delete.
        #[arg(short, long)]
        kind: ActionKind,

        /// Record identifier (required for update and delete).
        #[arg(short, long)]
        record_id: Option<String>,

        /// Field assignment as key=value; values are parsed as JSON when possible.
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,
    },

    /// Queue an asset upload.
    Upload {
        /// Entity type the asset belongs to.
        #[arg(short, long)]
        entity: String,

        /// Local file to upload.
        #[arg(short, long)]
        file: PathBuf,

        /// Remote destination path.
        #[arg(short, long)]
        target: String,

        /// MIME type of the file.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Remove one pending action.
    Remove {
        /// Action id.
        #[arg(long)]
        id: String,
    },

    /// Drop every pending action.
    Clear,

    /// Show or manage dead-lettered actions.
    DeadLetters {
        /// Move a dead-lettered action back to the end of the queue.
        #[arg(long, conflicts_with = "clear")]
        requeue: Option<String>,

        /// Drop every dead-lettered action.
        #[arg(long)]
        clear: bool,
    },

    /// Show queue status.
    Status,

    /// Replay the queue against a REST endpoint.
    Sync {
        /// Base URL of the remote API.
        #[arg(short, long)]
        endpoint: Url,

        /// Bearer token sent with every request.
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let store = open_store(&data_dir, &config)?;

    match cli.command {
        Commands::List => cmd_list(&store).await,

        Commands::Enqueue {
            entity,
            kind,
            record_id,
            fields,
        } => cmd_enqueue(&store, entity, kind, record_id, fields).await,

        Commands::Upload {
            entity,
            file,
            target,
            content_type,
        } => cmd_upload(&store, entity, &file, target, content_type).await,

        Commands::Remove { id } => cmd_remove(&store, &id).await,

        Commands::Clear => cmd_clear(&store).await,

        Commands::DeadLetters { requeue, clear } => {
            cmd_dead_letters(&store, requeue.as_deref(), clear).await
        }

        Commands::Status => cmd_status(&store).await,

        Commands::Sync { endpoint, token } => cmd_sync(store, config, endpoint, token).await,
    }
}

/// Parse a `key=value` field assignment.
fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;

    if key.is_empty() {
        return Err(format!("empty field name in '{}'", raw));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("No data directory on this platform; pass --data-dir")?;
    Ok(base.join("outbox"))
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            SyncConfig::from_json(&raw).context("Invalid sync configuration")
        }
        None => Ok(SyncConfig::default()),
    }
}

fn open_store(data_dir: &Path, config: &SyncConfig) -> Result<Arc<ActionStore>> {
    let registry = create_default_registry();
    let provider_config = serde_json::json!({
        "root": data_dir.to_string_lossy()
    });

    let kv = registry
        .resolve("file", provider_config)
        .context("Failed to open data directory")?;

    Ok(Arc::new(ActionStore::with_keys(
        kv,
        config.queue_key.clone(),
        config.dead_letter_key.clone(),
    )))
}

fn describe(action: &PendingAction) -> String {
    let target = action.record_id.as_deref().unwrap_or("-");
    let asset = if action.is_asset() { " [asset]" } else { "" };
    format!(
        "{}  {:<6} {}/{}{}  ({})",
        action.id,
        action.kind.to_string(),
        action.entity,
        target,
        asset,
        action.enqueued_at
    )
}

/// List pending actions.
async fn cmd_list(store: &ActionStore) -> Result<()> {
    let actions = store.list_all().await.context("Failed to read queue")?;

    if actions.is_empty() {
        println!("Queue is empty.");
    } else {
        println!("{} pending action(s):", actions.len());
        for action in &actions {
            println!("  {}", describe(action));
        }
    }

    Ok(())
}

/// Build a record mutation from command line arguments.
fn build_action(
    entity: String,
    kind: ActionKind,
    record_id: Option<String>,
    fields: Vec<(String, Value)>,
) -> Result<PendingAction> {
    if kind == ActionKind::Delete && !fields.is_empty() {
        anyhow::bail!("--field is not accepted for delete");
    }
    let fields: Map<String, Value> = fields.into_iter().collect();

    let action = match (kind, record_id) {
        (ActionKind::Create, None) => PendingAction::create(entity, fields),
        (ActionKind::Create, Some(id)) => PendingAction::create(entity, fields).with_record_id(id),
        (ActionKind::Update, Some(id)) => PendingAction::update(entity, id, fields),
        (ActionKind::Delete, Some(id)) => PendingAction::delete(entity, id),
        (_, None) => anyhow::bail!("--record-id is required for {}", kind),
    };
    Ok(action)
}

/// Queue a record mutation.
async fn cmd_enqueue(
    store: &ActionStore,
    entity: String,
    kind: ActionKind,
    record_id: Option<String>,
    fields: Vec<(String, Value)>,
) -> Result<()> {
    let action = build_action(entity, kind, record_id, fields)?;

    let id = action.id.clone();
    store
        .enqueue(action)
        .await
        .context("Failed to queue action")?;

    info!("Queued {} action {}", kind, id);
    println!("Queued: {}", id);

    Ok(())
}

/// Queue an asset upload.
async fn cmd_upload(
    store: &ActionStore,
    entity: String,
    file: &Path,
    target: String,
    content_type: Option<String>,
) -> Result<()> {
    let file = std::fs::canonicalize(file)
        .with_context(|| format!("Failed to resolve {}", file.display()))?;

    let mut action = PendingAction::upload_asset(entity, &file, target);
    if let Some(mime) = content_type {
        action = action.with_content_type(mime);
    }

    let id = action.id.clone();
    store
        .enqueue(action)
        .await
        .context("Failed to queue upload")?;

    println!("Queued upload of {}: {}", file.display(), id);

    Ok(())
}

/// Remove one pending action.
async fn cmd_remove(store: &ActionStore, id: &str) -> Result<()> {
    let id = ActionId::parse(id).context("Invalid action id")?;

    if store.get(&id).await?.is_none() {
        println!("No pending action {}", id);
        return Ok(());
    }

    store.remove(&id).await.context("Failed to remove action")?;
    println!("Removed: {}", id);

    Ok(())
}

/// Drop every pending action.
async fn cmd_clear(store: &ActionStore) -> Result<()> {
    let count = store.len().await?;
    store.clear_all().await.context("Failed to clear queue")?;
    println!("Cleared {} pending action(s).", count);
    Ok(())
}

/// Show or manage dead letters.
async fn cmd_dead_letters(store: &ActionStore, requeue: Option<&str>, clear: bool) -> Result<()> {
    if let Some(id) = requeue {
        let id = ActionId::parse(id).context("Invalid action id")?;
        if store.requeue_dead_letter(&id).await? {
            println!("Requeued: {}", id);
        } else {
            println!("No dead-lettered action {}", id);
        }
        return Ok(());
    }

    if clear {
        store
            .clear_dead_letters()
            .await
            .context("Failed to clear dead letters")?;
        println!("Dead letters cleared.");
        return Ok(());
    }

    let dead = store
        .list_dead_letters()
        .await
        .context("Failed to read dead letters")?;

    if dead.is_empty() {
        println!("No dead-lettered actions.");
    } else {
        println!("{} dead-lettered action(s):", dead.len());
        for entry in &dead {
            println!("  {}", describe(&entry.action));
            println!("      {} at {}", entry.reason, entry.dead_lettered_at);
        }
    }

    Ok(())
}

/// Show queue status.
async fn cmd_status(store: &ActionStore) -> Result<()> {
    let actions = store.list_all().await.context("Failed to read queue")?;
    let dead = store.list_dead_letters().await?.len();

    println!("Queue status:");
    println!("  Pending: {}", actions.len());
    println!("  Dead letters: {}", dead);
    if let Some(oldest) = actions.iter().map(|a| a.enqueued_at).min() {
        println!("  Oldest pending: {}", oldest);
    }

    Ok(())
}

/// Replay the queue once.
async fn cmd_sync(
    store: Arc<ActionStore>,
    config: SyncConfig,
    endpoint: Url,
    token: Option<String>,
) -> Result<()> {
    info!("Syncing against {}", endpoint);

    let mut remote = HttpRemote::new(endpoint).context("Failed to set up HTTP client")?;
    if let Some(token) = token {
        remote = remote.with_bearer_token(token);
    }

    let executor = Arc::new(RemoteExecutor::new(Arc::new(remote), &config));
    let gate = ConnectivityGate::new();
    gate.set_online(true);

    let engine = SyncEngine::new(store, gate, executor, config);
    let report = engine
        .run_sync_pass()
        .await
        .context("Sync pass did not run")?;

    match &report.outcome {
        PassOutcome::Drained => println!("Queue drained."),
        PassOutcome::Stopped {
            action_id,
            error,
            dead_lettered,
        } => {
            println!("Stopped at {}: {}", action_id, error);
            if *dead_lettered {
                println!("  Action moved to dead letters.");
            }
        }
        PassOutcome::WentOffline => println!("Connection lost during sync."),
        PassOutcome::StoreFailed { error } => println!("Queue storage failed: {}", error),
    }

    let snapshot = engine.observer().snapshot().await?;
    println!("  Executed: {}", report.executed);
    println!("  Pending: {}", snapshot.pending_count);
    println!("  Dead letters: {}", snapshot.dead_letter_count);
    println!("  Took: {:?}", report.duration);

    Ok(())
}
