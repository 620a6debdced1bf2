use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::mpsc;

use fortune_sync::api::HttpBackend;
use fortune_sync::cli::Cli;
use fortune_sync::config::Config;
use fortune_sync::connection::ConnectionStateMachine;
use fortune_sync::monitor::{ConnectivityMonitor, InterfaceWatcher};
use fortune_sync::notify::{Notice, NotificationSink};
use fortune_sync::queue::{default_database_path, OfflineQueue, OperationKind, SyncQueueRecord};
use fortune_sync::store::LocalStore;
use fortune_sync::sync::SyncReconciler;

struct App {
    machine: Arc<ConnectionStateMachine>,
    store: Arc<LocalStore>,
}

impl App {
    fn build(cli: &Cli, config: &Config) -> Result<Self> {
        let db_path = match &cli.database {
            Some(path) => Config::resolve_config_path(path)?,
            None => match config.get_database_path()? {
                Some(path) => path,
                None => default_database_path()?,
            },
        };
        tracing::debug!("Using offline database at {}", db_path.display());

        let mut backend =
            HttpBackend::new(config.get_api_url())?.with_probe_path(config.get_probe_path());
        if let Some(key) = config.get_api_key(cli.key.as_ref()) {
            backend = backend.with_api_key(key);
        }
        let backend = Arc::new(backend);

        let queue = Arc::new(OfflineQueue::with_path(&db_path)?);
        let store = Arc::new(LocalStore::with_path(&db_path)?);
        let sink = NotificationSink::new();
        let reconciler = Arc::new(
            SyncReconciler::new(queue, backend.clone(), sink.clone()).with_store(Arc::clone(&store)),
        );
        let machine =
            ConnectionStateMachine::new(config.connection.clone(), backend, reconciler, sink);

        Ok(Self { machine, store })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("fortune-sync v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        process::exit(1);
    });
    if let Some(api_url) = &cli.api_url {
        config.api_url = Some(api_url.clone());
    }

    // Exported queue documents go to stdout and must stay parseable.
    let json_output = cli.json_output() || cli.export_queue;
    let _guard = fortune_sync::logger::setup_logging_with_output_format(
        cli.verbose || config.debug,
        json_output,
    )
    .unwrap_or_else(|e| {
        eprintln!("Failed to setup logging: {}", e);
        process::exit(1);
    });

    let has_command = cli.probe
        || cli.status
        || cli.sync
        || cli.watch
        || cli.export_queue
        || cli.enqueue.is_some()
        || cli.import_queue.is_some();
    if !has_command {
        Cli::command().print_help()?;
        return Ok(());
    }

    let app = App::build(&cli, &config).unwrap_or_else(|e| {
        eprintln!("Failed to initialize: {:#}", e);
        process::exit(1);
    });

    let outcome = if let Some(kind) = &cli.enqueue {
        enqueue(&app, &cli, kind)
    } else if let Some(file) = &cli.import_queue {
        import_queue(&app, &cli, file)
    } else if cli.export_queue {
        export_queue(&app)
    } else if cli.probe {
        probe(&app, &cli).await
    } else if cli.status {
        status(&app, &cli).await
    } else if cli.sync {
        sync(&app, &cli).await
    } else {
        watch(&app, &config).await
    };

    if let Err(e) = outcome {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
    Ok(())
}

fn enqueue(app: &App, cli: &Cli, kind: &str) -> Result<()> {
    let kind: OperationKind = kind.parse()?;
    let payload: serde_json::Value = serde_json::from_str(cli.payload.as_deref().unwrap_or("{}"))
        .context("Payload is not valid JSON")?;

    let id = app.machine.queue().enqueue(kind, payload)?;

    if cli.json_output() {
        println!("{}", json!({ "id": id, "kind": kind }));
    } else {
        println!("Queued {} as {}", kind, id);
    }
    Ok(())
}

fn import_queue(app: &App, cli: &Cli, file: &str) -> Result<()> {
    let path = PathBuf::from(file);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let records: Vec<SyncQueueRecord> =
        serde_json::from_str(&contents).context("Expected a JSON array of queue records")?;

    let imported = app.machine.queue().import_records(&records)?;

    if cli.json_output() {
        println!("{}", json!({ "imported": imported }));
    } else {
        println!("Imported {} queued write(s)", imported);
    }
    Ok(())
}

fn export_queue(app: &App) -> Result<()> {
    let records = app.machine.queue().export_records()?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn probe(app: &App, cli: &Cli) -> Result<()> {
    let Some(result) = app.machine.test_connection().await else {
        anyhow::bail!("A probe is already in flight");
    };

    if cli.json_output() {
        println!("{}", serde_json::to_string(&result)?);
    } else if result.success {
        println!(
            "Backend reachable ({} ms)",
            result.latency_ms.unwrap_or_default()
        );
        if let Some(error) = &result.error {
            println!("  Application error: {}", error);
        }
    } else {
        println!(
            "Backend unreachable: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    if !result.success {
        process::exit(2);
    }
    Ok(())
}

async fn status(app: &App, cli: &Cli) -> Result<()> {
    app.machine.test_connection().await;
    let state = app.machine.state();
    let stats = app.machine.queue().stats()?;
    let last_sync = app.store.last_sync()?;

    if cli.json_output() {
        let report = json!({
            "phase": state.phase(),
            "state": state,
            "queue": stats,
            "last_sync": last_sync,
        });
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    println!("Connection: {}", state.phase());
    println!("  Online: {}", state.is_online);
    println!("  Service reachable: {}", state.is_service_reachable);
    println!("  Consecutive failures: {}", state.consecutive_failures);
    println!("Offline queue:");
    println!("  Total: {}", stats.total_count);
    for (kind, count) in &stats.by_kind {
        println!("  {}: {}", kind, count);
    }
    if let Some(oldest) = stats.oldest_entry {
        println!("  Oldest: {}", oldest.to_rfc3339());
    }
    if last_sync > 0 {
        match chrono::DateTime::from_timestamp_millis(last_sync) {
            Some(at) => println!("Last sync: {}", at.to_rfc3339()),
            None => println!("Last sync: {}", last_sync),
        }
    } else {
        println!("Last sync: never");
    }
    Ok(())
}

async fn sync(app: &App, cli: &Cli) -> Result<()> {
    let outcome = app.machine.force_reconnect().await?;

    if cli.json_output() {
        let report = json!({
            "probe": outcome.probe,
            "sync": outcome.sync,
        });
        println!("{}", serde_json::to_string(&report)?);
    } else if !outcome.probe.success {
        println!(
            "Backend unreachable: {}",
            outcome.probe.error.as_deref().unwrap_or("unknown error")
        );
    } else {
        match &outcome.sync {
            Some(result) => {
                println!("Sync completed:");
                println!("  Synced: {}", result.synced_count);
                println!("  Failed: {}", result.failed_count);
                println!("  Remaining: {}", result.remaining);
                println!("  Duration: {:?}", result.duration);
            }
            None => println!("Sync completed: nothing queued"),
        }
    }

    if !outcome.probe.success {
        process::exit(2);
    }
    Ok(())
}

async fn watch(app: &App, config: &Config) -> Result<()> {
    let machine = &app.machine;

    let _states = machine.sink().subscribe(|state| {
        println!(
            "[{}] {} (failures: {})",
            chrono::Local::now().format("%H:%M:%S"),
            state.phase(),
            state.consecutive_failures
        );
    });
    let _notices = machine.sink().subscribe_notices(|notice| match notice {
        Notice::OfflineModeEntered {
            consecutive_failures,
        } => println!(
            "Offline mode: {} failed probes, writes will be queued",
            consecutive_failures
        ),
        Notice::Reconnected => println!("Reconnected"),
        Notice::SyncCompleted { synced, remaining } => {
            println!("Synced {} queued write(s), {} remaining", synced, remaining)
        }
        Notice::Error { message } => println!("Error: {}", message),
    });

    let (tx, rx) = mpsc::channel(16);
    ConnectivityMonitor::new(Arc::clone(machine)).spawn(rx);
    machine.track_task(InterfaceWatcher::new(config.interface_poll_interval).spawn(tx));
    machine.start();

    tracing::info!("Watching connectivity, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    machine.stop();
    Ok(())
}
