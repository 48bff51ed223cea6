use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use dicomnet::logging::init_logging;
use dicomnet::{
    Config, ConnectionPool, EchoService, EventBus, LocalIdentity, OperationOutcome,
    OperationRunner, OperationTask, Peer, PeerDirectory, QueryFilter, QueryService, RetrieveService,
    StorageListener, StoreService, TracingSink,
};
use dimse::{DimseEngine, UlEngine};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dicomnet", about = "DICOM network client and storage listener")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "dicomnet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Verify connectivity with C-ECHO
    Echo { peer: String },
    /// Find studies with C-FIND
    Find {
        peer: String,
        #[arg(long)]
        patient_name: Option<String>,
        #[arg(long)]
        patient_id: Option<String>,
        #[arg(long)]
        study_date: Option<String>,
        #[arg(long)]
        modality: Option<String>,
        #[arg(long, default_value_t = 100)]
        max_results: usize,
    },
    /// List the series of a study with C-FIND
    Series { peer: String, study_uid: String },
    /// Retrieve a study (or one series) with C-MOVE
    Move {
        peer: String,
        study_uid: String,
        #[arg(long)]
        series_uid: Option<String>,
    },
    /// Send files or directories with C-STORE
    Store {
        peer: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Run the storage listener until interrupted
    Listen,
}

fn find_peer(config: &Config, id: &str) -> anyhow::Result<Peer> {
    config
        .find_peer(id)
        .ok_or_else(|| anyhow!("no peer '{}' in the configuration", id))
}

/// Wait for `task`, cancelling it on Ctrl-C
async fn run_until_done<T: Send + 'static>(task: OperationTask<T>) -> anyhow::Result<T> {
    let token = task.token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    let result = task.join().await;
    interrupt.abort();
    Ok(result?)
}

/// Start a listener for C-MOVE sub-operations, if storage is enabled.
///
/// When the port is taken (say by a running `listen`) the move goes ahead
/// and that process receives the instances.
fn receiving_listener(
    engine: &Arc<dyn DimseEngine>,
    local: &LocalIdentity,
    events: &Arc<EventBus>,
) -> Option<StorageListener> {
    if !local.storage_enabled {
        warn!(
            port = local.storage_port,
            "Storage is disabled; moved instances go to whoever listens on the port"
        );
        return None;
    }
    let listener = StorageListener::new(engine.clone(), local.clone(), events.clone())
        .with_callback(Arc::new(|path: &Path| println!("{}", path.display())));
    if listener.start() {
        Some(listener)
    } else {
        warn!(port = local.storage_port, "Could not start a storage listener");
        None
    }
}

/// Stop `listener` off the async runtime and return how many instances it stored
async fn stop_listener(listener: StorageListener) -> anyhow::Result<usize> {
    let received = tokio::task::spawn_blocking(move || {
        listener.stop();
        listener.received_count()
    })
    .await?;
    Ok(received)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn finish(outcome: &OperationOutcome) -> anyhow::Result<()> {
    if outcome.is_success() {
        Ok(())
    } else {
        bail!("{}: {}", outcome.status, outcome.last_error)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config.logging)?;

    let events = Arc::new(EventBus::new());
    events.subscribe(Arc::new(TracingSink));
    let engine: Arc<dyn DimseEngine> = Arc::new(UlEngine::new());
    let pool = Arc::new(ConnectionPool::new(engine.clone(), config.pool.clone()));
    let runner = OperationRunner::current(config.local.max_connections as usize);
    let local = config.local_identity();

    let result = match cli.cmd {
        Cmd::Echo { peer } => {
            let peer = find_peer(&config, &peer)?;
            let service = EchoService::new(pool.clone(), events.clone());
            let timeout = peer.timeout();
            let task = runner.spawn("echo", move |_| service.perform_echo(&peer, &local, timeout));
            let outcome = run_until_done(task).await?;
            print_json(&serde_json::json!({ "outcome": outcome }))?;
            finish(&outcome)
        }
        Cmd::Find {
            peer,
            patient_name,
            patient_id,
            study_date,
            modality,
            max_results,
        } => {
            let peer = find_peer(&config, &peer)?;
            let filter = QueryFilter {
                patient_name: patient_name.unwrap_or_default(),
                patient_id: patient_id.unwrap_or_default(),
                study_date: study_date.unwrap_or_default(),
                modality: modality.unwrap_or_default(),
                max_results,
                ..QueryFilter::default()
            };
            let service = Arc::new(QueryService::new(pool.clone(), events.clone()));
            let task = runner.spawn_service("find", service, move |s| {
                s.query_studies(&peer, &local, &filter, None)
            });
            let (outcome, studies) = run_until_done(task).await?;
            print_json(&serde_json::json!({ "outcome": outcome, "studies": studies }))?;
            finish(&outcome)
        }
        Cmd::Series { peer, study_uid } => {
            let peer = find_peer(&config, &peer)?;
            let service = Arc::new(QueryService::new(pool.clone(), events.clone()));
            let task = runner.spawn_service("series", service, move |s| {
                s.query_series(&peer, &local, &study_uid, None)
            });
            let (outcome, series) = run_until_done(task).await?;
            print_json(&serde_json::json!({ "outcome": outcome, "series": series }))?;
            finish(&outcome)
        }
        Cmd::Move {
            peer,
            study_uid,
            series_uid,
        } => {
            let peer = find_peer(&config, &peer)?;
            // instances arrive over separate associations to our own SCP
            let listener = receiving_listener(&engine, &local, &events);
            let service = Arc::new(RetrieveService::new(pool.clone(), events.clone()));
            let task = runner.spawn_service("move", service, move |s| {
                let mut report = |p: f32| info!("Retrieve progress {:.0}%", p * 100.0);
                match series_uid {
                    Some(series) => {
                        s.retrieve_series(&peer, &local, &study_uid, &series, Some(&mut report))
                    }
                    None => s.retrieve_study(&peer, &local, &study_uid, Some(&mut report)),
                }
            });
            let outcome = run_until_done(task).await?;
            let received = match listener {
                Some(listener) => Some(stop_listener(listener).await?),
                None => None,
            };
            print_json(&serde_json::json!({ "outcome": outcome, "received": received }))?;
            finish(&outcome)
        }
        Cmd::Store { peer, paths } => {
            let peer = find_peer(&config, &peer)?;
            let service = Arc::new(StoreService::new(pool.clone(), events.clone()));
            let task = runner.spawn_service("store", service, move |s| {
                let mut report = |p: f32| info!("Store progress {:.0}%", p * 100.0);
                s.store_paths(&peer, &local, &paths, Some(&mut report))
            });
            let report = run_until_done(task).await?;
            print_json(&serde_json::to_value(&report)?)?;
            finish(&report.outcome)
        }
        Cmd::Listen => {
            let listener = StorageListener::new(engine.clone(), local, events.clone())
                .with_callback(Arc::new(|path: &Path| println!("{}", path.display())));
            if !listener.start() {
                bail!("storage listener could not be started");
            }
            tokio::signal::ctrl_c().await?;
            info!("Interrupted, stopping storage listener");
            let received = stop_listener(listener).await?;
            info!("Received {} instances", received);
            Ok(())
        }
    };

    pool.clear();
    result
}
