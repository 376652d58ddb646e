use anyhow::Result;
use errorvault_agent::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

async fn open_store(config: &config::StoreConfig) -> Result<Arc<dyn store::KvStore>> {
    Ok(match &config.path {
        Some(path) => {
            let sqlite = store::SqliteStore::connect(path).await?;
            sqlite.init().await?;
            tracing::info!(path = %path, "Using SQLite store");
            Arc::new(sqlite)
        }
        None => {
            tracing::info!("Using in-memory store; state is lost on restart");
            Arc::new(store::MemoryStore::new())
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!(agent = %version::user_agent(), "Starting");

    let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);
    let store = open_store(&app_config.store).await?;
    let collector = Arc::new(collector::CollectorClient::new(&app_config.collector)?);
    if !collector.is_configured() {
        tracing::warn!("collector.base_url or collector.api_token missing; nothing will be sent");
    }

    let probe: Arc<dyn sysinfo_repo::HostProbe> =
        Arc::new(sysinfo_repo::SysinfoRepo::new(&app_config.health));
    let health = Arc::new(health::HealthMonitor::new(
        app_config.health.clone(),
        store.clone(),
        probe,
        collector.clone(),
        clock.clone(),
    ));
    let exporter: Arc<dyn backup::Exporter> = Arc::new(backup::CommandExporter::new(
        app_config.backup.export_command.clone(),
    ));
    let backup = Arc::new(backup::BackupOrchestrator::new(
        app_config.backup.clone(),
        store.clone(),
        collector.clone(),
        exporter,
    ));
    let connectivity = Arc::new(connectivity::ConnectivityMonitor::new(
        store.clone(),
        collector.clone(),
        clock.clone(),
        Arc::new(connectivity::LogNotifier),
        app_config.connectivity.failure_threshold,
    ));

    let error_reporter = Arc::new(error_capture::ErrorReporter::new(
        app_config.errors.clone(),
        collector.clone(),
    ));
    let mut error_chain = error_capture::HandlerChain::new();
    error_chain.push(Arc::new(error_capture::LogHandler));
    error_chain.push(Arc::new(error_capture::CaptureHandler::new(
        app_config.errors.clone(),
        error_reporter.clone(),
        serde_json::json!({ "agent_version": version::VERSION }),
    )));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let worker_handle = worker::spawn(
        worker::WorkerDeps {
            health: health.clone(),
            backup: backup.clone(),
            connectivity: connectivity.clone(),
            error_reporter: error_reporter.clone(),
            store: store.clone(),
            shutdown_rx,
        },
        worker::WorkerConfig {
            health_check_interval_secs: app_config.health.check_interval_secs,
            report_interval_secs: app_config.health.report_interval_secs,
            backup_enabled: app_config.backup.enabled,
            backup_poll_interval_secs: app_config.backup.poll_interval_secs,
            ping_interval_secs: app_config.connectivity.ping_interval_secs,
            error_flush_interval_secs: app_config.errors.flush_interval_secs,
            prune_interval_secs: app_config.store.prune_interval_secs,
        },
    );

    let app = routes::app(routes::AppState {
        health,
        backup,
        connectivity,
        collector,
        error_chain: Arc::new(error_chain),
    });
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => {
                        let _ = tokio::signal::ctrl_c().await;
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        } => {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
            let _ = worker_handle.await;
        }
    }

    Ok(())
}
