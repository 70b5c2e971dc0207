use std::sync::Arc;

use wip_runtime::allocator::ThreadPool;
use wip_runtime::config::{BackendChoice, ServiceConfig};
use wip_runtime::error::{Error, QueueError};
use wip_runtime::process::{Backend, DockerBackend, NullBackend, NullScript, SshBackend};
use wip_runtime::queue::WipPool;
use wip_runtime::signal::{CallbackClient, SignalService, signal_routes};
use wip_runtime::store::{Database, LibSqlBackend};
use wip_runtime::worker::WorkerDeps;
use wip_runtime::workflow::builtin_registry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env()?;

    eprintln!("WIP runtime v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.worker.worker_id);
    eprintln!("   Backend: {:?}", config.backend);
    eprintln!("   Signals: http://0.0.0.0:{}/signals/{{uuid}}", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    for (name, threads) in &config.servers {
        db.upsert_server(name, *threads).await?;
        eprintln!("   Server: {name} ({threads} threads)");
    }

    // ── Signals ──────────────────────────────────────────────────────────
    let signals = Arc::new(SignalService::new(
        Arc::clone(&db),
        config.callback.base_url.clone(),
    ));
    let callback = CallbackClient::new(&config.callback)?;

    let app = signal_routes(Arc::clone(&signals));
    let port = config.http_port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tokio::spawn(async move {
        tracing::info!(port, "Signal server started");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Signal server stopped");
        }
    });

    // ── Backend + workflows ──────────────────────────────────────────────
    let backend: Arc<dyn Backend> = match config.backend {
        BackendChoice::Docker => Arc::new(DockerBackend::new(config.docker_image.clone())),
        BackendChoice::Ssh => Arc::new(SshBackend::new(config.ssh.clone())),
        BackendChoice::Null => Arc::new(
            NullBackend::new(NullScript {
                exit_code: Some(0),
                ..Default::default()
            })
            .with_callback(callback),
        ),
    };
    let registry = builtin_registry(backend, Arc::clone(&signals), Arc::clone(&db));

    let deps = WorkerDeps {
        pool: WipPool::new(Arc::clone(&db)),
        signals,
        registry: Arc::new(registry),
        config: config.worker.clone(),
    };
    let allocator = ThreadPool::new(deps, config.pool.clone());

    // ── Allocator loop ───────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            outcome = allocator.run() => match outcome {
                Ok(_) => {}
                Err(Error::Queue(QueueError::NoWorkerServers)) => {
                    eprintln!("Error: no worker servers configured (set WIP_SERVERS=name=threads,...)");
                    std::process::exit(1);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Allocator run failed");
                    tokio::time::sleep(config.pool.poll_interval).await;
                }
            },
        }
    }

    Ok(())
}
