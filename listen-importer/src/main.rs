//! Import a sorted listen dump into the listen table.
use std::future::ready;
use std::sync::Arc;

use anyhow::{Context, Error};
use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use listen_common::metrics::{serve, setup_metrics_routes};
use listen_common::store::{ListenStore, PgListenStore, PrintStore};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use listen_importer::config::{Config, ImportConfig};
use listen_importer::dead_letter::DeadLetterFile;
use listen_importer::error::ImportError;
use listen_importer::importer::Importer;
use listen_importer::progress::render_summary;
use listen_importer::writer::log_reports;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "listen importer"
}

fn start_health_liveness_server(config: &Config, health: HealthRegistry) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(health.get_status())));
    let bind = config.bind();

    tokio::task::spawn(async move {
        let router = match setup_metrics_routes(router) {
            Ok(router) => router,
            Err(e) => {
                error!("failed to install the metrics recorder: {}", e);
                return;
            }
        };
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    })
}

/// Cancel the import on the first ctrl-c. Already queued batches are still written.
fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, stopping import");
            shutdown.cancel();
        }
    });
}

async fn open_input(path: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>, Error> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open input {path}"))?;
    Ok(Box::new(BufReader::new(file)))
}

async fn import<S: ListenStore + 'static>(
    config: &Config,
    import_config: ImportConfig,
    store: S,
    health: HealthRegistry,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let mut importer = Importer::new(import_config, Arc::new(store))
        .with_health(health)
        .with_shutdown(shutdown);

    if let Some(path) = &config.dead_letter_path {
        let dead_letter = DeadLetterFile::open(path)
            .await
            .with_context(|| format!("failed to open dead letter file {path}"))?;
        importer = importer.with_dead_letter(dead_letter);
    }

    let input = open_input(&config.input_path).await?;
    let summary = importer.run(input).await?;

    log_reports(&summary.writers);
    info!(
        "import {}:\n{}",
        if summary.cancelled { "cancelled" } else { "finished" },
        render_summary(&summary.stats, summary.elapsed)
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("invalid configuration")?;
    let import_config = config.import_config()?;

    let health = HealthRegistry::new("liveness");
    if config.export_prometheus {
        start_health_liveness_server(&config, health.clone());
    }

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    if config.print_sink {
        import(&config, import_config, PrintStore::default(), health, shutdown).await
    } else {
        let store = PgListenStore::new(
            &config.table_name,
            &config.database_url,
            import_config.worker_count as u32,
        )
        .await
        .map_err(ImportError::Store)?;
        import(&config, import_config, store, health, shutdown).await
    }
}
