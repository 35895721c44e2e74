use std::sync::Arc;
use std::time::Duration;

use openfive_gateway::cache::{self, Cache, CacheConfig};
use openfive_gateway::config::Settings;
use openfive_gateway::http;
use openfive_gateway::meter::MeterWriter;
use openfive_gateway::persistence::{MemoryStore, Persistence, SeedState};
use openfive_gateway::pipeline::Pipeline;
use openfive_gateway::providers::Registry;
use openfive_gateway::task::BackgroundTask;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env();
    init_tracing(&settings);

    let mut args = std::env::args().skip(1);
    let seed_path = args
        .next()
        .ok_or("usage: openfive-gateway <seed.json> [--listen HOST:PORT]")?;

    let mut listen = format!("0.0.0.0:{}", settings.port);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let raw = std::fs::read_to_string(&seed_path)?;
    let seed: SeedState = serde_json::from_str(&raw)?;
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new(seed));

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(20)
        .build()?;
    let registry = Arc::new(Registry::with_defaults(client));
    let cache = Arc::new(Cache::new(CacheConfig::default()));
    let meter = Arc::new(MeterWriter::new(
        store.clone() as Arc<dyn Persistence>,
        settings.meter_batch_size,
        settings.meter_flush_ms,
    ));

    let pipeline = Arc::new(Pipeline::new(
        store.clone() as Arc<dyn Persistence>,
        registry,
        Arc::clone(&cache),
        Arc::clone(&meter),
        settings.master_encryption_key.clone(),
    ));

    let sweeper = cache::spawn_sweeper(Arc::clone(&cache));
    let loops = pipeline.loop_detector();
    let janitor = BackgroundTask::spawn(Duration::from_secs(300), move || {
        let loops = Arc::clone(&loops);
        async move {
            loops.cleanup(Duration::from_secs(3600));
        }
    });

    let app = http::router(pipeline);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "openfive gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down gateway");
    let teardown = async {
        meter.close().await;
        sweeper.stop().await;
        janitor.stop().await;
    };
    if tokio::time::timeout(settings.shutdown_timeout, teardown)
        .await
        .is_err()
    {
        tracing::warn!("background tasks did not finish within the shutdown timeout");
    }
    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if settings.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
