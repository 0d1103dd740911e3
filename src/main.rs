//! Social Sentiment Service: binary entrypoint.
//! Loads configuration, starts one ingest task per source and serves the
//! query API until Ctrl-C, then drains the sources.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use social_sentiment_analyzer::api::{self, AppState};
use social_sentiment_analyzer::ingest::{config, scheduler, StatusRegistry};
use social_sentiment_analyzer::metrics::Metrics;
use social_sentiment_analyzer::query::QueryService;
use social_sentiment_analyzer::sentiment::Lexicon;
use social_sentiment_analyzer::store::{MemoryStore, PostStore};

/// `RUST_LOG` overrides the default filter; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("social_sentiment_analyzer=info,ingest=info,warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_config_default().context("loading configuration")?;
    let metrics = Metrics::init(cfg.sources.len())?;

    // Parse the lexicon before any source task can touch it.
    let lexicon = Lexicon::global();
    tracing::info!(words = lexicon.len(), "sentiment lexicon loaded");

    let store: Arc<dyn PostStore> = Arc::new(MemoryStore::new());
    let status = StatusRegistry::new();
    let cancel = CancellationToken::new();

    let sources = scheduler::spawn_sources(&cfg, store.clone(), &status, &cancel)?;
    tracing::info!(sources = sources.len(), "ingest started");

    let state = AppState {
        query: QueryService::new(store),
        status,
    };
    let app = api::router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    tracing::info!(addr = %cfg.server.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("http server")?;

    // Sources finish their in-flight write before stopping.
    cancel.cancel();
    scheduler::join_all(sources).await;
    tracing::info!("bye");
    Ok(())
}
