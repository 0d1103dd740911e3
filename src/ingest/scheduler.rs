// src/ingest/scheduler.rs
//! One independent task per configured source. Sources never wait on each
//! other; they only share the store.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ingest::config::{AppConfig, SourceConfig, SourceKind};
use crate::ingest::providers::{HttpJsonSource, RssSource};
use crate::ingest::{
    IngestionPipeline, PipelinePolicy, RateBudget, RateLimitedFetcher, SourceAdapter, SourceState,
    StatusRegistry,
};
use crate::store::PostStore;

/// A running source task.
pub struct SourceHandle {
    pub source_id: String,
    pub task: JoinHandle<SourceState>,
}

/// Spawn the ingest loop for one adapter.
pub fn spawn_pipeline<A: SourceAdapter>(
    adapter: A,
    budget: RateBudget,
    policy: PipelinePolicy,
    store: Arc<dyn PostStore>,
    status: StatusRegistry,
    cancel: CancellationToken,
) -> SourceHandle {
    let pipeline = IngestionPipeline::new(
        RateLimitedFetcher::new(adapter, budget),
        store,
        status,
        policy,
    );
    let source_id = pipeline.source_id().to_string();
    let task = tokio::spawn(pipeline.run(cancel));
    SourceHandle { source_id, task }
}

/// A configured source with its adapter built, ready to spawn.
enum Configured {
    Rss(RssSource),
    HttpJson(HttpJsonSource),
}

fn build_adapter(cfg: &SourceConfig) -> Result<Configured> {
    Ok(match cfg.kind {
        SourceKind::Rss => match cfg.endpoint.strip_prefix("file://") {
            Some(path) => {
                let xml = std::fs::read_to_string(path)
                    .with_context(|| format!("source {}: reading feed {path}", cfg.id))?;
                Configured::Rss(RssSource::from_fixture(&cfg.id, &xml))
            }
            None => Configured::Rss(RssSource::from_url(&cfg.id, &cfg.endpoint)),
        },
        SourceKind::HttpJson => {
            let mut adapter = HttpJsonSource::new(&cfg.id, &cfg.endpoint);
            if let Some(token) = cfg.bearer_token()? {
                tracing::debug!(source = %cfg.id, token_len = token.len(), "bearer token loaded");
                adapter = adapter.with_bearer_token(token);
            }
            Configured::HttpJson(adapter)
        }
    })
}

/// Spawn every configured source. Fails before spawning anything if a source
/// cannot be built (unreadable feed file, missing credential).
pub fn spawn_sources(
    cfg: &AppConfig,
    store: Arc<dyn PostStore>,
    status: &StatusRegistry,
    cancel: &CancellationToken,
) -> Result<Vec<SourceHandle>> {
    let built = cfg
        .sources
        .iter()
        .map(|s| build_adapter(s).map(|a| (s, a)))
        .collect::<Result<Vec<_>>>()?;

    let mut handles = Vec::with_capacity(built.len());
    for (s, adapter) in built {
        let (store, status, cancel) = (store.clone(), status.clone(), cancel.child_token());
        let h = match adapter {
            Configured::Rss(a) => spawn_pipeline(a, s.rate_limit, s.policy(), store, status, cancel),
            Configured::HttpJson(a) => {
                spawn_pipeline(a, s.rate_limit, s.policy(), store, status, cancel)
            }
        };
        tracing::info!(
            target: "ingest",
            source = %s.id,
            kind = ?s.kind,
            batch_size = s.batch_size,
            "source spawned"
        );
        handles.push(h);
    }
    Ok(handles)
}

/// Wait for all source tasks to stop.
pub async fn join_all(handles: Vec<SourceHandle>) {
    for h in handles {
        match h.task.await {
            Ok(state) => {
                tracing::info!(target: "ingest", source = %h.source_id, state = state.name(), "source joined")
            }
            Err(e) => tracing::error!(target: "ingest", source = %h.source_id, error = %e, "source task panicked"),
        }
    }
}
