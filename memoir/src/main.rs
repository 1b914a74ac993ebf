use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memoir::config::Config;
use memoir::db::{Database, LibSqlMetadataStore, MetadataStore};
use memoir::embeddings::EmbeddingManager;
use memoir::llm::LlmProvider;
use memoir::services::{DreamConsolidator, Healer, MemoryService};
use memoir::vector::{HnswConfig, VectorStore};

/// Wires the engine together for a local, single-node run: one metadata
/// store, one vector index, Dream and the Healer each on their own
/// `tokio::spawn` loop. There is no HTTP or MCP surface here — integrators
/// embed [`memoir::services::MemoryService`] directly and drive Dream/Healer
/// on whatever schedule their host process wants.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memoir=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    tracing::info!(path = %config.data.metadata_db_path, "opening metadata store");
    let raw_db = Database::new(&config.data).await?;
    let db: Arc<dyn MetadataStore> = Arc::new(LibSqlMetadataStore::new(raw_db));

    tracing::info!(dir = %config.data.vector_index_dir.display(), "opening vector index");
    std::fs::create_dir_all(&config.data.vector_index_dir)?;
    let vectors = Arc::new(VectorStore::open(
        config.embeddings.dimensions,
        config.data.vector_index_dir.clone(),
        &HnswConfig::default(),
    )?);

    let embeddings = Arc::new(EmbeddingManager::new(&config.embeddings, db.clone()).await);

    if config.llm.is_some() {
        tracing::info!("LLM provider configured");
    } else {
        tracing::warn!("no LLM configured; summarization and Dream consolidation are disabled");
    }
    let llm = Arc::new(LlmProvider::new(config.llm.as_ref()));

    let memory = MemoryService::new(
        db.clone(),
        vectors.clone(),
        embeddings.clone(),
        llm.clone(),
        config.embeddings.disable_summarizer,
    );

    let cancel_token = CancellationToken::new();

    tracing::info!(
        interval_secs = config.dream.interval_secs,
        enabled = config.dream.enabled,
        "starting dream consolidator"
    );
    let dream = Arc::new(DreamConsolidator::new(
        db.clone(),
        memory.clone(),
        llm.clone(),
        config.dream.clone(),
        config.memory.clone(),
    ));
    let memory = memory.with_dream_consolidator(dream.clone());
    let token = cancel_token.child_token();
    let dream_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("dream consolidator shutting down...");
                    break;
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(dream.interval_secs())) => {
                    if let Err(e) = dream.run_once().await {
                        tracing::error!("dream consolidation error: {}", e);
                    }
                }
            }
        }
    });

    tracing::info!("starting healer...");
    let healer = Healer::new(db.clone(), vectors.clone(), embeddings.clone());
    let token = cancel_token.child_token();
    let healer_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("healer shutting down...");
                    break;
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(healer.interval_secs())) => {
                    if let Err(e) = healer.run_once().await {
                        tracing::error!("healer error: {}", e);
                    }
                }
            }
        }
    });

    tracing::info!(port = config.server.port, "memoir running, press Ctrl+C to stop");
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping background jobs");
    cancel_token.cancel();

    if let Err(e) = dream_handle.await {
        tracing::error!(error = %e, "dream consolidator task panicked during shutdown");
    }
    if let Err(e) = healer_handle.await {
        tracing::error!(error = %e, "healer task panicked during shutdown");
    }

    tracing::info!("flushing metadata store write queue");
    db.close().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
