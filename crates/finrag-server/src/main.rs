mod configuration;
mod error;
mod routes;
mod state;

use anyhow::Context;
use axum::http::HeaderValue;
use finrag::agent::Agent;
use finrag::prompt_template::render_system_directive;
use finrag::providers::factory;
use finrag::store::embeddings::{Embedder, FastEmbedder, OpenAiEmbedder};
use finrag::store::ingest::ingest_file;
use finrag::store::memory::InMemoryStore;
use finrag::streaming::WordReplay;
use finrag::tools::retriever::RetrieverTool;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration
    let settings = configuration::Settings::new()?;

    let cors = cors_layer(&settings.server.cors_origins)?;
    let addr = settings.server.socket_addr()?;
    let state = build_state(settings).await?;

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn build_embedder(
    settings: &configuration::EmbeddingSettings,
    provider: &configuration::ProviderSettings,
) -> anyhow::Result<Arc<dyn Embedder>> {
    match settings.client_config(provider) {
        Some(config) => {
            info!(host = %config.host, model = %config.model, "using embedding service");
            Ok(Arc::new(OpenAiEmbedder::new(config)?))
        }
        None => {
            let cache_dir = settings.resolved_cache_dir();
            info!(cache_dir = ?cache_dir, "loading local embedding model");
            let embedder = tokio::task::spawn_blocking(move || FastEmbedder::new(cache_dir))
                .await
                .context("Embedding model loader panicked")??;
            Ok(Arc::new(embedder))
        }
    }
}

async fn build_state(settings: configuration::Settings) -> anyhow::Result<state::AppState> {
    let embedder = build_embedder(&settings.embedding, &settings.provider).await?;
    build_state_with(settings, embedder).await
}

/// Index the document and assemble the agent behind the routes
async fn build_state_with(
    settings: configuration::Settings,
    embedder: Arc<dyn Embedder>,
) -> anyhow::Result<state::AppState> {
    let path = settings.document.resolved_path()?;
    let mut store = InMemoryStore::new(embedder);
    ingest_file(&mut store, &path, settings.document.chunk_options())
        .await
        .with_context(|| format!("Failed to index {}", path.display()))?;
    info!(chunks = store.len(), title = %settings.document.title, "document store ready");

    let retriever = RetrieverTool::with_title(Arc::new(store), settings.document.title.clone())
        .with_top_k(settings.document.top_k);

    info!(provider = ?settings.provider.provider_type(), "configuring model provider");
    let provider = factory::get_provider(settings.provider.into_config())?;

    let template = settings.agent.system_prompt_path.as_deref().map(|p| {
        PathBuf::from(shellexpand::tilde(p).as_ref())
    });
    let directive = render_system_directive(&settings.document.title, template.as_deref())?;

    let mut agent = Agent::new(Arc::from(provider), directive)
        .with_max_tool_cycles(settings.agent.tool_cycle_limit());
    agent.add_tool(Box::new(retriever));

    let replay = WordReplay::new(
        settings.agent.word_delay(),
        settings.agent.tool_notice_delay(),
    );
    Ok(state::AppState::new(agent, replay))
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("Invalid CORS origin: {}", origin))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
