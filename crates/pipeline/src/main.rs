use std::{net::SocketAddr, sync::Arc};

use adreel_pipeline::{
    config::Config,
    coordinator::Coordinator,
    llm::AnthropicClient,
    materializer::Materializer,
    poller::Poller,
    provider::KieClient,
    routes::{self, AppState},
    store::Store,
};
use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(config.videos_dir())
        .with_context(|| format!("failed to create DATA_DIR at {}", config.data_dir.display()))?;

    let provider_configured = !config.provider.api_key.is_empty();
    if !provider_configured {
        tracing::warn!("KIE_API_KEY not set; video and character submissions will be rejected upstream");
    }
    let llm_configured = !config.llm.api_key.is_empty();
    if !llm_configured {
        tracing::warn!("ANTHROPIC_API_KEY not set; prompt generation will fail");
    }

    let store = Store::init(config.db_path())?;
    let provider = Arc::new(KieClient::new(config.provider.clone()));
    let llm = Arc::new(AnthropicClient::new(config.llm.clone()));
    let materializer = Materializer::new(store.clone(), config.videos_dir());
    let poller = Poller::new(store.clone(), provider.clone(), materializer, config.poll.clone());

    let resumed = poller.resume_pending().await?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed polling for unfinished tasks");
    }

    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        provider,
        llm,
        poller.clone(),
        config.default_video_seconds,
    ));

    let state = AppState {
        coordinator,
        data_dir: config.data_dir.clone(),
        db_path: store.db_path().to_path_buf(),
        provider_configured,
        llm_configured,
    };
    let app = routes::router(state, config.videos_dir());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!("pipeline listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("pipeline server failed")?;

    poller.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
