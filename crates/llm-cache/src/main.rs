use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use mb_domain::config::CacheConfig;
use mb_identity::TokenSigner;
use mb_llm_cache::api::{self, CacheState};
use mb_llm_cache::SemanticCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mb_llm_cache=debug")),
        )
        .json()
        .init();

    let config = CacheConfig::from_env().context("loading cache config")?;
    tracing::info!(threshold = config.threshold, "llm cache starting");

    let cache = Arc::new(
        SemanticCache::open(config.index_path(), config.threshold)
            .context("opening semantic cache")?,
    );

    // Periodic compaction of the append log into the snapshot.
    {
        let cache = cache.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Err(e) = cache.save() {
                    tracing::warn!(error = %e, "cache compaction failed");
                }
            }
        });
    }

    let state = CacheState {
        cache,
        signer: TokenSigner::new(&config.jwt_secret),
    };
    let app = api::router()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "llm cache listening");

    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}
