mod config;
mod db;
mod error;
mod llm;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use services::generation::GenerationContext;
use services::payment::{StripeClient, StripeConfig};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::AppConfig::from_env().expect("invalid configuration");
    let port = config.port;

    let pool = db::init_pool(&config.database)
        .await
        .expect("database init failed");
    let store: Arc<dyn store::Store> = Arc::new(store::postgres::PgStore::new(pool));

    // Nothing is running yet, so any reserved attempt was stranded by the last process.
    match services::generation::recover_interrupted(store.as_ref()).await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "refunded generations interrupted by the last shutdown"),
        Err(e) => tracing::error!(error = %e, "failed to settle interrupted generations"),
    }

    let mut state = state::AppState::new(Arc::clone(&store), config);
    let mut workers = None;

    // Non-fatal: generation routes answer 503 without a model.
    match llm::LlmClient::from_env() {
        Ok(client) => {
            tracing::info!(model = client.model(), "LLM client initialized");
            let ctx = GenerationContext {
                store: Arc::clone(&store),
                llm: Arc::new(client),
                config: state.config.generation,
            };
            let (queue, pool) = services::worker::spawn_generation_workers(ctx.clone());
            workers = Some(pool);
            state = state.with_generation(ctx, queue);
        }
        Err(e) => tracing::warn!(error = %e, "LLM client not configured; site generation disabled"),
    }

    match StripeConfig::from_env().map(StripeClient::new) {
        Some(Ok(client)) => state = state.with_payments(Arc::new(client)),
        Some(Err(e)) => tracing::warn!(error = %e, "payment client failed to build; purchases disabled"),
        None => tracing::warn!("STRIPE_SECRET_KEY not set; purchases disabled"),
    }
    if state.config.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set; payment webhooks will be rejected");
    }

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "sitebuilder listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("server failed");

    if let Some(workers) = workers {
        tracing::info!("draining generation workers");
        workers.shutdown().await;
    }
}
