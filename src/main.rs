use std::sync::Arc;

mod app;
mod auth;
mod config;
mod db;
mod state;
mod users;

use crate::{config::AppConfig, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "user_service=debug,tower_http=info,sqlx=warn".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = Arc::new(AppConfig::from_env()?);

    let pool = db::connect(&config.database).await?;
    tracing::info!("running database migrations");
    db::migrate(&pool).await?;

    let addr = config.server.address();
    let grace = config.server.shutdown_timeout();

    let state = AppState::new(pool.clone(), config);
    let router = app::build_app(state);

    app::serve(router, &addr, grace).await?;

    pool.close().await;
    tracing::info!("database pool closed");
    Ok(())
}
