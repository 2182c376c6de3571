use std::net::SocketAddr;
use std::time::Duration;

use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wafsentry::config::AppConfig;
use wafsentry::services::ipset::{HttpIpSet, IpSetBackend, MemoryIpSet};
use wafsentry::services::{reanalyzer, sweeper};
use wafsentry::{db, routes, AppState};

// M-MIMALLOC-APP: Use mimalloc as global allocator for improved performance.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wafsentry=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;

    let http = reqwest::Client::new();
    let ipset = match &config.ipset_api_url {
        Some(base_url) => IpSetBackend::Http(HttpIpSet::new(http.clone(), base_url.clone())),
        None => {
            tracing::warn!("IPSET_API_URL not set; using in-memory IP-set backend");
            IpSetBackend::Memory(MemoryIpSet::new())
        }
    };

    let state = AppState {
        db: pool,
        config: config.clone(),
        ipset,
        http,
    };

    spawn_schedulers(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(host = %addr, "Starting WafSentry API server");

    let app = routes::app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Background schedulers: block-expiry sweep and campaign re-analysis.
/// Each runs on its own interval; a failed pass is logged and the next
/// tick proceeds normally.
fn spawn_schedulers(state: AppState) {
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(sweep_state.config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper::run_pass(&sweep_state.db, &sweep_state.ipset).await {
                tracing::error!(error = %e, "Expiry sweep pass failed");
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.reanalyze_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = reanalyzer::run_pass(&state).await {
                tracing::error!(error = %e, "Re-analysis pass failed");
            }
        }
    });
}
