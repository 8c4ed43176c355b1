mod api;
mod cache;
mod config;
mod error;
mod fetcher;
mod i18n;
mod reconcile;
mod types;
mod view;
mod ws;

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState, RaceFactory};
use crate::cache::{CacheBackend, MemoryCache, SqliteCache};
use crate::config::{Config, CACHE_NAMESPACE};
use crate::error::Result;
use crate::fetcher::HttpFetcher;
use crate::types::MeetingDate;
use crate::view::ReunionView;
use crate::ws::{ChannelManager, EngineEndpoint, ReconnectPolicy};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let date = cfg.meeting_date.clone().unwrap_or_else(MeetingDate::today);
    info!(date = %date, locale = ?cfg.locale, "following meeting day");

    // --- Cache: SQLite file, memory if the file cannot be opened ---
    let cache = match SqliteCache::open(&cfg.cache_db_path, CACHE_NAMESPACE).await {
        Ok(c) => CacheBackend::Sqlite(c),
        Err(e) => {
            warn!("Cache database unavailable, keeping snapshots in memory: {e}");
            CacheBackend::Memory(MemoryCache::new())
        }
    };
    let cache = Arc::new(cache);

    // --- REST + realtime endpoints ---
    let fetcher = Arc::new(HttpFetcher::new(&cfg.api_url)?);
    let endpoint = EngineEndpoint::parse(&cfg.realtime_url, cfg.realtime_transport)?;
    info!("REST at {}, realtime at {endpoint}", cfg.api_url);

    // --- Reunion view ---
    let channel = ChannelManager::new(endpoint.clone());
    let health = Arc::new(HealthState::new(channel.state_watch()));
    let reunion = ReunionView::new(
        Arc::clone(&fetcher),
        Arc::clone(&cache),
        channel,
        date.clone(),
        cfg.locale,
    );
    let (reunion, reunion_task) = view::spawn(reunion);

    // --- Status API ---
    let state = ApiState {
        reunion,
        races: Arc::new(DashMap::new()),
        factory: Arc::new(RaceFactory {
            fetcher,
            cache,
            endpoint,
            policy: ReconnectPolicy::default(),
            date,
            locale: cfg.locale,
        }),
        health,
    };
    let app = router(state.clone());
    let bind_addr = format!("0.0.0.0:{}", cfg.status_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Status API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, unmounting views");
    state.unmount_all().await;
    if let Err(e) = reunion_task.await {
        warn!("Reunion view task ended abnormally: {e}");
    }
    Ok(())
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::signal::unix::{signal, SignalKind};

    use super::*;

    #[tokio::test]
    async fn sigterm_resolves_shutdown_signal() {
        // Installed first so the signal can never take the test process down.
        let _guard = signal(SignalKind::terminate()).unwrap();
        let shutdown = tokio::spawn(shutdown_signal());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!shutdown.is_finished());

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("SIGTERM did not resolve shutdown_signal")
            .unwrap();
    }
}
