//! adportal -- ad-gated captive portal core.
//!
//! A device watches a short ad and in exchange gets a time-bounded network
//! session, granted and revoked at the NAS over RADIUS CoA/Disconnect. This
//! crate holds the session state machine, the ad gate, the RADIUS client, the
//! expiry sweeper and the JSON API that fronts them.

pub mod ads;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod mac;
pub mod radius;
pub mod retry;
pub mod session;
pub mod storage;
pub mod sweeper;
pub mod token;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::ads::{AdGate, AdSelector, CatalogAdSelector, FallbackAdSelector, HttpAdSelector};
use crate::cache::MemoryCache;
use crate::config::PortalConfig;
use crate::radius::{CredentialStore, RadiusClient};
use crate::session::AccessSessionManager;
use crate::storage::SqliteStore;
use crate::sweeper::Sweeper;
use crate::token::TokenSigner;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything wired together from one [`PortalConfig`].
pub struct Portal {
    pub config: PortalConfig,
    pub cache: MemoryCache,
    pub manager: Arc<AccessSessionManager>,
    pub gate: Arc<AdGate>,
}

fn open_db(path: &Path) -> Result<storage::Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    let path_str = path
        .to_str()
        .with_context(|| format!("database path is not valid UTF-8: {}", path.display()))?;
    storage::open_pool(path_str).with_context(|| format!("failed to open database {}", path_str))
}

fn build_selector(config: &PortalConfig) -> Result<Arc<dyn AdSelector>> {
    let catalog = CatalogAdSelector::new(config.ads.catalog.clone());
    match &config.ads.service_url {
        Some(url) => {
            let http = HttpAdSelector::new(url)?;
            Ok(Arc::new(FallbackAdSelector::new(http, catalog)))
        }
        None => {
            if catalog.is_empty() {
                tracing::warn!("no ad service and an empty catalog, every ad request will fail");
            }
            Ok(Arc::new(catalog))
        }
    }
}

impl Portal {
    /// Validate `config`, open the databases and build the core services.
    pub fn build(config: PortalConfig) -> Result<Self> {
        config.validate()?;

        tracing::info!(db_path = %config.database.path.display(), "initializing database");
        let pool = open_db(&config.database.path)?;
        let credential_pool = match &config.radius.credential_db {
            Some(path) => open_db(path)?,
            None => pool.clone(),
        };

        let radius = RadiusClient::new(
            config.radius.nas_socket()?,
            config.radius.secret.as_bytes(),
            config.radius.nas_identifier.clone(),
            config.radius.idle_timeout_secs,
            config.radius.retry_policy(),
            CredentialStore::new(credential_pool),
        );

        let store = Arc::new(SqliteStore::new(pool));
        let cache = MemoryCache::new();
        let signer = TokenSigner::new(
            config.token.secret.as_bytes(),
            config.token.issuer.clone(),
            config.token.lifetime_secs,
        );

        let manager = Arc::new(AccessSessionManager::new(
            store.clone(),
            Arc::new(cache.clone()),
            Arc::new(radius),
            signer.clone(),
            config.session.clone(),
        ));
        let gate = Arc::new(AdGate::new(
            store,
            build_selector(&config)?,
            signer,
            config.ads.min_watch_percentage,
        ));

        Ok(Self {
            config,
            cache,
            manager,
            gate,
        })
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.manager.clone())
    }
}

/// Daily: drop old impressions and dead cache entries.
async fn housekeeping(
    manager: Arc<AccessSessionManager>,
    cache: MemoryCache,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = manager.purge_impressions(retention_days).await {
                    tracing::error!(error = %e, "impression purge failed");
                }
                let evicted = cache.evict_expired().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted expired cache entries");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// Start the portal daemon: API server, expiry sweeper and housekeeping.
pub async fn serve(config: PortalConfig) -> Result<()> {
    let portal = Portal::build(config)?;
    let addr: std::net::SocketAddr = portal
        .config
        .server
        .bind
        .parse()
        .with_context(|| format!("server.bind '{}' is not host:port", portal.config.server.bind))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = tokio::spawn(portal.sweeper().run(
        Duration::from_secs(portal.config.sweeper.interval_secs),
        shutdown_rx.clone(),
    ));
    let housekeeper = tokio::spawn(housekeeping(
        portal.manager.clone(),
        portal.cache.clone(),
        portal.config.sweeper.impression_retention_days,
        shutdown_rx.clone(),
    ));

    let app = api::router(api::state::AppState {
        manager: portal.manager.clone(),
        gate: portal.gate.clone(),
    });

    tracing::info!(%addr, "adportal listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    drop(shutdown_rx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("API server failed")?;

    let _ = sweeper.await;
    let _ = housekeeper.await;
    tracing::info!("adportal stopped");
    Ok(())
}
