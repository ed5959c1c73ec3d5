use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use egressd::api;
use egressd::config::{Config, StatsConfig};
use egressd::egress::EgressDialer;
use egressd::proxy::ProxyServer;
use egressd::stats::{GeoIpService, StatsCollector, StatsStore};
use egressd::whitelist::WhitelistResolver;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    info!(
        listen = %config.listen,
        egress_subnet = %config.egress_subnet,
        whitelist_entries = config.whitelist.len(),
        "Starting egress proxy"
    );

    let shutdown = CancellationToken::new();

    let resolver = Arc::new(WhitelistResolver::new(
        config.whitelist.clone(),
        config.refresh_interval,
    ));
    tokio::spawn(Arc::clone(&resolver).run(shutdown.child_token()));

    // Statistics are best-effort: any failure here disables tracking but
    // never prevents the proxy from serving.
    let collector = if config.stats.enabled {
        init_stats(&config.stats, &shutdown).await
    } else {
        info!("Statistics disabled by configuration");
        None
    };

    if config.api.enabled {
        match &collector {
            Some(collector) => {
                let router = api::create_router(
                    Arc::clone(collector),
                    config.api.api_key.clone(),
                    &config.api.cors_origins,
                );
                match TcpListener::bind(&config.api.listen).await {
                    Ok(listener) => {
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(err) = api::serve(listener, router, token).await {
                                warn!(error = %err, "Reporting API server exited with error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(listen = %config.api.listen, error = %err, "Failed to bind reporting API, continuing without it");
                    }
                }
            }
            None => warn!("Reporting API requires statistics; skipping"),
        }
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind SOCKS5 listener on {}", config.listen))?;
    info!(listen = %config.listen, "SOCKS5 proxy listening");

    let dialer = Arc::new(EgressDialer::new(config.egress_subnet, resolver));
    let proxy = ProxyServer::new(dialer, collector.clone());
    let proxy_shutdown = shutdown.child_token();
    let proxy_task = tokio::spawn(async move { proxy.run(listener, proxy_shutdown).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Err(err) = proxy_task.await {
        warn!(error = %err, "Proxy task ended abnormally");
    }

    if let Some(collector) = collector {
        collector.close_all().await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn init_stats(
    config: &StatsConfig,
    shutdown: &CancellationToken,
) -> Option<Arc<StatsCollector>> {
    let store = match StatsStore::connect(&config.database_url, 5).await {
        Ok(store) => store,
        Err(err) => {
            warn!(error = %err, "Failed to open statistics database; statistics disabled");
            return None;
        }
    };
    if let Err(err) = store.init(chrono::Utc::now().timestamp()).await {
        warn!(error = %err, "Failed to initialize statistics schema; statistics disabled");
        return None;
    }

    let geoip = match &config.geoip_path {
        Some(path) => match GeoIpService::new(path) {
            Ok(service) => Some(service),
            Err(err) => {
                warn!(error = %err, "GeoIP database unavailable, continuing without geolocation");
                None
            }
        },
        None => None,
    };

    let collector = StatsCollector::new(store, geoip, config.retention_days);
    collector.spawn_retention_sweep(shutdown.child_token());
    Some(collector)
}
