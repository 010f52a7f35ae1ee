#[macro_use]
extern crate log;

use anyhow::{Context, bail};
use futures::FutureExt;
use kube::Client;
use prometheus_exporter::{install_meter_provider, start_prometheus_metrics_server};
use retainer_controller::RetainerController;
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::sync::oneshot;

mod error_backoff;
mod errors;
mod fetcher;
mod modes;
mod namespace_index;
mod predicates;
mod prometheus_exporter;
mod resolver;
mod retainer_controller;
mod retainer_modifications;
#[cfg(test)]
mod test_utils;

/// The K8s field manager name.
const MANAGER: &'static str = "retain-controller";

#[derive(Clone)]
struct Configuration {
    client: Client,
    max_concurrent_reconciles: u16,
    /// How long the Retainer cache may take to prime before start-up fails.
    cache_sync_timeout: Duration,
    /// How long in-flight reconciles may take after a shutdown signal.
    shutdown_grace_period: Duration,
    error_backoff_base: Duration,
    error_backoff_max: Duration,
    metrics_addr: SocketAddr,
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        Self::from_lookup(client, env_var)
    }

    fn from_lookup<F>(client: Client, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let duration = |name: &str, default: &str| -> anyhow::Result<Duration> {
            let value = lookup(name).unwrap_or_else(|| default.to_string());
            humantime::parse_duration(value.as_str())
                .with_context(|| format!("invalid duration {:?} in {}", value, name))
        };
        let max_concurrent_reconciles: u16 = match lookup("MAX_CONCURRENT_RECONCILES") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid MAX_CONCURRENT_RECONCILES {:?}", v))?,
            None => 5,
        };
        if max_concurrent_reconciles == 0 {
            bail!("MAX_CONCURRENT_RECONCILES must be at least 1");
        }
        let metrics_ip: IpAddr = lookup("METRICS_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0".to_string())
            .parse()
            .context("invalid METRICS_LISTEN_ADDR")?;
        let metrics_port: u16 = lookup("METRICS_LISTEN_PORT")
            .unwrap_or_else(|| "9000".to_string())
            .parse()
            .context("invalid METRICS_LISTEN_PORT")?;
        let configuration = Configuration {
            client,
            max_concurrent_reconciles,
            cache_sync_timeout: duration("CACHE_SYNC_TIMEOUT", "3m")?,
            shutdown_grace_period: duration("SHUTDOWN_GRACE_PERIOD", "30s")?,
            error_backoff_base: duration("ERROR_BACKOFF_BASE", "1s")?,
            error_backoff_max: duration("ERROR_BACKOFF_MAX", "5m")?,
            metrics_addr: SocketAddr::new(metrics_ip, metrics_port),
        };
        info!(
            "Controller runs {} concurrent reconciles, error backoff {:?}..{:?}",
            configuration.max_concurrent_reconciles,
            configuration.error_backoff_base,
            configuration.error_backoff_max
        );
        Ok(configuration)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolves on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => (),
                    _ = terminate.recv() => (),
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for Ctrl-C: {}", e);
        futures::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let registry = install_meter_provider()?;
    let client = Client::try_default().await?;
    let configuration = Configuration::new(client)?;
    let grace_period = configuration.shutdown_grace_period;
    let prometheus_metrics_exporter =
        start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let (trigger, shutdown) = oneshot::channel::<()>();
    let controller = RetainerController::new(configuration).run(shutdown.map(|_| ()));
    tokio::pin!(controller);
    info!("start controllers ...");
    tokio::select! {
        res = &mut controller => return Ok(res?),
        res = prometheus_metrics_exporter => return res,
        _ = shutdown_signal() => {
            info!("shutting down, waiting up to {:?} for running reconciles", grace_period);
        }
    };
    let _ = trigger.send(());
    match tokio::time::timeout(grace_period, controller).await {
        Ok(res) => Ok(res?),
        Err(_) => {
            warn!(
                "reconciles still running after {:?}, cancelling them",
                grace_period
            );
            Ok(())
        }
    }
}
