#[macro_use]
extern crate log;

use anyhow::{Context, anyhow};
use futures::future;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use kube_runtime::{
    WatchStreamExt,
    reflector::{reflector, store::Writer},
    watcher::{self},
};
use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};
use tenant_controller_apis::Tenant;
use tokio::sync::mpsc;

mod backoff;
mod client_config;
mod clients;
mod errors;
mod metrics;
mod namespace_manager;
mod prometheus_exporter;
mod role_binding;
mod tenant_controller;
mod tenant_fetcher;
mod tenant_modifications;
#[cfg(test)]
mod testing;
mod utils;

use client_config::AnnotationConfigLoader;
use clients::{KubeNamespaceClient, KubeRoleBindingClient, KubeTenantClient};
use metrics::OtelMetrics;
use prometheus_exporter::start_prometheus_metrics_server;
use tenant_controller::{Dependencies, TenantController};
use tenant_fetcher::{ApiTenantFetcher, StoreTenantFetcher, TenantFetcher};
use utils::{consume_watch, env_var, parse_namespaces};

/// The K8s field manager name.
const MANAGER: &'static str = "tenant-controller";

/// Where the sync handler reads Tenant objects from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FetchStrategy {
    /// Local reflector cache, kept up to date by a watch.
    Cache,
    /// Direct reads from the API server.
    Api,
}

#[derive(Clone, Debug)]
struct Configuration {
    watch_namespaces: Option<HashSet<String>>,
    workers: u16,
    fetch_strategy: FetchStrategy,
    resync_interval: Duration,
    metrics_addr: SocketAddr,
}

impl Configuration {
    /// Read the configuration through `var`, which returns trimmed, non-empty values.
    fn new(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let watch_namespaces = var("WATCH_NAMESPACES").and_then(|v| parse_namespaces(&v));
        let workers = match var("TENANT_CONTROLLER_WORKERS") {
            Some(v) => v
                .parse::<u16>()
                .ok()
                .filter(|w| *w > 0)
                .ok_or_else(|| anyhow!("TENANT_CONTROLLER_WORKERS must be a positive number, got {:?}", v))?,
            None => 2,
        };
        let fetch_strategy = match var("TENANT_FETCH_STRATEGY").as_deref() {
            None | Some("cache") => FetchStrategy::Cache,
            Some("api") => FetchStrategy::Api,
            Some(v) => Err(anyhow!(
                "TENANT_FETCH_STRATEGY must be one of cache, api, got {:?}",
                v
            ))?,
        };
        let resync_interval = match var("RESYNC_INTERVAL_SECONDS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("invalid RESYNC_INTERVAL_SECONDS {:?}", v))?,
            ),
            None => Duration::from_secs(3600),
        };
        let metrics_addr = var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse()
            .context("invalid metrics listen address")?;
        Ok(Self {
            watch_namespaces,
            workers,
            fetch_strategy,
            resync_interval,
            metrics_addr,
        })
    }

    fn tenant_api(&self, client: Client) -> Api<Tenant> {
        let mut tmp = self.watch_namespaces.iter().flatten();
        if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            // Optimize for the use-case where exactly one watch-namespace is provided.
            info!("Controller is only watching Tenants in namespace {}", ns);
            Api::namespaced(client, ns.as_str())
        } else {
            if let Some(namespaces) = &self.watch_namespaces {
                let mut namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
                namespaces.sort();
                info!(
                    "Controller is watching Tenants in namespaces: {}",
                    namespaces.join(",")
                );
            } else {
                info!("Controller is watching Tenants in all namespaces");
            }
            Api::all(client)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;
    let configuration = Configuration::new(env_var)?;

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    let metrics = Arc::new(OtelMetrics::new(&meter_provider.meter("tenant-controller")));
    let metrics_server = start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let client = Client::try_default().await?;
    let writer: Writer<Namespace> = Default::default();
    let namespace_cache = writer.as_reader();
    let namespace_reflector = tokio::spawn(consume_watch(
        "Namespace",
        reflector(
            writer,
            watcher::watcher(Api::<Namespace>::all(client.clone()), watcher::Config::default()),
        )
        .default_backoff(),
        |_| future::ready(()),
    ));

    // Deleted Tenants are not reconciled, the controller learns about them
    // from the Tenant watch below. In cache mode the store is updated before
    // the deletion is forwarded.
    let (deleted_tx, deleted_rx) = mpsc::unbounded_channel::<Tenant>();
    let forward_deletions = move |event: watcher::Event<Tenant>| {
        if let watcher::Event::Delete(tenant) = event {
            let _ = deleted_tx.send(tenant);
        }
        future::ready(())
    };
    let tenant_api = configuration.tenant_api(client.clone());
    let tenant_watcher = watcher::watcher(tenant_api.clone(), watcher::Config::default());
    let (fetcher, tenant_reflector): (Arc<dyn TenantFetcher>, _) =
        match configuration.fetch_strategy {
            FetchStrategy::Cache => {
                let writer: Writer<Tenant> = Default::default();
                let tenant_cache = writer.as_reader();
                let tenant_reflector = tokio::spawn(consume_watch(
                    "Tenant",
                    reflector(writer, tenant_watcher).default_backoff(),
                    forward_deletions,
                ));
                info!("waiting for Tenant cache to sync ...");
                tenant_cache.wait_until_ready().await?;
                (
                    Arc::new(StoreTenantFetcher::new(tenant_cache)),
                    tenant_reflector,
                )
            }
            FetchStrategy::Api => (
                Arc::new(ApiTenantFetcher::new(client.clone())),
                tokio::spawn(consume_watch(
                    "Tenant",
                    tenant_watcher.default_backoff(),
                    forward_deletions,
                )),
            ),
        };
    info!("waiting for Namespace cache to sync ...");
    namespace_cache.wait_until_ready().await?;

    let deps = Dependencies {
        tenants: Arc::new(KubeTenantClient::new(client.clone())),
        fetcher,
        config_loader: Arc::new(AnnotationConfigLoader::new(Arc::new(namespace_cache))),
        namespaces: Arc::new(KubeNamespaceClient::new(client.clone())),
        role_bindings: Arc::new(KubeRoleBindingClient::new(client.clone())),
        metrics,
    };
    let controller = TenantController::new(
        deps,
        configuration.watch_namespaces.clone(),
        configuration.resync_interval,
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("shutdown requested");
        let _ = stop_tx.send(());
    });
    let stop = async move {
        let _ = stop_rx.await;
    };

    info!("start controllers ...");
    tokio::select! {
        res = controller.run(tenant_api, configuration.workers, deleted_rx, stop) => res?,
        res = namespace_reflector => {
            error!("Namespace reflector terminated: {:?}", res);
        }
        res = tenant_reflector => {
            error!("Tenant reflector terminated: {:?}", res);
        }
        res = metrics_server => res?,
    };
    meter_provider.shutdown()?;
    Ok(())
}
