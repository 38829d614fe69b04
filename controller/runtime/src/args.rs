use crate::{
    core::{trigger, Conditions, Trigger},
    index::{Cache, Registry, RegistryConfig},
    k8s::{self, watcher},
    status, SyncMetrics, Syncer, SyncerConfig,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry as Metrics;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

// Health probes are throttled to at most one pass per second.
const PROBE_THROTTLE: Duration = Duration::from_secs(1);

// The maximum number of status patches to buffer between sync passes.
const STATUS_UPDATE_QUEUE_SIZE: usize = 1_000;

#[derive(Debug, Parser)]
#[clap(name = "ferry", about = "A multi-cluster service routing controller")]
pub struct Args {
    #[clap(long, default_value = "ferry=info,warn", env = "FERRY_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The control-plane namespace holding hubs, policies and routes.
    #[clap(long, default_value = "ferry-system", env = "NAMESPACE")]
    namespace: String,

    /// The namespace of each hub's tunnel.
    #[clap(long, default_value = "ferry-tunnel-system")]
    tunnel_namespace: String,

    /// The hub running this controller.
    #[clap(long, default_value = "control-plane")]
    control_plane_hub: String,

    #[clap(long, default_value = "100")]
    debounce_ms: u64,

    #[clap(long, default_value = "5000")]
    probe_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// Requests a sync on this interval even without watch traffic.
    #[clap(long, default_value = "30")]
    resync_interval_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            tunnel_namespace,
            control_plane_hub,
            debounce_ms,
            probe_timeout_ms,
            patch_timeout_ms,
            resync_interval_secs,
        } = self;

        let mut prom = <Metrics>::default();
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("resource_status"));
        let sync_metrics = SyncMetrics::register(prom.sub_registry_with_prefix("sync"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let (trigger, requests) = trigger::channel(Duration::from_millis(debounce_ms));

        let registry = Arc::new(Registry::new(
            RegistryConfig {
                namespace: namespace.clone(),
                tunnel_namespace: tunnel_namespace.clone(),
                control_plane_hub: control_plane_hub.clone(),
                probe_timeout: Duration::from_millis(probe_timeout_ms),
            },
            runtime.client(),
            trigger.clone(),
            Arc::new(Conditions::default()),
        ));

        // Spawn resource watches.

        let hubs =
            runtime.watch_namespaced::<k8s::Hub>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(registry.hub_cache(), hubs).instrument(info_span!("hubs")),
        );

        let secrets = runtime
            .watch_namespaced::<k8s::Secret>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(registry.secret_cache(), secrets)
                .instrument(info_span!("secrets")),
        );

        let policies = Cache::default().with_handler(trigger.clone()).shared();
        let policy_events = runtime
            .watch_namespaced::<k8s::RoutePolicy>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(policies.clone(), policy_events)
                .instrument(info_span!("routepolicies")),
        );

        let routes = Cache::default().with_handler(trigger.clone()).shared();
        let route_events = runtime
            .watch_namespaced::<k8s::Route>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(routes.clone(), route_events)
                .instrument(info_span!("routes")),
        );

        // Spawn the status controller.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_sent = status::Ledger::default();
        let status_controller = status::Controller::new(
            runtime.client(),
            updates_rx,
            status_sent.clone(),
            Duration::from_millis(patch_timeout_ms),
            status_metrics.clone(),
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        tokio::spawn(
            resync(trigger.clone(), Duration::from_secs(resync_interval_secs))
                .instrument(info_span!("resync")),
        );

        let syncer = Syncer::new(
            SyncerConfig {
                namespace,
                tunnel_namespace,
                control_plane_hub,
                probe_throttle: PROBE_THROTTLE,
            },
            registry,
            runtime.client(),
            policies,
            routes,
            status::Statuses::new(updates_tx, status_sent, status_metrics),
            sync_metrics,
        );
        tokio::spawn(
            sync(syncer, requests, trigger, runtime.shutdown_handle())
                .instrument(info_span!("sync")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Runs sync passes until shutdown, letting an in-flight pass finish.
async fn sync(
    mut syncer: Syncer,
    mut requests: trigger::Requests,
    trigger: Trigger,
    drain: drain::Watch,
) {
    let passes = async move {
        while requests.next().await {
            syncer.sync().await;
        }
    };
    tokio::pin!(passes);

    tokio::select! {
        () = &mut passes => {}
        handle = drain.signaled() => {
            tracing::debug!("Shutting down");
            trigger.close();
            handle.release_after(passes).await;
        }
    }
}

async fn resync(trigger: Trigger, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        if trigger.is_closed() {
            return;
        }
        trigger.request();
    }
}
