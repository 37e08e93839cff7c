use crate::{
    controller::Controller,
    core::Family,
    discovery::{self, api_resource_exists},
    index::RuleEntries,
    k8s::{Api, NetworkPolicy, Pod},
    metrics::Metrics,
    provisioner::{Iptables, Provisioner, Setns},
    watch::{self, Handle},
};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{watcher, WatchStreamExt};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netpol", about = "A DANM network policy controller")]
pub struct Args {
    #[clap(long, default_value = "netpol=info,warn", env = "NETPOL_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the node whose pods are provisioned.
    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    /// Whether only the first (`first`) or every (`all`) ingress and egress entry of a policy
    /// is compiled.
    #[clap(long, default_value = "first")]
    rule_entries: RuleEntries,

    #[clap(long, default_value = "iptables")]
    iptables_path: PathBuf,

    #[clap(long, default_value = "ip6tables")]
    ip6tables_path: PathBuf,

    /// How long to wait after a watch fails before exiting.
    #[clap(long, default_value = "5")]
    shutdown_grace_period_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            node_name,
            rule_entries,
            iptables_path,
            ip6tables_path,
            shutdown_grace_period_secs,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("netpol"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let client = runtime.client();
        let served = discovery::retry(discovery::MAX_ATTEMPTS, discovery::RETRY_INTERVAL, || {
            let client = client.clone();
            async move { api_resource_exists::<NetworkPolicy>(&client).await }
        })
        .await;
        if !served {
            bail!("DanmNetworkPolicy resources are not served by the API server");
        }

        let provisioner = Provisioner::new(
            Setns::new(),
            Iptables::new(iptables_path, Family::V4),
            Iptables::new(ip6tables_path, Family::V6),
        );
        info!(node = %node_name, entries = %rule_entries, "Starting");
        let controller = Arc::new(Controller::new(
            node_name.clone(),
            rule_entries,
            client.clone(),
            provisioner,
            metrics,
        ));

        // Watches report fatal errors on `fatal_tx` and stop when `stop_tx` is signaled.
        let (fatal_tx, fatal_rx) = mpsc::channel(2);
        let (stop_tx, stop_rx) = drain::channel();

        let pods = watcher(
            Api::<Pod>::all(client.clone()),
            watcher::Config::default().fields(&format!("spec.nodeName={node_name}")),
        )
        .default_backoff();
        tokio::spawn(
            watch_until_shutdown(
                pods,
                controller.clone(),
                fatal_tx.clone(),
                runtime.shutdown_handle(),
                stop_rx.clone(),
            )
            .instrument(info_span!("pods")),
        );

        let policies = watcher(
            Api::<NetworkPolicy>::all(client.clone()),
            watcher::Config::default(),
        )
        .default_backoff();
        tokio::spawn(
            watch_until_shutdown(
                policies,
                controller,
                fatal_tx,
                runtime.shutdown_handle(),
                stop_rx,
            )
            .instrument(info_span!("policies")),
        );

        let readiness = runtime.readiness();
        let failed = shutdown_on_fatal(
            fatal_rx,
            stop_tx,
            move || readiness.set(false),
            Duration::from_secs(shutdown_grace_period_secs),
        );

        // Block the main thread on the shutdown signal unless a watch fails first.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            error = failed => return Err(error),
        }

        Ok(())
    }
}

/// Runs a watch until the process shuts down or `stop` is signaled, reporting fatal watch
/// errors on `fatal`.
async fn watch_until_shutdown<T, H>(
    events: impl Stream<Item = Result<watcher::Event<T>, watcher::Error>>,
    handler: Arc<H>,
    fatal: mpsc::Sender<anyhow::Error>,
    shutdown: kubert::shutdown::Watch,
    stop: drain::Watch,
) where
    H: Handle<T>,
{
    tokio::select! {
        res = watch::run(events, &*handler) => {
            if let Err(error) = res {
                let _ = fatal.send(anyhow!(error).context("watch failed")).await;
            }
        }
        _ = shutdown.signaled() => tracing::debug!("Shutdown"),
        _ = stop.signaled() => tracing::debug!("Stopped"),
    }
}

/// Waits for a watch to fail. The process is then marked unready and the watches are stopped;
/// the error is returned once the grace period has elapsed.
///
/// Never completes if every watch ends without failing.
async fn shutdown_on_fatal(
    mut fatal: mpsc::Receiver<anyhow::Error>,
    stop: drain::Signal,
    unready: impl FnOnce(),
    grace: Duration,
) -> anyhow::Error {
    let Some(error) = fatal.recv().await else {
        return future::pending().await;
    };
    tracing::error!(%error, ?grace, "Shutting down");
    unready();

    let deadline = time::Instant::now() + grace;
    if time::timeout_at(deadline, stop.drain()).await.is_err() {
        tracing::warn!("Watches did not stop within the grace period");
    }
    time::sleep_until(deadline).await;
    error
}
