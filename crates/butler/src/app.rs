//! Run orchestration.
//!
//! One run starts the inventory producer, the worker pool and the dispatch
//! loop that turns asset batches into work items, then waits for all three.

use crate::asset::{Action, Asset, WorkItem};
use crate::butler::{Butler, PoolSettings};
use crate::config::ButlerConfig;
use crate::configure::Configurator;
use crate::device::ipmi::IpmiConnector;
use crate::device::Connector;
use crate::execute::Executor;
use crate::inventory::{AssetBatch, Inventory};
use crate::metrics::{self, Metrics};
use crate::signer::Signer;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Work items put on the queue.
    pub dispatched: usize,
    /// Work items taken off the queue by a worker.
    pub handled: usize,
    /// Assets dropped for lack of an address.
    pub unroutable: usize,
    /// The stop signal fired during the run.
    pub interrupted: bool,
}

/// Counts from the dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: usize,
    pub unroutable: usize,
}

/// Unpack asset batches into work items until the inventory is exhausted
/// or `stop` fires. The work queue is closed on return.
pub async fn dispatch(
    mut batches: mpsc::Receiver<AssetBatch>,
    work: mpsc::Sender<WorkItem>,
    action: &Action,
    stop: &CancellationToken,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    'batches: loop {
        let batch = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        for asset in batch {
            if !asset.is_routable() {
                debug!(serial = %asset.label(), "Asset has no address, not dispatched");
                stats.unroutable += 1;
                continue;
            }

            let item = WorkItem::new(asset, action.clone());
            tokio::select! {
                biased;
                () = stop.cancelled() => break 'batches,
                sent = work.send(item) => {
                    if sent.is_err() {
                        warn!("Work queue closed, stopping dispatch");
                        break 'batches;
                    }
                    stats.dispatched += 1;
                }
            }
        }
    }

    if stop.is_cancelled() {
        info!(dispatched = stats.dispatched, "Interrupt received, dispatch stopped");
    }
    stats
}

/// Cancel `stop` on SIGINT or SIGTERM.
#[must_use]
pub fn spawn_signal_handler(stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Unable to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Unable to listen for interrupt");
                    return;
                }
                warn!("Interrupt received, finishing in-flight devices");
            }
            () = terminate => warn!("SIGTERM received, finishing in-flight devices"),
            () = stop.cancelled() => return,
        }
        stop.cancel();
    })
}

pub struct App {
    config: ButlerConfig,
    connector: Arc<dyn Connector>,
    metrics: Arc<Metrics>,
    stop: CancellationToken,
}

impl App {
    /// App talking to devices over IPMI.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured metrics exporter cannot be built.
    pub fn new(config: ButlerConfig) -> Result<Self> {
        let connector = IpmiConnector::new(&config.ipmitool.bin)
            .with_port(config.ipmitool.port)
            .with_timeout(config.ipmitool.timeout);
        let metrics = match &config.metrics {
            Some(settings) => Metrics::otlp(settings)?,
            None => Metrics::new(),
        };
        Ok(Self {
            config,
            connector: Arc::new(connector),
            metrics: Arc::new(metrics),
            stop: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ButlerConfig {
        &self.config
    }

    /// Token that interrupts the run when cancelled.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Read the device configuration template.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn load_template(&self) -> Result<Arc<str>> {
        let path = &self.config.resources_file;
        let template = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read device configuration {}", path.display()))?;
        Ok(Arc::from(template))
    }

    /// Apply the device configuration to every asset the inventory yields.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration template cannot be read.
    pub async fn configure(&self, inventory: Inventory) -> Result<RunSummary> {
        let template = self.load_template().await?;
        Ok(self.run(inventory, Action::Configure(template)).await)
    }

    /// Execute `command` on every asset the inventory yields.
    pub async fn execute(&self, inventory: Inventory, command: &str) -> RunSummary {
        self.run(inventory, Action::Execute(command.to_string()))
            .await
    }

    /// One batch run.
    pub async fn run(&self, inventory: Inventory, action: Action) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, action = action.name());
        self.run_inner(run_id, inventory, action)
            .instrument(span)
            .await
    }

    async fn run_inner(&self, run_id: Uuid, inventory: Inventory, action: Action) -> RunSummary {
        let started_at = Utc::now();
        let started = Instant::now();
        let config = &self.config;
        info!(
            butlers = config.butlers,
            dry_run = config.dry_run,
            resources = ?config.resources,
            "Run starting"
        );

        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Asset>>(config.inventory_capacity);
        let producer = {
            let source = Arc::clone(&inventory.source);
            let stop = self.stop.clone();
            tokio::spawn(async move { source.retrieve(batch_tx, stop).await })
        };

        let signer = config.cert_signer.clone().map(|kind| {
            Arc::new(
                Signer::new(kind)
                    .with_timeout(config.signer_timeout)
                    .with_debug(config.trace),
            )
        });
        let configurator = Configurator::new(
            Arc::clone(&self.connector),
            config.credentials.clone(),
            self.stop.clone(),
        )
        .with_resources(config.resources.clone())
        .with_signer(signer)
        .with_secrets(config.secrets.clone())
        .with_setup_marker(Arc::clone(&inventory.marker))
        .with_settle_delays(config.settle_delays)
        .with_metrics(Arc::clone(&self.metrics))
        .with_dry_run(config.dry_run);
        let executor = Executor::new(
            Arc::clone(&self.connector),
            config.credentials.clone(),
            self.stop.clone(),
        )
        .with_dry_run(config.dry_run);

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(config.queue_capacity);
        let mut butler = Butler::new(
            PoolSettings {
                size: config.butlers,
                locations: config.locations.clone(),
                ignore_location: config.ignore_location,
            },
            Arc::new(configurator),
            Arc::new(executor),
            Arc::clone(&self.metrics),
            self.stop.clone(),
        );
        butler.start(work_rx);

        let dispatched = dispatch(batch_rx, work_tx, &action, &self.stop).await;
        let pool = butler.wait().await;

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = format!("{e:#}"), "Inventory retrieval failed"),
            Err(e) => error!(error = %e, "Inventory task failed"),
        }

        self.metrics
            .add(metrics::ASSET_UNROUTABLE, dispatched.unroutable as u64);
        let summary = RunSummary {
            run_id,
            started_at,
            dispatched: dispatched.dispatched,
            handled: pool.handled,
            unroutable: dispatched.unroutable,
            interrupted: self.stop.is_cancelled(),
        };

        if summary.interrupted {
            warn!(
                handled = summary.handled,
                dispatched = summary.dispatched,
                "Run interrupted, devices actioned before shutdown: {}",
                summary.handled
            );
        } else {
            info!(
                handled = summary.handled,
                unroutable = summary.unroutable,
                elapsed_secs = started.elapsed().as_secs(),
                "Run complete"
            );
        }
        self.metrics.log_summary();
        let metrics = Arc::clone(&self.metrics);
        if let Err(e) = tokio::task::spawn_blocking(move || metrics.flush()).await {
            warn!(error = %e, "Metrics flush task failed");
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(serials: &[&str]) -> AssetBatch {
        serials
            .iter()
            .map(|s| Asset::new(*s, vec![format!("10.0.0.{}", s.len())]))
            .collect()
    }

    #[tokio::test]
    async fn test_dispatch_unpacks_batches_in_order() {
        let (batch_tx, batch_rx) = mpsc::channel(5);
        let (work_tx, mut work_rx) = mpsc::channel(10);

        batch_tx.send(batch(&["a", "b"])).await.unwrap();
        batch_tx.send(batch(&["c"])).await.unwrap();
        drop(batch_tx);

        let action = Action::Execute("powercycle".into());
        let stats = dispatch(batch_rx, work_tx, &action, &CancellationToken::new()).await;
        assert_eq!(stats.dispatched, 3);

        let mut serials = Vec::new();
        while let Some(item) = work_rx.recv().await {
            assert_eq!(item.action, action);
            serials.push(item.asset.serial);
        }
        assert_eq!(serials, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_dispatch_drops_unroutable_assets() {
        let (batch_tx, batch_rx) = mpsc::channel(5);
        let (work_tx, mut work_rx) = mpsc::channel(10);

        let mut assets = batch(&["a"]);
        assets.push(Asset::new("no-ip", vec![]));
        batch_tx.send(assets).await.unwrap();
        drop(batch_tx);

        let stats = dispatch(
            batch_rx,
            work_tx,
            &Action::Execute("bmc-reset".into()),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(stats, DispatchStats { dispatched: 1, unroutable: 1 });
        assert_eq!(work_rx.recv().await.unwrap().asset.serial, "a");
        assert!(work_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_stops_pulling_after_interrupt() {
        let (batch_tx, batch_rx) = mpsc::channel(5);
        let (work_tx, mut work_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();

        batch_tx.send(batch(&["a", "b", "c"])).await.unwrap();
        batch_tx.send(batch(&["d"])).await.unwrap();

        let handle = {
            let stop = stop.clone();
            tokio::spawn(async move {
                dispatch(batch_rx, work_tx, &Action::Execute("powercycle".into()), &stop).await
            })
        };

        // Queue holds one item; the dispatcher blocks on the second.
        assert_eq!(work_rx.recv().await.unwrap().asset.serial, "a");
        stop.cancel();
        let stats = handle.await.unwrap();

        assert!(stats.dispatched <= 2);
        let mut rest = Vec::new();
        while let Some(item) = work_rx.recv().await {
            rest.push(item.asset.serial);
        }
        assert!(!rest.contains(&"d".to_string()));
        drop(batch_tx);
    }
}
