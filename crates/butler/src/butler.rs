//! Worker pool.
//!
//! `size` workers share one bounded work queue. Each worker pulls an item,
//! filters it, and hands it to the configure or execute handler. Workers
//! exit when the queue is closed and drained, or when the stop token fires;
//! an item already being handled is always finished first.

use crate::asset::{Action, WorkItem};
use crate::configure::{ConfigureOutcome, Configurator};
use crate::execute::{ExecuteOutcome, Executor};
use crate::filter::{FilterDecision, LocationFilter};
use crate::metrics::{self, Metrics};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub size: usize,
    pub locations: Vec<String>,
    pub ignore_location: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            locations: Vec::new(),
            ignore_location: false,
        }
    }
}

/// Totals reported by [`Butler::wait`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    /// Items pulled off the queue, including filtered ones.
    pub handled: usize,
    /// Workers that died instead of returning.
    pub failed_workers: usize,
}

type Queue = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

pub struct Butler {
    settings: PoolSettings,
    configurator: Arc<Configurator>,
    executor: Arc<Executor>,
    metrics: Arc<Metrics>,
    stop: CancellationToken,
    workers: JoinSet<usize>,
}

impl Butler {
    #[must_use]
    pub fn new(
        settings: PoolSettings,
        configurator: Arc<Configurator>,
        executor: Arc<Executor>,
        metrics: Arc<Metrics>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            settings,
            configurator,
            executor,
            metrics,
            stop,
            workers: JoinSet::new(),
        }
    }

    /// Spawn the workers on `queue`.
    pub fn start(&mut self, queue: mpsc::Receiver<WorkItem>) {
        let queue: Queue = Arc::new(Mutex::new(queue));
        let filter = Arc::new(LocationFilter::new(
            self.settings.locations.clone(),
            self.settings.ignore_location,
        ));

        let size = self.settings.size.max(1);
        for id in 0..size {
            let worker = Worker {
                id,
                queue: Arc::clone(&queue),
                filter: Arc::clone(&filter),
                configurator: Arc::clone(&self.configurator),
                executor: Arc::clone(&self.executor),
                metrics: Arc::clone(&self.metrics),
                stop: self.stop.clone(),
            };
            self.workers.spawn(worker.run());
        }
        debug!(workers = size, "Butlers started");
    }

    /// Block until every worker has exited.
    pub async fn wait(&mut self) -> PoolStats {
        let mut stats = PoolStats::default();
        while let Some(result) = self.workers.join_next().await {
            stats.workers += 1;
            match result {
                Ok(handled) => stats.handled += handled,
                Err(e) => {
                    error!(error = %e, "Butler task failed");
                    stats.failed_workers += 1;
                }
            }
        }
        debug!(handled = stats.handled, "Butlers finished");
        stats
    }
}

struct Worker {
    id: usize,
    queue: Queue,
    filter: Arc<LocationFilter>,
    configurator: Arc<Configurator>,
    executor: Arc<Executor>,
    metrics: Arc<Metrics>,
    stop: CancellationToken,
}

impl Worker {
    async fn next(&self) -> Option<WorkItem> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            () = self.stop.cancelled() => None,
            item = queue.recv() => item,
        }
    }

    async fn run(self) -> usize {
        let mut handled = 0;
        loop {
            if self.stop.is_cancelled() {
                debug!(butler = self.id, "Interrupt received, butler exiting");
                break;
            }
            let Some(item) = self.next().await else {
                break;
            };
            handled += 1;

            let serial = item.asset.label().to_string();
            if let Err(panic) = AssertUnwindSafe(self.handle(item)).catch_unwind().await {
                error!(
                    butler = self.id,
                    serial = %serial,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked"
                );
                self.metrics.incr(metrics::HANDLER_PANIC);
            }
        }
        handled
    }

    async fn handle(&self, item: WorkItem) {
        let WorkItem { mut asset, action } = item;
        self.metrics.incr(metrics::ASSET_RECEIVED);

        match self.filter.evaluate(&asset) {
            FilterDecision::Accept => {}
            FilterDecision::Unroutable => {
                debug!(serial = %asset.label(), "Asset has no address, skipped");
                self.metrics.incr(metrics::ASSET_UNROUTABLE);
                return;
            }
            FilterDecision::UnmanagedLocation(location) => {
                debug!(serial = %asset.label(), location = %location, "Asset location not managed, skipped");
                self.metrics.incr(metrics::ASSET_LOCATION_UNMANAGED);
                return;
            }
        }

        match action {
            Action::Configure(template) => {
                match self.configurator.configure(&mut asset, &template).await {
                    Ok(ConfigureOutcome::Applied { report, .. }) if report.is_success() => {
                        self.metrics.incr(metrics::CONFIGURE_SUCCESS);
                    }
                    Ok(ConfigureOutcome::Applied { .. }) => {
                        self.metrics.incr(metrics::CONFIGURE_PARTIAL);
                    }
                    Ok(
                        ConfigureOutcome::DryRun
                        | ConfigureOutcome::Interrupted
                        | ConfigureOutcome::NothingToApply,
                    ) => self.metrics.incr(metrics::CONFIGURE_SKIPPED),
                    Err(e) => {
                        warn!(serial = %asset.label(), error = %e, "Configure failed");
                        self.metrics.incr(metrics::CONFIGURE_FAIL);
                    }
                }
            }
            Action::Execute(command) => match self.executor.execute(&mut asset, &command).await {
                Ok(ExecuteOutcome::Executed { .. }) => {
                    self.metrics.incr(metrics::EXECUTE_SUCCESS);
                }
                Ok(ExecuteOutcome::DryRun | ExecuteOutcome::Interrupted) => {
                    info!(serial = %asset.label(), command = %command, "Command skipped");
                }
                Err(e) => {
                    warn!(serial = %asset.label(), error = %e, "Execute failed");
                    self.metrics.incr(metrics::EXECUTE_FAIL);
                }
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
