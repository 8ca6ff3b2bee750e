//! Run counters and timers.
//!
//! A [`Metrics`] value is created once per run and handed to the pool and
//! handlers behind an `Arc`; nothing here is process-global. Every counter
//! and timer is an OpenTelemetry instrument on the sink's own meter
//! provider, exported over OTLP when `metrics:` is configured. A local tally
//! of each instrument backs the end of run summary.

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider as _};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ASSET_RECEIVED: &str = "asset_received";
pub const ASSET_UNROUTABLE: &str = "asset_unroutable";
pub const ASSET_LOCATION_UNMANAGED: &str = "asset_location_unmanaged";
pub const CONFIGURE_SUCCESS: &str = "configure_success";
pub const CONFIGURE_PARTIAL: &str = "configure_partial";
pub const CONFIGURE_FAIL: &str = "configure_fail";
pub const CONFIGURE_SKIPPED: &str = "configure_skipped";
pub const EXECUTE_SUCCESS: &str = "execute_success";
pub const EXECUTE_FAIL: &str = "execute_fail";
pub const HANDLER_PANIC: &str = "handler_panic";
pub const CONFIGURE_RUNTIME: &str = "configure_runtime";
pub const SETUP_CHASSIS_RUNTIME: &str = "setup_chassis_runtime";

const METER_NAME: &str = "butler";

const COUNTERS: [(&str, &str); 10] = [
    (ASSET_RECEIVED, "Assets taken off the work queue"),
    (ASSET_UNROUTABLE, "Assets without a usable address"),
    (ASSET_LOCATION_UNMANAGED, "Assets in a location this run does not manage"),
    (CONFIGURE_SUCCESS, "Devices configured without failures"),
    (CONFIGURE_PARTIAL, "Devices where some resources failed"),
    (CONFIGURE_FAIL, "Devices that could not be configured"),
    (CONFIGURE_SKIPPED, "Devices skipped before configuration"),
    (EXECUTE_SUCCESS, "Commands executed"),
    (EXECUTE_FAIL, "Commands that failed or were rejected"),
    (HANDLER_PANIC, "Work items whose handler panicked"),
];

const TIMERS: [(&str, &str); 2] = [
    (CONFIGURE_RUNTIME, "Time spent configuring one device"),
    (SETUP_CHASSIS_RUNTIME, "Time spent on one-time chassis setup"),
];

/// OTLP export settings from the `metrics:` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Collector endpoint, e.g. `http://otel-collector:4317`.
    pub endpoint: String,
    pub service_name: String,
    pub interval: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

#[derive(Debug)]
struct Tally {
    counter: Counter<u64>,
    value: AtomicU64,
}

#[derive(Debug)]
struct Timer {
    histogram: Histogram<f64>,
    timing: Mutex<Timing>,
}

#[derive(Debug)]
pub struct Metrics {
    provider: SdkMeterProvider,
    counters: HashMap<&'static str, Tally>,
    timers: HashMap<&'static str, Timer>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Sink with no exporter attached; values are only kept for the summary.
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(SdkMeterProvider::builder().build())
    }

    /// Sink that pushes to an OTLP collector every `settings.interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OTLP exporter cannot be built.
    pub fn otlp(settings: &MetricsSettings) -> Result<Self> {
        let exporter = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(settings.endpoint.clone())
            .build()
            .with_context(|| format!("Failed to build OTLP exporter for {}", settings.endpoint))?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(settings.interval)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(
                Resource::builder()
                    .with_service_name(settings.service_name.clone())
                    .build(),
            )
            .build();

        info!(endpoint = %settings.endpoint, "Exporting metrics over OTLP");
        Ok(Self::with_provider(provider))
    }

    /// Sink recording into an existing meter provider.
    #[must_use]
    pub fn with_provider(provider: SdkMeterProvider) -> Self {
        let meter = provider.meter(METER_NAME);
        let counters = COUNTERS
            .iter()
            .map(|&(name, description)| (name, tally(&meter, name, description)))
            .collect();
        let timers = TIMERS
            .iter()
            .map(|&(name, description)| (name, timer(&meter, name, description)))
            .collect();

        Self {
            provider,
            counters,
            timers,
        }
    }

    pub fn incr(&self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &str, value: u64) {
        match self.counters.get(key) {
            Some(tally) => {
                tally.counter.add(value, &[]);
                tally.value.fetch_add(value, Ordering::Relaxed);
            }
            None => debug!(metric = %key, "Unknown counter"),
        }
    }

    pub fn measure(&self, key: &str, elapsed: Duration) {
        let Some(timer) = self.timers.get(key) else {
            debug!(metric = %key, "Unknown timer");
            return;
        };
        timer
            .histogram
            .record(elapsed.as_secs_f64() * 1_000.0, &[]);
        if let Ok(mut timing) = timer.timing.lock() {
            timing.count += 1;
            timing.total += elapsed;
            timing.max = timing.max.max(elapsed);
        }
    }

    /// Current value of a counter; zero when never incremented.
    #[must_use]
    pub fn get(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map_or(0, |tally| tally.value.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn timing(&self, key: &str) -> Option<Timing> {
        let timing = self.timers.get(key)?.timing.lock().ok().map(|t| *t)?;
        (timing.count > 0).then_some(timing)
    }

    /// Counters that were incremented at least once.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|(name, tally)| ((*name).to_string(), tally.value.load(Ordering::Relaxed)))
            .filter(|(_, value)| *value > 0)
            .collect()
    }

    /// Log every counter and timer at info level.
    pub fn log_summary(&self) {
        for (key, value) in self.snapshot() {
            info!(metric = %key, value, "Counter");
        }
        for (key, _) in TIMERS {
            if let Some(timing) = self.timing(key) {
                info!(
                    metric = %key,
                    count = timing.count,
                    total_ms = u64::try_from(timing.total.as_millis()).unwrap_or(u64::MAX),
                    max_ms = u64::try_from(timing.max.as_millis()).unwrap_or(u64::MAX),
                    "Timer"
                );
            }
        }
    }

    /// Push everything recorded so far to the exporter. Blocks until the
    /// export finishes.
    pub fn flush(&self) {
        if let Err(e) = self.provider.force_flush() {
            warn!(error = %e, "Failed to flush metrics");
        }
    }
}

fn tally(meter: &Meter, name: &'static str, description: &'static str) -> Tally {
    Tally {
        counter: meter.u64_counter(name).with_description(description).build(),
        value: AtomicU64::new(0),
    }
}

fn timer(meter: &Meter, name: &'static str, description: &'static str) -> Timer {
    Timer {
        histogram: meter
            .f64_histogram(name)
            .with_unit("ms")
            .with_description(description)
            .build(),
        timing: Mutex::new(Timing::default()),
    }
}
