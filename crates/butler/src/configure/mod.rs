//! Per-device configuration.
//!
//! A [`Configurator`] takes one asset through login, template rendering,
//! optional chassis setup, the ordered resource loop and the reset decision.
//! Failures of individual resources end up in the [`ApplyReport`]; only
//! connection and rendering problems are returned as errors.

mod apply;
pub mod certificate;
mod setup;

pub use apply::{ApplyError, Resource};
pub use setup::{SettleDelays, SetupOutcome};

use crate::asset::{Asset, DeviceKind};
use crate::device::{
    ChassisDriver, Connection, Connector, Credential, Device, DeviceError, DeviceHandle,
    ServerDriver,
};
use crate::inventory::{ChassisSetupMarker, LoggingMarker};
use crate::metrics::{self, Metrics};
use crate::resources::{self, RenderContext, RenderError, ResourcesConfig};
use crate::secrets::SecretStore;
use crate::signer::Signer;
use apply::{apply_resources, ApplyContext};
use setup::{setup_chassis, SetupContext};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that end a device run before any resource is applied.
#[derive(Error, Debug)]
pub enum ConfigureError {
    /// Login failed on every address/credential pair.
    #[error("connect failed: {0}")]
    Connect(#[source] DeviceError),

    /// The configuration template could not be rendered for this device.
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
}

/// A resource that failed, with its error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    pub resource: String,
    pub error: String,
}

/// What happened to each resource of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Applied resources, in order.
    pub applied: Vec<String>,
    pub failed: Vec<ResourceFailure>,
    /// Undeclared, unknown or unsupported resources.
    pub skipped: Vec<String>,
    /// Applied resources that asked for a controller reset.
    pub reset_causes: Vec<String>,
    /// The stop signal cut the loop short.
    pub interrupted: bool,
    /// Outcome of the controller reset, when one was attempted.
    pub bmc_reset: Option<bool>,
    /// Session already closed ahead of the reset.
    pub session_closed: bool,
}

impl ApplyReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    #[must_use]
    pub fn failed_resources(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.resource.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// Dry run: nothing was contacted.
    DryRun,
    /// Stop signal fired before the device was contacted.
    Interrupted,
    /// The rendered configuration declares nothing.
    NothingToApply,
    Applied {
        kind: DeviceKind,
        setup: Option<SetupOutcome>,
        report: ApplyReport,
    },
}

/// Applies the declared configuration to devices.
pub struct Configurator {
    connector: Arc<dyn Connector>,
    credentials: Arc<[Credential]>,
    resources: Vec<String>,
    signer: Option<Arc<Signer>>,
    secrets: Option<Arc<SecretStore>>,
    marker: Arc<dyn ChassisSetupMarker>,
    delays: SettleDelays,
    metrics: Arc<Metrics>,
    dry_run: bool,
    stop: CancellationToken,
}

impl Configurator {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: impl Into<Arc<[Credential]>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            connector,
            credentials: credentials.into(),
            resources: Vec::new(),
            signer: None,
            secrets: None,
            marker: Arc::new(LoggingMarker),
            delays: SettleDelays::default(),
            metrics: Arc::new(Metrics::new()),
            dry_run: false,
            stop,
        }
    }

    /// Restrict the run to these resource names.
    #[must_use]
    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Option<Arc<Signer>>) -> Self {
        self.signer = signer;
        self
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: Option<Arc<SecretStore>>) -> Self {
        self.secrets = secrets;
        self
    }

    #[must_use]
    pub fn with_setup_marker(mut self, marker: Arc<dyn ChassisSetupMarker>) -> Self {
        self.marker = marker;
        self
    }

    #[must_use]
    pub fn with_settle_delays(mut self, delays: SettleDelays) -> Self {
        self.delays = delays;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Configure one device.
    ///
    /// The asset is updated with the active address and whatever the driver
    /// reports about the hardware.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigureError`] when login fails or the template cannot be
    /// rendered. Resource failures are reported in the outcome instead.
    pub async fn configure(
        &self,
        asset: &mut Asset,
        template: &str,
    ) -> Result<ConfigureOutcome, ConfigureError> {
        if self.dry_run {
            info!(serial = %asset.label(), "Dry run, configuration skipped");
            return Ok(ConfigureOutcome::DryRun);
        }
        if self.stop.is_cancelled() {
            debug!(serial = %asset.label(), "Interrupt received, not connecting");
            return Ok(ConfigureOutcome::Interrupted);
        }

        let started = Instant::now();
        let Connection {
            handle,
            active_address,
        } = self
            .connector
            .login(&asset.ip_addresses, &self.credentials)
            .await
            .map_err(ConfigureError::Connect)?;

        asset.ip_address = Some(active_address);
        asset.kind = Some(handle.kind());

        let outcome = match handle {
            DeviceHandle::Server(mut server) => {
                self.configure_server(asset, server.as_mut(), template)
                    .await
            }
            DeviceHandle::Chassis(mut chassis) => {
                self.configure_chassis(asset, chassis.as_mut(), template)
                    .await
            }
        };

        self.metrics
            .measure(metrics::CONFIGURE_RUNTIME, started.elapsed());
        outcome
    }

    /// Render for a logged-in device, closing the session when there is
    /// nothing left to do.
    async fn prepare<D: Device + ?Sized>(
        &self,
        asset: &mut Asset,
        device: &mut D,
        template: &str,
    ) -> Result<Option<ResourcesConfig>, ConfigureError> {
        identify(asset, device).await;

        match resources::render(template, &RenderContext::from(&*asset), self.secrets.as_deref()) {
            Ok(Some(config)) => Ok(Some(config)),
            Ok(None) => {
                info!(serial = %asset.label(), "Nothing to apply");
                device.close().await;
                Ok(None)
            }
            Err(e) => {
                device.close().await;
                Err(e.into())
            }
        }
    }

    async fn configure_server(
        &self,
        asset: &mut Asset,
        server: &mut dyn ServerDriver,
        template: &str,
    ) -> Result<ConfigureOutcome, ConfigureError> {
        let Some(config) = self.prepare(asset, server, template).await? else {
            return Ok(ConfigureOutcome::NothingToApply);
        };

        let report = apply_resources(server, &config, &self.apply_context(asset)).await;
        if !report.session_closed {
            server.close().await;
        }

        Ok(ConfigureOutcome::Applied {
            kind: DeviceKind::Server,
            setup: None,
            report,
        })
    }

    async fn configure_chassis(
        &self,
        asset: &mut Asset,
        chassis: &mut dyn ChassisDriver,
        template: &str,
    ) -> Result<ConfigureOutcome, ConfigureError> {
        let Some(config) = self.prepare(asset, chassis, template).await? else {
            return Ok(ConfigureOutcome::NothingToApply);
        };

        let setup = match &config.setup_chassis {
            Some(setup_config) => {
                let started = Instant::now();
                let ctx = SetupContext {
                    serial: asset.label(),
                    allow_list: &self.resources,
                    delays: self.delays,
                    stop: &self.stop,
                    marker: self.marker.as_ref(),
                };
                let outcome = setup_chassis(chassis, setup_config, &ctx).await;
                self.metrics
                    .measure(metrics::SETUP_CHASSIS_RUNTIME, started.elapsed());
                Some(outcome)
            }
            None => None,
        };

        let report = apply_resources(chassis, &config, &self.apply_context(asset)).await;
        if !report.session_closed {
            chassis.close().await;
        }

        Ok(ConfigureOutcome::Applied {
            kind: DeviceKind::Chassis,
            setup,
            report,
        })
    }

    fn apply_context<'a>(&'a self, asset: &'a Asset) -> ApplyContext<'a> {
        ApplyContext {
            serial: asset.label(),
            allow_list: &self.resources,
            signer: self.signer.as_deref(),
            stop: &self.stop,
        }
    }
}

/// Record what the driver reports about the hardware.
async fn identify<D: Device + ?Sized>(asset: &mut Asset, device: &mut D) {
    asset.vendor = Some(device.vendor());
    asset.model = Some(device.model());

    match device.serial().await {
        Ok(serial) if serial.is_empty() => {}
        Ok(serial) if asset.serial.is_empty() => asset.serial = serial,
        Ok(serial) => {
            if !serial.eq_ignore_ascii_case(&asset.serial) {
                warn!(
                    serial = %asset.serial,
                    device_serial = %serial,
                    "Device serial differs from inventory"
                );
            }
        }
        Err(e) => debug!(serial = %asset.label(), error = %e, "Unable to read device serial"),
    }
}
