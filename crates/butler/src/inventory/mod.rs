//! Inventory sources.
//!
//! A source pushes batches of assets into a bounded channel until it runs
//! out or the run is stopped. Sources that can record chassis setup state
//! also implement [`ChassisSetupMarker`].

pub mod csv;
pub mod enc;
pub mod iplist;

use crate::asset::{Asset, DeviceKind};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type AssetBatch = Vec<Asset>;

/// Produces batches of assets.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Send every selected asset on `tx`, in batches.
    ///
    /// Returns once the inventory is exhausted, the receiver is gone or
    /// `stop` fires.
    async fn retrieve(&self, tx: mpsc::Sender<AssetBatch>, stop: CancellationToken) -> Result<()>;
}

/// Records that a chassis finished its one-time setup.
#[async_trait]
pub trait ChassisSetupMarker: Send + Sync {
    async fn mark_setup_complete(&self, serial: &str) -> Result<()>;
}

/// Marker for sources with nowhere to record setup state.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMarker;

#[async_trait]
impl ChassisSetupMarker for LoggingMarker {
    async fn mark_setup_complete(&self, serial: &str) -> Result<()> {
        info!(serial = %serial, "Chassis setup complete, inventory not updated");
        Ok(())
    }
}

/// Which device classes a run targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    #[default]
    All,
    Chassis,
    Servers,
}

impl Scope {
    /// Name used on the inventory command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Chassis => "chassis",
            Self::Servers => "server",
        }
    }
}

/// Operator selection of assets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetSelector {
    pub scope: Scope,
    /// Only these serials, when non-empty.
    pub serials: Vec<String>,
    /// Static address list; replaces the configured inventory.
    pub ips: Vec<String>,
}

impl AssetSelector {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scope(scope: Scope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn serials(serials: Vec<String>) -> Self {
        Self {
            serials,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn ips(ips: Vec<String>) -> Self {
        Self {
            ips,
            ..Self::default()
        }
    }

    /// Assets of unknown kind only match the `All` scope.
    #[must_use]
    pub fn matches(&self, asset: &Asset) -> bool {
        let in_scope = match self.scope {
            Scope::All => true,
            Scope::Chassis => asset.kind == Some(DeviceKind::Chassis),
            Scope::Servers => asset.kind == Some(DeviceKind::Server),
        };
        in_scope
            && (self.serials.is_empty()
                || self
                    .serials
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(&asset.serial)))
    }
}

/// Send one batch unless stopped. Returns `false` when the caller should
/// stop producing.
pub(crate) async fn send_batch(
    tx: &mpsc::Sender<AssetBatch>,
    batch: AssetBatch,
    stop: &CancellationToken,
) -> bool {
    if batch.is_empty() {
        return true;
    }
    tokio::select! {
        biased;
        () = stop.cancelled() => false,
        sent = tx.send(batch) => sent.is_ok(),
    }
}

/// Send assets in batches of `batch_size`.
pub(crate) async fn send_chunked(
    tx: &mpsc::Sender<AssetBatch>,
    assets: Vec<Asset>,
    batch_size: usize,
    stop: &CancellationToken,
) -> bool {
    for chunk in assets.chunks(batch_size.max(1)) {
        if !send_batch(tx, chunk.to_vec(), stop).await {
            return false;
        }
    }
    true
}

/// Configured inventory backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryConfig {
    Csv { file: PathBuf },
    Enc(enc::EncConfig),
    IpList(Vec<String>),
}

/// A source and the marker that goes with it.
#[derive(Clone)]
pub struct Inventory {
    pub source: Arc<dyn InventorySource>,
    pub marker: Arc<dyn ChassisSetupMarker>,
}

impl Inventory {
    /// Build the backend for a run. A selector with addresses always uses
    /// the static list.
    #[must_use]
    pub fn build(config: &InventoryConfig, selector: AssetSelector) -> Self {
        if !selector.ips.is_empty() {
            return Self {
                source: Arc::new(iplist::IpListInventory::new(selector.ips)),
                marker: Arc::new(LoggingMarker),
            };
        }
        match config {
            InventoryConfig::Csv { file } => Self {
                source: Arc::new(csv::CsvInventory::new(file.clone(), selector)),
                marker: Arc::new(LoggingMarker),
            },
            InventoryConfig::Enc(enc_config) => {
                let enc = Arc::new(enc::EncInventory::new(enc_config.clone(), selector));
                Self {
                    source: enc.clone(),
                    marker: enc,
                }
            }
            InventoryConfig::IpList(ips) => Self {
                source: Arc::new(iplist::IpListInventory::new(ips.clone())),
                marker: Arc::new(LoggingMarker),
            },
        }
    }
}
