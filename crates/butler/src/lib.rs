//! Fleet configuration for baseboard and chassis management controllers.
//!
//! An inventory source produces batches of [`Asset`]s. The [`App`] unpacks
//! them into [`WorkItem`]s on a bounded queue, and a [`Butler`] pool of
//! workers connects to each device and either applies the declared
//! configuration or executes a one-off command.
//!
//! # Example
//!
//! ```rust,ignore
//! use butler::inventory::Inventory;
//! use butler::{App, AssetSelector, ButlerConfig, Overrides};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ButlerConfig::load(Path::new("butler.yml"), &Overrides::default()).await?;
//!     let inventory = Inventory::build(&config.inventory, AssetSelector::all());
//!     let summary = App::new(config)?.configure(inventory).await?;
//!     println!("{} devices handled", summary.handled);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod asset;
pub mod butler;
pub mod config;
pub mod configure;
pub mod device;
pub mod execute;
pub mod filter;
pub mod inventory;
pub mod metrics;
pub mod resources;
pub mod secrets;
pub mod signer;

pub use app::{App, RunSummary};
pub use asset::{Action, Asset, DeviceKind, WorkItem};
pub use butler::{Butler, PoolSettings, PoolStats};
pub use config::{ButlerConfig, Overrides};
pub use configure::{ApplyReport, ConfigureError, ConfigureOutcome, Configurator, SettleDelays};
pub use device::{
    ChassisDriver, Configure, Connection, Connector, Credential, Device, DeviceError, DeviceHandle,
    ServerDriver,
};
pub use execute::{ExecuteCommand, ExecuteError, ExecuteOutcome, Executor};
pub use inventory::{AssetSelector, ChassisSetupMarker, InventorySource};
pub use metrics::Metrics;
