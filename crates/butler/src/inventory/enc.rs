//! Inventory from an external node classifier command.
//!
//! The command is invoked as
//! `<bin> <args...> list --kind <all|chassis|server> --offset N --limit M [--serials a,b]`
//! and prints a JSON array of assets. Pages are requested until one comes
//! back short. Chassis setup completion is recorded with
//! `<bin> <args...> set-setup-complete --serial S`.

use super::{send_batch, AssetBatch, AssetSelector, ChassisSetupMarker, InventorySource};
use crate::asset::Asset;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncConfig {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct EncInventory {
    config: EncConfig,
    selector: AssetSelector,
}

impl EncInventory {
    #[must_use]
    pub fn new(config: EncConfig, selector: AssetSelector) -> Self {
        Self { config, selector }
    }

    async fn run(&self, extra: &[String]) -> Result<Vec<u8>> {
        debug!(bin = %self.config.bin, args = ?extra, "Invoking inventory command");

        let child = tokio::process::Command::new(&self.config.bin)
            .args(&self.config.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run inventory command {}", self.config.bin))?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Inventory command timed out after {timeout:?}"))?
            .context("Failed to collect inventory command output")?;

        if !output.status.success() {
            bail!(
                "Inventory command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    fn page_args(&self, offset: usize, limit: usize) -> Vec<String> {
        let mut args = vec![
            "list".to_string(),
            "--kind".to_string(),
            self.selector.scope.as_str().to_string(),
            "--offset".to_string(),
            offset.to_string(),
            "--limit".to_string(),
            limit.to_string(),
        ];
        if !self.selector.serials.is_empty() {
            args.push("--serials".to_string());
            args.push(self.selector.serials.join(","));
        }
        args
    }
}

#[async_trait]
impl InventorySource for EncInventory {
    async fn retrieve(&self, tx: mpsc::Sender<AssetBatch>, stop: CancellationToken) -> Result<()> {
        let limit = self.config.batch_size.max(1);
        let mut offset = 0;

        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            let stdout = self.run(&self.page_args(offset, limit)).await?;
            let page: Vec<Asset> = serde_json::from_slice(&stdout)
                .context("Inventory command returned invalid JSON")?;
            let received = page.len();

            let batch: AssetBatch = page
                .into_iter()
                .filter(|asset| self.selector.matches(asset))
                .collect();
            if !send_batch(&tx, batch, &stop).await {
                return Ok(());
            }

            if received < limit {
                return Ok(());
            }
            offset += received;
        }
    }
}

#[async_trait]
impl ChassisSetupMarker for EncInventory {
    async fn mark_setup_complete(&self, serial: &str) -> Result<()> {
        self.run(&[
            "set-setup-complete".to_string(),
            "--serial".to_string(),
            serial.to_string(),
        ])
        .await?;
        info!(serial = %serial, "Chassis setup recorded in inventory");
        Ok(())
    }
}
