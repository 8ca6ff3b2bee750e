//! Static address list from the command line.

use super::{send_chunked, AssetBatch, InventorySource};
use crate::asset::Asset;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One asset per address, serial unknown until login.
#[derive(Debug, Clone)]
pub struct IpListInventory {
    ips: Vec<String>,
}

impl IpListInventory {
    #[must_use]
    pub fn new(ips: Vec<String>) -> Self {
        Self { ips }
    }
}

#[async_trait]
impl InventorySource for IpListInventory {
    async fn retrieve(&self, tx: mpsc::Sender<AssetBatch>, stop: CancellationToken) -> Result<()> {
        let assets = self
            .ips
            .iter()
            .map(|ip| ip.trim())
            .filter(|ip| !ip.is_empty())
            .map(|ip| Asset::new("", vec![ip.to_string()]))
            .collect();
        send_chunked(&tx, assets, 1, &stop).await;
        Ok(())
    }
}
