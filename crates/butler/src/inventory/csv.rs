//! Flat file inventory.
//!
//! One asset per line: `serial,ip_addresses,kind,location`. Addresses are
//! separated by `;` or spaces, kind and location may be omitted. A header
//! row starting with `serial` is skipped, as are blank and `#` lines.

use super::{send_chunked, AssetBatch, AssetSelector, InventorySource};
use crate::asset::{Asset, DeviceKind};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BATCH_SIZE: usize = 10;

/// Parse inventory file contents.
///
/// # Errors
///
/// Returns an error naming the line when a row has no serial field.
pub fn parse(contents: &str) -> Result<Vec<Asset>> {
    let mut assets = Vec::new();

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if index == 0 && fields[0].eq_ignore_ascii_case("serial") {
            continue;
        }
        if fields[0].is_empty() {
            bail!("line {}: missing serial", index + 1);
        }

        let ip_addresses = fields
            .get(1)
            .map(|ips| {
                ips.split([';', ' '])
                    .filter(|ip| !ip.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let kind = match fields.get(2).filter(|k| !k.is_empty()) {
            Some(kind) => match kind.parse::<DeviceKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!(line = index + 1, error = %e, "Ignoring device kind");
                    None
                }
            },
            None => None,
        };

        let mut asset = Asset::new(fields[0], ip_addresses)
            .with_location(fields.get(3).copied().unwrap_or_default());
        asset.kind = kind;
        assets.push(asset);
    }

    Ok(assets)
}

/// Inventory read from a local file.
#[derive(Debug, Clone)]
pub struct CsvInventory {
    file: PathBuf,
    selector: AssetSelector,
    batch_size: usize,
}

impl CsvInventory {
    #[must_use]
    pub fn new(file: PathBuf, selector: AssetSelector) -> Self {
        Self {
            file,
            selector,
            batch_size: BATCH_SIZE,
        }
    }
}

#[async_trait]
impl InventorySource for CsvInventory {
    async fn retrieve(&self, tx: mpsc::Sender<AssetBatch>, stop: CancellationToken) -> Result<()> {
        let contents = tokio::fs::read_to_string(&self.file)
            .await
            .with_context(|| format!("Failed to read inventory file {}", self.file.display()))?;

        let assets: Vec<Asset> = parse(&contents)
            .with_context(|| format!("Invalid inventory file {}", self.file.display()))?
            .into_iter()
            .filter(|asset| self.selector.matches(asset))
            .collect();

        debug!(file = %self.file.display(), assets = assets.len(), "Inventory file loaded");
        send_chunked(&tx, assets, self.batch_size, &stop).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Scope;
    use std::io::Write;

    const INVENTORY: &str = "serial,ip_addresses,kind,location
# spare
CZ001,10.0.0.1;10.0.0.2,chassis,ams2
SRV01,10.0.1.1,server,fra4

SRV02,,server,
SRV03,10.0.1.3 10.0.1.4
";

    #[test]
    fn test_parse_rows() {
        let assets = parse(INVENTORY).unwrap();
        assert_eq!(assets.len(), 4);

        assert_eq!(assets[0].serial, "CZ001");
        assert_eq!(assets[0].ip_addresses, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(assets[0].kind, Some(DeviceKind::Chassis));
        assert_eq!(assets[0].location, "ams2");

        assert!(assets[2].ip_addresses.is_empty());
        assert_eq!(assets[3].ip_addresses, vec!["10.0.1.3", "10.0.1.4"]);
        assert_eq!(assets[3].kind, None);
    }

    #[test]
    fn test_parse_rejects_missing_serial() {
        let err = parse("CZ001,10.0.0.1\n,10.0.0.2\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_retrieve_filters_by_selector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INVENTORY.as_bytes()).unwrap();

        let inventory = CsvInventory::new(file.path().to_path_buf(), AssetSelector::scope(Scope::Servers));
        let (tx, mut rx) = mpsc::channel(5);
        inventory
            .retrieve(tx, CancellationToken::new())
            .await
            .unwrap();

        let mut serials = Vec::new();
        while let Some(batch) = rx.recv().await {
            serials.extend(batch.into_iter().map(|a| a.serial));
        }
        assert_eq!(serials, vec!["SRV01", "SRV02"]);
    }

    #[tokio::test]
    async fn test_retrieve_missing_file() {
        let inventory = CsvInventory::new(PathBuf::from("/nonexistent/inventory.csv"), AssetSelector::all());
        let (tx, _rx) = mpsc::channel(1);
        assert!(inventory
            .retrieve(tx, CancellationToken::new())
            .await
            .is_err());
    }
}
