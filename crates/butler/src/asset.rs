//! Devices under management and the work items that carry them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Hardware class reported by a driver after login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// A server BMC.
    Server,
    /// A blade chassis controller.
    Chassis,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Chassis => write!(f, "chassis"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" | "servers" | "blade" | "discrete" => Ok(Self::Server),
            "chassis" => Ok(Self::Chassis),
            other => Err(format!("unknown device kind: {other}")),
        }
    }
}

/// A device as known to the inventory, enriched during login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub serial: String,
    /// Candidate management addresses, tried in order.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    /// Address that accepted the login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Unknown until login unless the inventory declares it.
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DeviceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub location: String,
}

impl Asset {
    #[must_use]
    pub fn new(serial: impl Into<String>, ip_addresses: Vec<String>) -> Self {
        Self {
            serial: serial.into(),
            ip_addresses,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// True when at least one candidate address is present.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        self.ip_addresses.iter().any(|ip| !ip.trim().is_empty())
    }

    /// Identifier used in log lines: the serial, or the first address when
    /// the inventory had no serial (static IP lists).
    #[must_use]
    pub fn label(&self) -> &str {
        if !self.serial.is_empty() {
            return &self.serial;
        }
        self.ip_addresses.first().map_or("unknown", String::as_str)
    }
}

/// What a worker should do with an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Apply the templated device configuration, shared by every item of a run.
    Configure(Arc<str>),
    /// Run a named command such as `bmc-reset`.
    Execute(String),
}

impl Action {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Configure(_) => "configure",
            Self::Execute(_) => "execute",
        }
    }
}

/// One queued unit of work: one action on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub asset: Asset,
    pub action: Action,
}

impl WorkItem {
    #[must_use]
    pub fn new(asset: Asset, action: Action) -> Self {
        Self { asset, action }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_parse() {
        assert_eq!("Chassis".parse::<DeviceKind>().unwrap(), DeviceKind::Chassis);
        assert_eq!("discrete".parse::<DeviceKind>().unwrap(), DeviceKind::Server);
        assert!("switch".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_routable_ignores_blank_addresses() {
        assert!(!Asset::new("s1", vec![]).is_routable());
        assert!(!Asset::new("s1", vec![" ".into()]).is_routable());
        assert!(Asset::new("s1", vec!["10.0.0.1".into()]).is_routable());
    }

    #[test]
    fn test_label_falls_back_to_address() {
        let asset = Asset::new("", vec!["10.0.0.9".into()]);
        assert_eq!(asset.label(), "10.0.0.9");
        assert_eq!(Asset::new("ABC", vec![]).label(), "ABC");
    }

    #[test]
    fn test_asset_deserializes_type_alias() {
        let asset: Asset = serde_json::from_str(
            r#"{"serial":"X1","ip_addresses":["10.0.0.1"],"type":"chassis","location":"ams2"}"#,
        )
        .unwrap();
        assert_eq!(asset.kind, Some(DeviceKind::Chassis));
        assert_eq!(asset.location, "ams2");
    }
}
