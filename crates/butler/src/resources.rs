//! Declared device configuration and its per-device rendering.
//!
//! The configuration file is a handlebars template. It is rendered once per
//! device after login, when vendor, model and serial are known, then parsed
//! into a [`ResourcesConfig`]. Each section is optional and an absent section
//! means "do not touch".

use crate::asset::Asset;
use crate::secrets::{SecretStore, SecretsError};
use handlebars::Handlebars;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors from rendering a device configuration.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Template syntax or evaluation failure.
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    /// Rendered output is not a valid configuration document.
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A `lookup_secret::` reference could not be resolved.
    #[error(transparent)]
    Secret(#[from] SecretsError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub user: Option<Vec<UserConfig>>,
    #[serde(default)]
    pub syslog: Option<SyslogConfig>,
    #[serde(default)]
    pub ntp: Option<NtpConfig>,
    #[serde(default)]
    pub ldap: Option<LdapConfig>,
    #[serde(default)]
    pub ldap_group: Option<Vec<LdapGroupConfig>>,
    #[serde(default)]
    pub license: Option<LicenseConfig>,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub bios: Option<BiosConfig>,
    #[serde(default)]
    pub https_cert: Option<HttpsCertConfig>,
    #[serde(default)]
    pub power: Option<PowerConfig>,
    #[serde(default)]
    pub setup_chassis: Option<SetupChassisConfig>,
}

impl ResourcesConfig {
    /// True when no section is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_true")]
    pub enable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyslogConfig {
    pub server: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub enable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NtpConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    pub server1: String,
    #[serde(default)]
    pub server2: Option<String>,
    #[serde(default)]
    pub server3: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LdapConfig {
    pub server: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub enable: bool,
    pub base_dn: String,
    #[serde(default)]
    pub bind_dn: Option<String>,
    #[serde(default)]
    pub group_dn: Option<String>,
    #[serde(default)]
    pub user_attribute: Option<String>,
    #[serde(default)]
    pub group_attribute: Option<String>,
    #[serde(default)]
    pub search_filter: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LdapGroupConfig {
    pub role: String,
    pub group: String,
    #[serde(default)]
    pub group_base_dn: String,
    #[serde(default = "default_true")]
    pub enable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LicenseConfig {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub dns_from_dhcp: Option<bool>,
    #[serde(default)]
    pub ssh_enable: Option<bool>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ipmi_enable: Option<bool>,
    #[serde(default)]
    pub serial_over_lan_enable: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BiosConfig {
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

/// AC power restore behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerRestorePolicy {
    AlwaysOn,
    Previous,
    AlwaysOff,
}

impl PowerRestorePolicy {
    #[must_use]
    pub fn as_ipmi(self) -> &'static str {
        match self {
            Self::AlwaysOn => "always-on",
            Self::Previous => "previous",
            Self::AlwaysOff => "always-off",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PowerConfig {
    #[serde(default)]
    pub restore_policy: Option<PowerRestorePolicy>,
    #[serde(default)]
    pub power_cap_watts: Option<u32>,
}

/// Subject attributes for a device's HTTPS certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CertAttributes {
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub organization_unit: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub state_name: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub subject_alt_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpsCertConfig {
    #[serde(default)]
    pub attributes: CertAttributes,
    /// Renew when less than this much validity remains.
    #[serde(
        default,
        deserialize_with = "deserialize_duration",
        skip_serializing
    )]
    pub renew_before_expiry: Option<Duration>,
    /// Attribute names compared against the current certificate.
    #[serde(default)]
    pub validate_attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Toggle {
    pub enable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BladeUser {
    pub name: String,
    #[serde(default)]
    pub password: String,
}

/// One-time chassis setup, applied before the regular resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SetupChassisConfig {
    #[serde(default)]
    pub ipmi_over_lan: Option<Toggle>,
    #[serde(default)]
    pub flex_address: Option<Toggle>,
    #[serde(default)]
    pub dynamic_power: Option<Toggle>,
    #[serde(default)]
    pub blades_power: Option<Toggle>,
    #[serde(default)]
    pub add_blade_bmc_admins: Option<Vec<BladeUser>>,
    #[serde(default)]
    pub remove_blade_bmc_users: Option<Vec<BladeUser>>,
}

/// Parse durations of the form `720h`, `90m`, `1h30m` or `45s`.
///
/// # Errors
///
/// Returns a message when the string has no unit, an unknown unit, a
/// malformed number, or a total too large to represent.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {value}"))?;
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("unknown unit '{c}' in duration: {value}")),
        };
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("duration out of range: {value}"))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("missing unit in duration: {value}"));
    }
    Ok(Duration::from_secs(total))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Values available to the template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderContext {
    pub serial: String,
    pub vendor: String,
    pub model: String,
    pub ip_address: String,
    pub location: String,
    pub kind: String,
}

impl From<&Asset> for RenderContext {
    fn from(asset: &Asset) -> Self {
        Self {
            serial: asset.serial.clone(),
            vendor: asset.vendor.clone().unwrap_or_default(),
            model: asset.model.clone().unwrap_or_default(),
            ip_address: asset.ip_address.clone().unwrap_or_default(),
            location: asset.location.clone(),
            kind: asset.kind.map(|k| k.to_string()).unwrap_or_default(),
        }
    }
}

/// Render the raw template for one device.
///
/// Returns `Ok(None)` when the rendered document declares no section.
///
/// # Errors
///
/// Returns a [`RenderError`] when the template fails, the output is not a
/// valid document, or a secret reference cannot be resolved.
pub fn render(
    template: &str,
    context: &RenderContext,
    secrets: Option<&SecretStore>,
) -> Result<Option<ResourcesConfig>, RenderError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);
    handlebars.register_escape_fn(handlebars::no_escape);

    let rendered = handlebars.render_template(template, context)?;
    if rendered.trim().is_empty() {
        return Ok(None);
    }

    let mut document: serde_yaml::Value = serde_yaml::from_str(&rendered)?;
    if document.is_null() {
        return Ok(None);
    }
    if let Some(store) = secrets {
        store.resolve_yaml(&mut document)?;
    }

    let config: ResourcesConfig = serde_yaml::from_value(document)?;
    if config.is_empty() {
        Ok(None)
    } else {
        Ok(Some(config))
    }
}
