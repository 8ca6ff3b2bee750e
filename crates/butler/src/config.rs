//! Tool configuration.
//!
//! `butler.yml` is read once at startup, command line overrides are applied
//! on top, secrets are resolved and the result is validated. The returned
//! [`ButlerConfig`] is immutable for the rest of the run.
//!
//! ```yaml
//! butlers: 5
//! credentials:
//!   - username: root
//!     password: lookup_secret::bmc_root
//! locations: [ams2, fra4]
//! resources_file: configuration.yml
//! inventory:
//!   csv:
//!     file: inventory.csv
//! ```

use crate::butler::{DEFAULT_POOL_SIZE, DEFAULT_QUEUE_CAPACITY};
use crate::configure::SettleDelays;
use crate::device::Credential;
use crate::inventory::enc::EncConfig;
use crate::inventory::InventoryConfig;
use crate::metrics::MetricsSettings;
use crate::secrets::{SecretStore, VaultSettings, LOOKUP_PREFIX};
use crate::signer::{FakeSignerConfig, LemurSignerConfig, SignerKind, SIGNER_TIMEOUT};
use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable read when `vault.token_from_env` is set.
pub const VAULT_TOKEN_ENV: &str = "VAULT_TOKEN";

const MAX_QUEUE_CAPACITY: usize = 16;
const DEFAULT_INVENTORY_CAPACITY: usize = 5;
const MIN_VAULT_TOKEN_LEN: usize = 5;

fn default_resources_file() -> PathBuf {
    PathBuf::from("configuration.yml")
}

fn default_ipmitool_bin() -> String {
    "ipmitool".to_string()
}

fn default_ipmitool_port() -> u16 {
    623
}

fn default_ipmitool_timeout_secs() -> u64 {
    30
}

fn default_metrics_service_name() -> String {
    "bmcbutler".to_string()
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_blade_power_on_secs() -> u64 {
    20
}

fn default_blade_power_off_secs() -> u64 {
    10
}

fn default_flex_address_secs() -> u64 {
    10
}

/// Command line values that take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub butlers: Option<usize>,
    pub locations: Option<Vec<String>>,
    pub resources: Option<Vec<String>>,
    pub dry_run: bool,
    pub ignore_location: bool,
    /// Static address list; replaces the configured inventory.
    pub ips: Vec<String>,
    /// Running at trace level.
    pub trace: bool,
}

/// `ipmitool` invocation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmitoolSettings {
    pub bin: String,
    pub port: u16,
    pub timeout: Duration,
}

/// Validated configuration for one run.
#[derive(Debug, Clone)]
pub struct ButlerConfig {
    pub butlers: usize,
    pub queue_capacity: usize,
    pub inventory_capacity: usize,
    pub credentials: Vec<Credential>,
    pub locations: Vec<String>,
    pub ignore_location: bool,
    /// Resource allow-list; empty means every resource.
    pub resources: Vec<String>,
    pub dry_run: bool,
    pub resources_file: PathBuf,
    pub cert_signer: Option<SignerKind>,
    pub signer_timeout: Duration,
    pub inventory: InventoryConfig,
    pub settle_delays: SettleDelays,
    /// Loaded when `secrets_from_vault` is enabled.
    pub secrets: Option<Arc<SecretStore>>,
    pub ipmitool: IpmitoolSettings,
    /// OTLP export; counters are only logged when absent.
    pub metrics: Option<MetricsSettings>,
    pub trace: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    butlers: Option<usize>,
    queue_capacity: Option<usize>,
    inventory_capacity: Option<usize>,
    #[serde(default)]
    credentials: Vec<Credential>,
    #[serde(default)]
    locations: Vec<String>,
    #[serde(default)]
    ignore_location: bool,
    #[serde(default = "default_resources_file")]
    resources_file: PathBuf,
    #[serde(default)]
    cert_signer: RawSigner,
    #[serde(default)]
    inventory: RawInventory,
    #[serde(default)]
    settle_delays: RawSettleDelays,
    #[serde(default)]
    secrets_from_vault: bool,
    vault: Option<RawVault>,
    #[serde(default)]
    ipmitool: RawIpmitool,
    metrics: Option<RawMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSigner {
    fake: Option<FakeSignerConfig>,
    lemur: Option<LemurSignerConfig>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInventory {
    csv: Option<RawCsv>,
    enc: Option<EncConfig>,
}

#[derive(Debug, Deserialize)]
struct RawCsv {
    file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawSettleDelays {
    #[serde(default = "default_blade_power_on_secs")]
    blade_power_on_secs: u64,
    #[serde(default = "default_blade_power_off_secs")]
    blade_power_off_secs: u64,
    #[serde(default = "default_flex_address_secs")]
    flex_address_secs: u64,
}

impl Default for RawSettleDelays {
    fn default() -> Self {
        Self {
            blade_power_on_secs: default_blade_power_on_secs(),
            blade_power_off_secs: default_blade_power_off_secs(),
            flex_address_secs: default_flex_address_secs(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawVault {
    #[serde(default)]
    host_address: String,
    #[serde(default)]
    secrets_path: String,
    token: Option<String>,
    #[serde(default)]
    token_from_env: bool,
    token_from_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawMetrics {
    #[serde(default)]
    otlp_endpoint: String,
    #[serde(default = "default_metrics_service_name")]
    service_name: String,
    #[serde(default = "default_metrics_interval_secs")]
    interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct RawIpmitool {
    #[serde(default = "default_ipmitool_bin")]
    bin: String,
    #[serde(default = "default_ipmitool_port")]
    port: u16,
    #[serde(default = "default_ipmitool_timeout_secs")]
    timeout_secs: u64,
}

impl Default for RawIpmitool {
    fn default() -> Self {
        Self {
            bin: default_ipmitool_bin(),
            port: default_ipmitool_port(),
            timeout_secs: default_ipmitool_timeout_secs(),
        }
    }
}

impl ButlerConfig {
    /// Read, override, resolve and validate `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, a required
    /// setting is missing or inconsistent, or a secret cannot be resolved.
    pub async fn load(path: &Path, overrides: &Overrides) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let config = Self::parse(&contents, base_dir, overrides)
            .await
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Build a config from YAML text. Relative paths are resolved against
    /// `base_dir`.
    ///
    /// # Errors
    ///
    /// See [`ButlerConfig::load`].
    pub async fn parse(contents: &str, base_dir: &Path, overrides: &Overrides) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        let butlers = overrides
            .butlers
            .or(raw.butlers)
            .unwrap_or(DEFAULT_POOL_SIZE);
        ensure!(butlers >= 1, "butlers must be at least 1");

        let queue_capacity = raw.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        ensure!(
            (1..=MAX_QUEUE_CAPACITY).contains(&queue_capacity),
            "queue_capacity must be between 1 and {MAX_QUEUE_CAPACITY}, got {queue_capacity}"
        );
        let inventory_capacity = raw
            .inventory_capacity
            .unwrap_or(DEFAULT_INVENTORY_CAPACITY)
            .max(1);

        ensure!(!raw.credentials.is_empty(), "no BMC credentials declared");

        let inventory = inventory_config(raw.inventory, base_dir, &overrides.ips)?;
        let cert_signer = match (raw.cert_signer.fake, raw.cert_signer.lemur) {
            (Some(_), Some(_)) => bail!("cert_signer declares both fake and lemur, pick one"),
            (Some(fake), None) => Some(SignerKind::Fake(fake)),
            (None, Some(lemur)) => Some(SignerKind::Lemur(lemur)),
            (None, None) => None,
        };

        let metrics = raw.metrics.map(metrics_settings).transpose()?;

        let mut config = Self {
            butlers,
            queue_capacity,
            inventory_capacity,
            credentials: raw.credentials,
            locations: overrides.locations.clone().unwrap_or(raw.locations),
            ignore_location: overrides.ignore_location || raw.ignore_location,
            resources: overrides.resources.clone().unwrap_or_default(),
            dry_run: overrides.dry_run,
            resources_file: resolve_path(base_dir, raw.resources_file),
            cert_signer,
            signer_timeout: raw
                .cert_signer
                .timeout_secs
                .map_or(SIGNER_TIMEOUT, Duration::from_secs),
            inventory,
            settle_delays: SettleDelays {
                blade_power_on: Duration::from_secs(raw.settle_delays.blade_power_on_secs),
                blade_power_off: Duration::from_secs(raw.settle_delays.blade_power_off_secs),
                flex_address: Duration::from_secs(raw.settle_delays.flex_address_secs),
            },
            secrets: None,
            ipmitool: IpmitoolSettings {
                bin: raw.ipmitool.bin,
                port: raw.ipmitool.port,
                timeout: Duration::from_secs(raw.ipmitool.timeout_secs),
            },
            metrics,
            trace: overrides.trace,
        };

        if raw.secrets_from_vault {
            let settings = vault_settings(raw.vault.unwrap_or_default(), base_dir).await?;
            let store = SecretStore::load_from_vault(&settings)
                .await
                .context("Failed to load secrets from vault")?;
            config.resolve_secrets(&store)?;
            config.secrets = Some(Arc::new(store));
        } else {
            config.reject_secret_lookups()?;
        }

        debug!(
            butlers = config.butlers,
            credentials = config.credentials.len(),
            locations = ?config.locations,
            "Configuration validated"
        );
        Ok(config)
    }

    fn resolve_secrets(&mut self, store: &SecretStore) -> Result<()> {
        store
            .resolve_credentials(&mut self.credentials)
            .context("Failed to resolve credentials")?;
        match &mut self.cert_signer {
            Some(SignerKind::Fake(fake)) => {
                fake.passphrase = store
                    .resolve(&fake.passphrase)
                    .context("Failed to resolve fake signer passphrase")?;
            }
            Some(SignerKind::Lemur(lemur)) => {
                lemur.key = store
                    .resolve(&lemur.key)
                    .context("Failed to resolve lemur key")?;
            }
            None => {}
        }
        Ok(())
    }

    fn reject_secret_lookups(&self) -> Result<()> {
        let mut values: Vec<&str> = self
            .credentials
            .iter()
            .flat_map(|c| [c.username.as_str(), c.password.as_str()])
            .collect();
        match &self.cert_signer {
            Some(SignerKind::Fake(fake)) => values.push(&fake.passphrase),
            Some(SignerKind::Lemur(lemur)) => values.push(&lemur.key),
            None => {}
        }
        if values.iter().any(|v| v.starts_with(LOOKUP_PREFIX)) {
            bail!("{LOOKUP_PREFIX} values require secrets_from_vault");
        }
        Ok(())
    }
}

fn resolve_path(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn inventory_config(raw: RawInventory, base_dir: &Path, ips: &[String]) -> Result<InventoryConfig> {
    let config = match (raw.csv, raw.enc) {
        (Some(_), Some(_)) => bail!("inventory declares both csv and enc, pick one"),
        (Some(csv), None) => Some(InventoryConfig::Csv {
            file: resolve_path(base_dir, csv.file),
        }),
        (None, Some(enc)) => Some(InventoryConfig::Enc(enc)),
        (None, None) => None,
    };

    if !ips.is_empty() {
        return Ok(InventoryConfig::IpList(ips.to_vec()));
    }
    config.context("no inventory source declared")
}

fn metrics_settings(raw: RawMetrics) -> Result<MetricsSettings> {
    ensure!(
        !raw.otlp_endpoint.trim().is_empty(),
        "metrics.otlp_endpoint is required"
    );
    ensure!(raw.interval_secs >= 1, "metrics.interval_secs must be at least 1");
    Ok(MetricsSettings {
        endpoint: raw.otlp_endpoint.trim().to_string(),
        service_name: raw.service_name,
        interval: Duration::from_secs(raw.interval_secs),
    })
}

async fn vault_settings(raw: RawVault, base_dir: &Path) -> Result<VaultSettings> {
    ensure!(!raw.host_address.is_empty(), "vault.host_address is required");
    ensure!(!raw.secrets_path.is_empty(), "vault.secrets_path is required");

    let token = match (raw.token, raw.token_from_env, raw.token_from_file) {
        (Some(token), false, None) => token,
        (None, true, None) => std::env::var(VAULT_TOKEN_ENV)
            .with_context(|| format!("{VAULT_TOKEN_ENV} is not set"))?,
        (None, false, Some(file)) => {
            let file = resolve_path(base_dir, file);
            tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read vault token file {}", file.display()))?
        }
        _ => bail!("vault needs exactly one of token, token_from_env or token_from_file"),
    };

    let token = token.trim().to_string();
    ensure!(token.len() >= MIN_VAULT_TOKEN_LEN, "vault token is too short");

    Ok(VaultSettings {
        host_address: raw.host_address,
        secrets_path: raw.secrets_path,
        token,
    })
}
