//! Device driver capabilities.
//!
//! The core only talks to devices through these traits. A [`Connector`]
//! logs in and hands back a [`DeviceHandle`], which is either a server-class
//! or a chassis-class driver.

pub mod ipmi;

use crate::resources::{
    BiosConfig, CertAttributes, LdapConfig, LdapGroupConfig, LicenseConfig, NetworkConfig,
    NtpConfig, PowerConfig, SyslogConfig, UserConfig,
};
use async_trait::async_trait;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from device drivers.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No address/credential combination was accepted.
    #[error("login failed: {0}")]
    Login(String),

    /// Driver does not recognise the hardware behind the address.
    #[error("unknown device at {address}: {detail}")]
    UnknownDevice { address: String, detail: String },

    /// The driver does not implement this operation.
    #[error("{0} is not supported by this device")]
    Unsupported(String),

    /// A device command ran but failed.
    #[error("command failed: {0}")]
    Command(String),

    /// Declared configuration is incomplete for the operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local I/O error (spawning a tool, reading output).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Login pair tried against each candidate address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Certificates currently served by the device.
#[derive(Debug, Clone, Default)]
pub struct CurrentCertificate {
    pub certs: Vec<X509>,
    /// Device can generate its own CSR.
    pub csr_capable: bool,
}

/// A blade slot in a chassis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blade {
    pub position: u32,
    pub serial: String,
    pub flex_address_enabled: bool,
}

/// Operations every management controller supports.
#[async_trait]
pub trait Device: Send + Sync {
    fn vendor(&self) -> String;

    fn model(&self) -> String;

    /// Serial reported by the device itself.
    async fn serial(&mut self) -> Result<String, DeviceError>;

    /// End the management session. Safe to call more than once.
    async fn close(&mut self);

    async fn is_on(&mut self) -> Result<bool, DeviceError>;

    async fn power_on(&mut self) -> Result<bool, DeviceError>;

    async fn power_off(&mut self) -> Result<bool, DeviceError>;

    async fn power_cycle(&mut self) -> Result<bool, DeviceError>;

    /// Reset the management controller itself.
    async fn power_cycle_bmc(&mut self) -> Result<bool, DeviceError>;
}

fn unsupported<T>(resource: &str) -> Result<T, DeviceError> {
    Err(DeviceError::Unsupported(resource.to_string()))
}

/// Configuration resources.
///
/// `resources()` fixes the order they are applied in. Methods returning
/// `bool` report whether the change needs a controller reset to take effect.
#[async_trait]
pub trait Configure: Device {
    /// Resource names this driver applies, in application order.
    fn resources(&self) -> Vec<String>;

    async fn user(&mut self, _users: &[UserConfig]) -> Result<(), DeviceError> {
        unsupported("user")
    }

    async fn syslog(&mut self, _syslog: &SyslogConfig) -> Result<(), DeviceError> {
        unsupported("syslog")
    }

    async fn ntp(&mut self, _ntp: &NtpConfig) -> Result<(), DeviceError> {
        unsupported("ntp")
    }

    async fn ldap(&mut self, _ldap: &LdapConfig) -> Result<(), DeviceError> {
        unsupported("ldap")
    }

    async fn ldap_group(
        &mut self,
        _groups: &[LdapGroupConfig],
        _ldap: &LdapConfig,
    ) -> Result<(), DeviceError> {
        unsupported("ldap_group")
    }

    async fn set_license(&mut self, _license: &LicenseConfig) -> Result<(), DeviceError> {
        unsupported("license")
    }

    async fn network(&mut self, _network: &NetworkConfig) -> Result<bool, DeviceError> {
        unsupported("network")
    }

    async fn bios(&mut self, _bios: &BiosConfig) -> Result<(), DeviceError> {
        unsupported("bios")
    }

    async fn power(&mut self, _power: &PowerConfig) -> Result<(), DeviceError> {
        unsupported("power")
    }

    async fn current_https_cert(&mut self) -> Result<CurrentCertificate, DeviceError> {
        unsupported("https_cert")
    }

    /// Ask the device for a CSR (PEM) with the given subject.
    async fn generate_csr(&mut self, _attributes: &CertAttributes) -> Result<Vec<u8>, DeviceError> {
        unsupported("generate_csr")
    }

    /// Install a certificate and, when generated locally, its private key.
    async fn upload_https_cert(
        &mut self,
        _cert: &[u8],
        _cert_file_name: &str,
        _key: Option<&[u8]>,
        _key_file_name: &str,
    ) -> Result<bool, DeviceError> {
        unsupported("https_cert")
    }
}

/// A server BMC.
pub trait ServerDriver: Configure {}

/// A blade chassis controller.
#[async_trait]
pub trait ChassisDriver: Configure {
    /// Setup resource names, in application order.
    fn setup_resources(&self) -> Vec<String>;

    async fn blades(&mut self) -> Result<Vec<Blade>, DeviceError>;

    async fn is_on_blade(&mut self, position: u32) -> Result<bool, DeviceError>;

    async fn power_on_blade(&mut self, position: u32) -> Result<bool, DeviceError>;

    async fn power_off_blade(&mut self, position: u32) -> Result<bool, DeviceError>;

    async fn set_ipmi_over_lan(&mut self, position: u32, enable: bool)
        -> Result<bool, DeviceError>;

    async fn set_flex_address_state(
        &mut self,
        position: u32,
        enable: bool,
    ) -> Result<bool, DeviceError>;

    async fn set_dynamic_power(&mut self, enable: bool) -> Result<bool, DeviceError>;

    async fn add_blade_bmc_admin(&mut self, name: &str, password: &str)
        -> Result<(), DeviceError>;

    async fn remove_blade_bmc_user(&mut self, name: &str) -> Result<(), DeviceError>;
}

/// Driver returned by a successful login.
pub enum DeviceHandle {
    Server(Box<dyn ServerDriver>),
    Chassis(Box<dyn ChassisDriver>),
}

impl DeviceHandle {
    #[must_use]
    pub fn kind(&self) -> crate::asset::DeviceKind {
        match self {
            Self::Server(_) => crate::asset::DeviceKind::Server,
            Self::Chassis(_) => crate::asset::DeviceKind::Chassis,
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(d) => write!(f, "Server({} {})", d.vendor(), d.model()),
            Self::Chassis(d) => write!(f, "Chassis({} {})", d.vendor(), d.model()),
        }
    }
}

/// A logged-in session and the address that accepted it.
#[derive(Debug)]
pub struct Connection {
    pub handle: DeviceHandle,
    pub active_address: String,
}

/// Opens management sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Try each address with each credential, in order, until one works.
    async fn login(
        &self,
        addresses: &[String],
        credentials: &[Credential],
    ) -> Result<Connection, DeviceError>;
}
