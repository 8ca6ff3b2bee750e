//! Shared fakes for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use butler::device::{Blade, CurrentCertificate};
use butler::resources::{
    BiosConfig, LdapConfig, LdapGroupConfig, LicenseConfig, NetworkConfig, NtpConfig, PowerConfig,
    SyslogConfig, UserConfig,
};
use butler::{
    ChassisDriver, ChassisSetupMarker, Configure, Connection, Connector, Credential, Device,
    DeviceError, DeviceHandle, DeviceKind, ServerDriver,
};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SERVER_RESOURCES: &[&str] = &[
    "user",
    "syslog",
    "ntp",
    "ldap",
    "ldap_group",
    "network",
    "https_cert",
    "power",
];

pub const SETUP_RESOURCES: &[&str] = &[
    "setipmioverlan",
    "flexaddress",
    "dynamicpower",
    "bladespower",
    "add_blade_bmc_admins",
    "remove_blade_bmc_users",
];

/// Ordered record of driver calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    pub fn logins(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix("login ").map(ToString::to_string))
            .collect()
    }
}

/// Open session accounting.
#[derive(Debug, Default)]
pub struct Sessions {
    open: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl Sessions {
    fn opened(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// How a fake device behaves.
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub serial: String,
    pub resources: Vec<String>,
    /// Resources (and setup resources) that return an error.
    pub fail: Vec<String>,
    /// `network` asks for a controller reset.
    pub network_needs_reset: bool,
    pub power_cycle_bmc_fails: bool,
    /// Chassis power state; `None` makes `is_on` fail.
    pub is_on: Option<bool>,
    pub blades: Vec<Blade>,
    pub cert: Option<X509>,
    pub csr_capable: bool,
    /// Cancel this token once the named resource has been applied.
    pub cancel_after: Option<(String, CancellationToken)>,
    /// Time spent in each resource call.
    pub work: Duration,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            serial: "FAKE123".into(),
            resources: SERVER_RESOURCES.iter().map(ToString::to_string).collect(),
            fail: Vec::new(),
            network_needs_reset: false,
            power_cycle_bmc_fails: false,
            is_on: Some(true),
            blades: vec![
                Blade {
                    position: 1,
                    serial: "BLADE1".into(),
                    flex_address_enabled: true,
                },
                Blade {
                    position: 2,
                    serial: "BLADE2".into(),
                    flex_address_enabled: true,
                },
            ],
            cert: None,
            csr_capable: false,
            cancel_after: None,
            work: Duration::ZERO,
        }
    }
}

/// A fake server or chassis; which one depends on the connector.
pub struct FakeDevice {
    behaviour: Behaviour,
    log: CallLog,
    sessions: Arc<Sessions>,
    closed: bool,
}

impl FakeDevice {
    async fn call(&mut self, name: &str) -> Result<(), DeviceError> {
        if !self.behaviour.work.is_zero() {
            tokio::time::sleep(self.behaviour.work).await;
        }
        self.log.push(name);
        if let Some((after, token)) = &self.behaviour.cancel_after {
            if after == name {
                token.cancel();
            }
        }
        if self.behaviour.fail.iter().any(|f| f == name) {
            return Err(DeviceError::Command(format!("{name} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn vendor(&self) -> String {
        "fake".into()
    }

    fn model(&self) -> String {
        "fx1".into()
    }

    async fn serial(&mut self) -> Result<String, DeviceError> {
        Ok(self.behaviour.serial.clone())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sessions.closed();
            self.log.push("close");
        }
    }

    async fn is_on(&mut self) -> Result<bool, DeviceError> {
        self.log.push("is_on");
        self.behaviour
            .is_on
            .ok_or_else(|| DeviceError::Command("power state unavailable".into()))
    }

    async fn power_on(&mut self) -> Result<bool, DeviceError> {
        self.call("power_on").await.map(|()| true)
    }

    async fn power_off(&mut self) -> Result<bool, DeviceError> {
        self.call("power_off").await.map(|()| true)
    }

    async fn power_cycle(&mut self) -> Result<bool, DeviceError> {
        self.call("power_cycle").await.map(|()| true)
    }

    async fn power_cycle_bmc(&mut self) -> Result<bool, DeviceError> {
        self.log.push("power_cycle_bmc");
        if self.behaviour.power_cycle_bmc_fails {
            return Err(DeviceError::Command("reset refused".into()));
        }
        Ok(true)
    }
}

#[async_trait]
impl Configure for FakeDevice {
    fn resources(&self) -> Vec<String> {
        self.behaviour.resources.clone()
    }

    async fn user(&mut self, _users: &[UserConfig]) -> Result<(), DeviceError> {
        self.call("user").await
    }

    async fn syslog(&mut self, _syslog: &SyslogConfig) -> Result<(), DeviceError> {
        self.call("syslog").await
    }

    async fn ntp(&mut self, _ntp: &NtpConfig) -> Result<(), DeviceError> {
        self.call("ntp").await
    }

    async fn ldap(&mut self, _ldap: &LdapConfig) -> Result<(), DeviceError> {
        self.call("ldap").await
    }

    async fn ldap_group(
        &mut self,
        _groups: &[LdapGroupConfig],
        _ldap: &LdapConfig,
    ) -> Result<(), DeviceError> {
        self.call("ldap_group").await
    }

    async fn set_license(&mut self, _license: &LicenseConfig) -> Result<(), DeviceError> {
        self.call("license").await
    }

    async fn network(&mut self, _network: &NetworkConfig) -> Result<bool, DeviceError> {
        self.call("network").await?;
        Ok(self.behaviour.network_needs_reset)
    }

    async fn bios(&mut self, _bios: &BiosConfig) -> Result<(), DeviceError> {
        self.call("bios").await
    }

    async fn power(&mut self, _power: &PowerConfig) -> Result<(), DeviceError> {
        self.call("power").await
    }

    async fn current_https_cert(&mut self) -> Result<CurrentCertificate, DeviceError> {
        self.log.push("current_https_cert");
        Ok(CurrentCertificate {
            certs: self.behaviour.cert.iter().cloned().collect(),
            csr_capable: self.behaviour.csr_capable,
        })
    }

    async fn upload_https_cert(
        &mut self,
        cert: &[u8],
        cert_file_name: &str,
        key: Option<&[u8]>,
        _key_file_name: &str,
    ) -> Result<bool, DeviceError> {
        X509::stack_from_pem(cert).map_err(|e| DeviceError::Command(e.to_string()))?;
        self.log.push(format!(
            "upload_https_cert {cert_file_name} key={}",
            key.is_some()
        ));
        Ok(true)
    }
}

impl ServerDriver for FakeDevice {}

#[async_trait]
impl ChassisDriver for FakeDevice {
    fn setup_resources(&self) -> Vec<String> {
        SETUP_RESOURCES.iter().map(ToString::to_string).collect()
    }

    async fn blades(&mut self) -> Result<Vec<Blade>, DeviceError> {
        Ok(self.behaviour.blades.clone())
    }

    async fn is_on_blade(&mut self, _position: u32) -> Result<bool, DeviceError> {
        Ok(true)
    }

    async fn power_on_blade(&mut self, position: u32) -> Result<bool, DeviceError> {
        self.log.push(format!("power_on_blade {position}"));
        Ok(true)
    }

    async fn power_off_blade(&mut self, position: u32) -> Result<bool, DeviceError> {
        self.log.push(format!("power_off_blade {position}"));
        Ok(true)
    }

    async fn set_ipmi_over_lan(&mut self, position: u32, enable: bool) -> Result<bool, DeviceError> {
        self.call("setipmioverlan").await?;
        self.log.push(format!("ipmi_over_lan {position} {enable}"));
        Ok(true)
    }

    async fn set_flex_address_state(
        &mut self,
        position: u32,
        enable: bool,
    ) -> Result<bool, DeviceError> {
        self.call("flexaddress").await?;
        self.log.push(format!("flex_address {position} {enable}"));
        Ok(true)
    }

    async fn set_dynamic_power(&mut self, _enable: bool) -> Result<bool, DeviceError> {
        self.call("dynamicpower").await.map(|()| true)
    }

    async fn add_blade_bmc_admin(&mut self, name: &str, _password: &str) -> Result<(), DeviceError> {
        self.call("add_blade_bmc_admins").await?;
        self.log.push(format!("add_blade_bmc_admin {name}"));
        Ok(())
    }

    async fn remove_blade_bmc_user(&mut self, name: &str) -> Result<(), DeviceError> {
        self.call("remove_blade_bmc_users").await?;
        self.log.push(format!("remove_blade_bmc_user {name}"));
        Ok(())
    }
}

/// Hands out fake devices of one kind.
pub struct FakeConnector {
    pub kind: DeviceKind,
    pub behaviour: Behaviour,
    pub log: CallLog,
    pub sessions: Arc<Sessions>,
    /// Addresses that refuse every login.
    pub unreachable: Vec<String>,
    /// Addresses whose login panics.
    pub panics: Vec<String>,
}

impl FakeConnector {
    pub fn new(kind: DeviceKind, behaviour: Behaviour) -> Self {
        Self {
            kind,
            behaviour,
            log: CallLog::default(),
            sessions: Arc::new(Sessions::default()),
            unreachable: Vec::new(),
            panics: Vec::new(),
        }
    }

    pub fn server() -> Self {
        Self::new(DeviceKind::Server, Behaviour::default())
    }

    pub fn chassis() -> Self {
        Self::new(DeviceKind::Chassis, Behaviour::default())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn login(
        &self,
        addresses: &[String],
        credentials: &[Credential],
    ) -> Result<Connection, DeviceError> {
        for address in addresses {
            self.log.push(format!("login {address}"));
            assert!(
                !self.panics.contains(address),
                "driver blew up on {address}"
            );
            if self.unreachable.contains(address) || credentials.is_empty() {
                continue;
            }

            self.sessions.opened();
            let device = FakeDevice {
                behaviour: self.behaviour.clone(),
                log: self.log.clone(),
                sessions: Arc::clone(&self.sessions),
                closed: false,
            };
            let handle = match self.kind {
                DeviceKind::Server => DeviceHandle::Server(Box::new(device)),
                DeviceKind::Chassis => DeviceHandle::Chassis(Box::new(device)),
            };
            return Ok(Connection {
                handle,
                active_address: address.clone(),
            });
        }
        Err(DeviceError::Login(format!(
            "no credential accepted on {}",
            addresses.join(", ")
        )))
    }
}

/// Marker that remembers which chassis were marked.
#[derive(Debug, Clone, Default)]
pub struct RecordingMarker {
    pub marked: Arc<Mutex<Vec<String>>>,
}

impl RecordingMarker {
    pub fn marked(&self) -> Vec<String> {
        self.marked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChassisSetupMarker for RecordingMarker {
    async fn mark_setup_complete(&self, serial: &str) -> anyhow::Result<()> {
        self.marked.lock().unwrap().push(serial.to_string());
        Ok(())
    }
}

/// Self-signed certificate valid for `valid_hours` from now (negative for
/// an expired one).
pub fn issue_cert(common_name: &str, valid_hours: i64) -> X509 {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    let now = chrono::Utc::now().timestamp();
    builder
        .set_not_before(&Asn1Time::from_unix(now - 48 * 3600).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + valid_hours * 3600).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// Asset reachable on `ip`.
pub fn asset(serial: &str, ip: &str) -> butler::Asset {
    butler::Asset::new(serial, vec![ip.to_string()])
}

pub fn credentials() -> Vec<Credential> {
    vec![Credential::new("root", "calvin")]
}
