//! Generic server driver on top of `ipmitool`.
//!
//! Works with any BMC that speaks IPMI over LAN. It supports power control,
//! controller reset, user accounts and the AC power restore policy.

use super::{
    Configure, Connection, Connector, Credential, Device, DeviceError, DeviceHandle, ServerDriver,
};
use crate::resources::{PowerConfig, UserConfig};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 623;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Channel used for LAN user privileges.
const LAN_CHANNEL: &str = "1";
/// Slot 1 is reserved for the anonymous user on most BMCs.
const FIRST_USER_SLOT: u32 = 2;

/// One `ipmitool -I lanplus` target.
#[derive(Debug, Clone)]
pub struct IpmiSession {
    binary: PathBuf,
    address: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl IpmiSession {
    /// Run an ipmitool command and return its stdout.
    ///
    /// The password is handed over through `IPMITOOL_PASSWORD` so it never
    /// shows up in the process list.
    async fn run(&self, command: &[&str]) -> Result<String, DeviceError> {
        let port = self.port.to_string();
        let mut args = vec![
            "-I",
            "lanplus",
            "-H",
            &self.address,
            "-p",
            &port,
            "-U",
            &self.username,
            "-E",
        ];
        args.extend_from_slice(command);

        debug!(
            bmc_address = %self.address,
            command = %command.join(" "),
            "Executing IPMI command"
        );

        let child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .env("IPMITOOL_PASSWORD", &self.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                DeviceError::Command(format!(
                    "ipmitool {} timed out after {:?}",
                    command.join(" "),
                    self.timeout
                ))
            })??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DeviceError::Command(format!(
                "ipmitool {} failed: {}",
                command.join(" "),
                stderr.trim()
            )))
        }
    }
}

/// Logs in to BMCs with `ipmitool mc info`.
#[derive(Debug, Clone)]
pub struct IpmiConnector {
    binary: PathBuf,
    port: u16,
    timeout: Duration,
}

impl Default for IpmiConnector {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ipmitool"),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl IpmiConnector {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for IpmiConnector {
    async fn login(
        &self,
        addresses: &[String],
        credentials: &[Credential],
    ) -> Result<Connection, DeviceError> {
        let mut last_error = None;

        for address in addresses.iter().filter(|a| !a.trim().is_empty()) {
            for credential in credentials {
                let session = IpmiSession {
                    binary: self.binary.clone(),
                    address: address.clone(),
                    port: self.port,
                    username: credential.username.clone(),
                    password: credential.password.clone(),
                    timeout: self.timeout,
                };

                match session.run(&["mc", "info"]).await {
                    Ok(output) => {
                        let info = McInfo::parse(&output);
                        if info.manufacturer.is_empty() {
                            return Err(DeviceError::UnknownDevice {
                                address: address.clone(),
                                detail: "mc info reported no manufacturer".into(),
                            });
                        }
                        debug!(
                            bmc_address = %address,
                            vendor = %info.manufacturer,
                            model = %info.product,
                            "IPMI login successful"
                        );
                        return Ok(Connection {
                            handle: DeviceHandle::Server(Box::new(IpmiServer::new(session, info))),
                            active_address: address.clone(),
                        });
                    }
                    Err(e) => {
                        debug!(bmc_address = %address, error = %e, "IPMI login attempt failed");
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(DeviceError::Login(last_error.map_or_else(
            || "no usable address or credential".to_string(),
            |e| e.to_string(),
        )))
    }
}

/// Fields of interest from `mc info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McInfo {
    pub manufacturer: String,
    pub product: String,
    pub firmware: String,
}

impl McInfo {
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let mut info = Self::default();
        for (key, value) in key_values(output) {
            match key {
                "Manufacturer Name" => info.manufacturer = value.to_string(),
                "Product Name" => info.product = value.to_string(),
                "Firmware Revision" => info.firmware = value.to_string(),
                _ => {}
            }
        }
        info
    }
}

fn key_values(output: &str) -> impl Iterator<Item = (&str, &str)> {
    output.lines().filter_map(|line| {
        let (key, value) = line.split_once(':')?;
        Some((key.trim(), value.trim()))
    })
}

/// Serial from `fru print 0`, preferring the product serial.
#[must_use]
pub fn parse_fru_serial(output: &str) -> Option<String> {
    let mut board = None;
    let mut chassis = None;
    for (key, value) in key_values(output) {
        if value.is_empty() {
            continue;
        }
        match key {
            "Product Serial" => return Some(value.to_lowercase()),
            "Board Serial" => board = board.or(Some(value.to_lowercase())),
            "Chassis Serial" => chassis = chassis.or(Some(value.to_lowercase())),
            _ => {}
        }
    }
    board.or(chassis)
}

/// A populated or empty row of `user list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSlot {
    pub id: u32,
    pub name: String,
}

#[must_use]
pub fn parse_user_list(output: &str) -> Vec<UserSlot> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            let name = match fields.next() {
                Some("true" | "false") | None => String::new(),
                Some(name) => name.to_string(),
            };
            Some(UserSlot { id, name })
        })
        .collect()
}

fn privilege_level(role: &str) -> &'static str {
    match role.to_ascii_lowercase().as_str() {
        "user" => "2",
        "operator" => "3",
        _ => "4",
    }
}

/// Server driver for a logged-in IPMI session.
#[derive(Debug)]
pub struct IpmiServer {
    session: IpmiSession,
    info: McInfo,
    closed: bool,
}

impl IpmiServer {
    #[must_use]
    pub fn new(session: IpmiSession, info: McInfo) -> Self {
        Self {
            session,
            info,
            closed: false,
        }
    }

    async fn expect_output(&self, command: &[&str], prefix: &str) -> Result<bool, DeviceError> {
        let output = self.session.run(command).await?;
        if output.trim_start().starts_with(prefix) {
            Ok(true)
        } else {
            Err(DeviceError::Command(format!(
                "unexpected response to {}: {}",
                command.join(" "),
                output.trim()
            )))
        }
    }
}

#[async_trait]
impl Device for IpmiServer {
    fn vendor(&self) -> String {
        self.info.manufacturer.to_lowercase()
    }

    fn model(&self) -> String {
        self.info.product.clone()
    }

    async fn serial(&mut self) -> Result<String, DeviceError> {
        let output = self.session.run(&["fru", "print", "0"]).await?;
        parse_fru_serial(&output)
            .ok_or_else(|| DeviceError::Command("fru print 0 reported no serial".into()))
    }

    async fn close(&mut self) {
        if !self.closed {
            debug!(bmc_address = %self.session.address, "Closing IPMI session");
            self.closed = true;
        }
    }

    async fn is_on(&mut self) -> Result<bool, DeviceError> {
        let output = self.session.run(&["chassis", "power", "status"]).await?;
        Ok(output.contains("is on"))
    }

    async fn power_on(&mut self) -> Result<bool, DeviceError> {
        if self.is_on().await? {
            return Ok(true);
        }
        self.expect_output(&["chassis", "power", "on"], "Chassis Power Control: Up/On")
            .await
    }

    async fn power_off(&mut self) -> Result<bool, DeviceError> {
        if !self.is_on().await? {
            return Ok(true);
        }
        self.expect_output(&["chassis", "power", "off"], "Chassis Power Control: Down/Off")
            .await
    }

    async fn power_cycle(&mut self) -> Result<bool, DeviceError> {
        self.expect_output(&["chassis", "power", "cycle"], "Chassis Power Control: Cycle")
            .await
    }

    async fn power_cycle_bmc(&mut self) -> Result<bool, DeviceError> {
        self.expect_output(&["mc", "reset", "cold"], "Sent cold reset command to MC")
            .await
    }
}

#[async_trait]
impl Configure for IpmiServer {
    fn resources(&self) -> Vec<String> {
        vec!["user".to_string(), "power".to_string()]
    }

    async fn user(&mut self, users: &[UserConfig]) -> Result<(), DeviceError> {
        let listing = self.session.run(&["user", "list", LAN_CHANNEL]).await?;
        let mut slots = parse_user_list(&listing);

        for user in users {
            if user.name.is_empty() {
                return Err(DeviceError::InvalidConfig("user resource expects a name".into()));
            }
            if user.password.is_empty() && user.enable {
                return Err(DeviceError::InvalidConfig(format!(
                    "user {} expects a password",
                    user.name
                )));
            }

            let existing = slots.iter().find(|s| s.name == user.name).map(|s| s.id);
            let id = match existing {
                Some(id) => id,
                None if !user.enable => continue,
                None => {
                    let free = slots
                        .iter_mut()
                        .find(|s| s.id >= FIRST_USER_SLOT && s.name.is_empty())
                        .ok_or_else(|| {
                            DeviceError::Command(format!("no free user slot for {}", user.name))
                        })?;
                    free.name.clone_from(&user.name);
                    let id = free.id.to_string();
                    self.session
                        .run(&["user", "set", "name", &id, &user.name])
                        .await?;
                    free.id
                }
            };

            let id = id.to_string();
            if !user.enable {
                self.session.run(&["user", "disable", &id]).await?;
                continue;
            }
            self.session
                .run(&["user", "set", "password", &id, &user.password])
                .await?;
            self.session
                .run(&["user", "priv", &id, privilege_level(&user.role), LAN_CHANNEL])
                .await?;
            self.session.run(&["user", "enable", &id]).await?;
            debug!(bmc_address = %self.session.address, user = %user.name, slot = %id, "User applied");
        }
        Ok(())
    }

    async fn power(&mut self, power: &PowerConfig) -> Result<(), DeviceError> {
        if let Some(policy) = power.restore_policy {
            self.session
                .run(&["chassis", "policy", policy.as_ipmi()])
                .await?;
        }
        if let Some(watts) = power.power_cap_watts {
            let watts = watts.to_string();
            self.session
                .run(&["dcmi", "power", "set_limit", "limit", &watts])
                .await?;
            self.session.run(&["dcmi", "power", "activate"]).await?;
        }
        Ok(())
    }
}

impl ServerDriver for IpmiServer {}
