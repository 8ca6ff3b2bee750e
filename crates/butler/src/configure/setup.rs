//! One-time chassis setup.
//!
//! Runs before the regular resources on a chassis whose configuration has a
//! `setup_chassis` section. The chassis must be powered on; when it is not,
//! it is powered on and setup is left for the next run.

use super::apply::plan;
use super::ResourceFailure;
use crate::device::{ChassisDriver, DeviceError};
use crate::inventory::ChassisSetupMarker;
use crate::resources::{BladeUser, SetupChassisConfig, Toggle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settling time after blade power transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub blade_power_on: Duration,
    pub blade_power_off: Duration,
    pub flex_address: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            blade_power_on: Duration::from_secs(20),
            blade_power_off: Duration::from_secs(10),
            flex_address: Duration::from_secs(10),
        }
    }
}

impl SettleDelays {
    /// No waiting at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            blade_power_on: Duration::ZERO,
            blade_power_off: Duration::ZERO,
            flex_address: Duration::ZERO,
        }
    }
}

async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Every declared setup section applied; marked complete.
    Complete { applied: Vec<String> },
    /// Chassis was off and has been powered on; retry on the next run.
    PoweredOn,
    /// Power state could not be read.
    PowerStateUnknown(String),
    /// Something was skipped or failed; not marked complete.
    Incomplete {
        applied: Vec<String>,
        failed: Vec<ResourceFailure>,
        interrupted: bool,
    },
}

pub(crate) struct SetupContext<'a> {
    pub serial: &'a str,
    pub allow_list: &'a [String],
    pub delays: SettleDelays,
    pub stop: &'a CancellationToken,
    pub marker: &'a dyn ChassisSetupMarker,
}

fn declared_sections(config: &SetupChassisConfig) -> Vec<&'static str> {
    let mut sections = Vec::new();
    if config.ipmi_over_lan.is_some() {
        sections.push("setipmioverlan");
    }
    if config.flex_address.is_some() {
        sections.push("flexaddress");
    }
    if config.dynamic_power.is_some() {
        sections.push("dynamicpower");
    }
    if config.blades_power.is_some() {
        sections.push("bladespower");
    }
    if config.add_blade_bmc_admins.is_some() {
        sections.push("add_blade_bmc_admins");
    }
    if config.remove_blade_bmc_users.is_some() {
        sections.push("remove_blade_bmc_users");
    }
    sections
}

pub(crate) async fn setup_chassis<D: ChassisDriver + ?Sized>(
    chassis: &mut D,
    config: &SetupChassisConfig,
    ctx: &SetupContext<'_>,
) -> SetupOutcome {
    match chassis.is_on().await {
        Ok(true) => {}
        Ok(false) => {
            info!(serial = %ctx.serial, "Chassis is powered off, powering on; setup continues on the next run");
            if let Err(e) = chassis.power_on().await {
                warn!(serial = %ctx.serial, error = %e, "Chassis power on failed");
            }
            return SetupOutcome::PoweredOn;
        }
        Err(e) => {
            warn!(serial = %ctx.serial, error = %e, "Unable to read chassis power state, skipping setup");
            return SetupOutcome::PowerStateUnknown(e.to_string());
        }
    }

    let (ordered, unsupported) = plan(chassis.setup_resources(), ctx.allow_list);
    for name in unsupported {
        debug!(serial = %ctx.serial, resource = %name, "Not a setup resource");
    }

    let mut applied = Vec::new();
    let mut failed = Vec::new();
    let mut interrupted = false;

    for name in ordered {
        if ctx.stop.is_cancelled() {
            warn!(serial = %ctx.serial, "Interrupt received, stopping chassis setup");
            interrupted = true;
            break;
        }

        let result = match name.as_str() {
            "setipmioverlan" => match config.ipmi_over_lan {
                Some(toggle) => set_ipmi_over_lan(chassis, toggle, ctx.delays).await,
                None => continue,
            },
            "flexaddress" => match config.flex_address {
                Some(toggle) => set_flex_address(chassis, toggle, ctx.delays).await,
                None => continue,
            },
            "dynamicpower" => match config.dynamic_power {
                Some(toggle) => chassis.set_dynamic_power(toggle.enable).await.map(|_| ()),
                None => continue,
            },
            "bladespower" => match config.blades_power {
                Some(toggle) => set_blades_power(chassis, toggle).await,
                None => continue,
            },
            "add_blade_bmc_admins" => match &config.add_blade_bmc_admins {
                Some(users) => add_blade_bmc_admins(chassis, users).await,
                None => continue,
            },
            "remove_blade_bmc_users" => match &config.remove_blade_bmc_users {
                Some(users) => remove_blade_bmc_users(chassis, users).await,
                None => continue,
            },
            other => {
                warn!(serial = %ctx.serial, resource = %other, "Unknown setup resource, skipping");
                continue;
            }
        };

        match result {
            Ok(()) => {
                debug!(serial = %ctx.serial, resource = %name, "Setup resource applied");
                applied.push(name);
            }
            Err(e) => {
                warn!(serial = %ctx.serial, resource = %name, error = %e, "Setup resource failed");
                failed.push(ResourceFailure {
                    resource: name,
                    error: e.to_string(),
                });
            }
        }
    }

    let complete = !interrupted
        && failed.is_empty()
        && declared_sections(config)
            .iter()
            .all(|section| applied.iter().any(|a| a == section));

    if !complete {
        warn!(
            serial = %ctx.serial,
            applied = ?applied,
            failed = failed.len(),
            interrupted,
            "Chassis setup incomplete"
        );
        return SetupOutcome::Incomplete {
            applied,
            failed,
            interrupted,
        };
    }

    info!(serial = %ctx.serial, applied = ?applied, "Chassis setup complete");
    if let Err(e) = ctx.marker.mark_setup_complete(ctx.serial).await {
        warn!(serial = %ctx.serial, error = %e, "Unable to record chassis setup completion");
    }
    SetupOutcome::Complete { applied }
}

async fn set_ipmi_over_lan<D: ChassisDriver + ?Sized>(
    chassis: &mut D,
    toggle: Toggle,
    delays: SettleDelays,
) -> Result<(), DeviceError> {
    for blade in chassis.blades().await? {
        // Setting requires a running blade.
        if !chassis.is_on_blade(blade.position).await.unwrap_or(false) {
            chassis.power_on_blade(blade.position).await?;
            settle(delays.blade_power_on).await;
        }
        chassis
            .set_ipmi_over_lan(blade.position, toggle.enable)
            .await?;
    }
    Ok(())
}

async fn set_flex_address<D: ChassisDriver + ?Sized>(
    chassis: &mut D,
    toggle: Toggle,
    delays: SettleDelays,
) -> Result<(), DeviceError> {
    for blade in chassis.blades().await? {
        if blade.flex_address_enabled == toggle.enable {
            continue;
        }
        info!(
            blade = blade.position,
            blade_serial = %blade.serial,
            enable = toggle.enable,
            "Changing flex address state, blade will be power cycled"
        );
        if chassis.is_on_blade(blade.position).await.unwrap_or(false) {
            chassis.power_off_blade(blade.position).await?;
            settle(delays.blade_power_off).await;
        }
        chassis
            .set_flex_address_state(blade.position, toggle.enable)
            .await?;
        settle(delays.flex_address).await;
        chassis.power_on_blade(blade.position).await?;
    }
    Ok(())
}

async fn set_blades_power<D: ChassisDriver + ?Sized>(
    chassis: &mut D,
    toggle: Toggle,
) -> Result<(), DeviceError> {
    for blade in chassis.blades().await? {
        let is_on = chassis.is_on_blade(blade.position).await.unwrap_or(false);
        if is_on == toggle.enable {
            continue;
        }
        if toggle.enable {
            chassis.power_on_blade(blade.position).await?;
        } else {
            chassis.power_off_blade(blade.position).await?;
        }
    }
    Ok(())
}

async fn add_blade_bmc_admins<D: ChassisDriver + ?Sized>(
    chassis: &mut D,
    users: &[BladeUser],
) -> Result<(), DeviceError> {
    if chassis.blades().await?.is_empty() {
        debug!("Chassis has no blades");
        return Ok(());
    }
    for user in users {
        if user.name.is_empty() || user.password.is_empty() {
            return Err(DeviceError::InvalidConfig(
                "add_blade_bmc_admins expects a name and a password".into(),
            ));
        }
        chassis.add_blade_bmc_admin(&user.name, &user.password).await?;
    }
    Ok(())
}

async fn remove_blade_bmc_users<D: ChassisDriver + ?Sized>(
    chassis: &mut D,
    users: &[BladeUser],
) -> Result<(), DeviceError> {
    if chassis.blades().await?.is_empty() {
        debug!("Chassis has no blades");
        return Ok(());
    }
    for user in users {
        if user.name.is_empty() {
            return Err(DeviceError::InvalidConfig(
                "remove_blade_bmc_users expects a name".into(),
            ));
        }
        chassis.remove_blade_bmc_user(&user.name).await?;
    }
    Ok(())
}
