use super::certificate::{ensure_certificate, CertificateError};
use super::{ApplyReport, ResourceFailure};
use crate::device::{Configure, DeviceError};
use crate::resources::ResourcesConfig;
use crate::signer::Signer;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure of a single resource.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Configuration resources known to the apply loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    User,
    Syslog,
    Ntp,
    Ldap,
    LdapGroup,
    License,
    Network,
    Bios,
    HttpsCert,
    Power,
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "syslog" => Ok(Self::Syslog),
            "ntp" => Ok(Self::Ntp),
            "ldap" => Ok(Self::Ldap),
            "ldap_group" => Ok(Self::LdapGroup),
            "license" => Ok(Self::License),
            "network" => Ok(Self::Network),
            "bios" => Ok(Self::Bios),
            "https_cert" => Ok(Self::HttpsCert),
            "power" => Ok(Self::Power),
            other => Err(format!("unknown resource: {other}")),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Syslog => "syslog",
            Self::Ntp => "ntp",
            Self::Ldap => "ldap",
            Self::LdapGroup => "ldap_group",
            Self::License => "license",
            Self::Network => "network",
            Self::Bios => "bios",
            Self::HttpsCert => "https_cert",
            Self::Power => "power",
        };
        write!(f, "{name}")
    }
}

/// Order resources for one device.
///
/// The driver's declared order always wins. An operator allow-list only
/// narrows it; names the driver does not declare are returned separately.
pub(crate) fn plan(declared: Vec<String>, allow_list: &[String]) -> (Vec<String>, Vec<String>) {
    if allow_list.is_empty() {
        return (declared, Vec::new());
    }
    let unsupported = allow_list
        .iter()
        .filter(|name| !declared.contains(name))
        .cloned()
        .collect();
    let ordered = declared
        .into_iter()
        .filter(|name| allow_list.contains(name))
        .collect();
    (ordered, unsupported)
}

pub(crate) struct ApplyContext<'a> {
    pub serial: &'a str,
    pub allow_list: &'a [String],
    pub signer: Option<&'a Signer>,
    pub stop: &'a CancellationToken,
}

/// Apply one resource. `Ok(None)` means the section is not declared.
async fn apply_one<D: Configure + ?Sized>(
    device: &mut D,
    resource: Resource,
    config: &ResourcesConfig,
    signer: Option<&Signer>,
) -> Result<Option<bool>, ApplyError> {
    let reset = match resource {
        Resource::User => match &config.user {
            Some(users) => {
                device.user(users).await?;
                false
            }
            None => return Ok(None),
        },
        Resource::Syslog => match &config.syslog {
            Some(syslog) => {
                device.syslog(syslog).await?;
                false
            }
            None => return Ok(None),
        },
        Resource::Ntp => match &config.ntp {
            Some(ntp) => {
                device.ntp(ntp).await?;
                false
            }
            None => return Ok(None),
        },
        Resource::Ldap => match &config.ldap {
            Some(ldap) => {
                device.ldap(ldap).await?;
                false
            }
            None => return Ok(None),
        },
        Resource::LdapGroup => match (&config.ldap_group, &config.ldap) {
            (Some(groups), Some(ldap)) => {
                device.ldap_group(groups, ldap).await?;
                false
            }
            (Some(_), None) => {
                warn!("ldap_group declared without an ldap section, skipping");
                return Ok(None);
            }
            (None, _) => return Ok(None),
        },
        Resource::License => match &config.license {
            Some(license) => {
                device.set_license(license).await?;
                false
            }
            None => return Ok(None),
        },
        Resource::Network => match &config.network {
            Some(network) => device.network(network).await?,
            None => return Ok(None),
        },
        Resource::Bios => match &config.bios {
            Some(bios) => {
                device.bios(bios).await?;
                false
            }
            None => return Ok(None),
        },
        Resource::HttpsCert => match &config.https_cert {
            Some(cert) => ensure_certificate(device, cert, signer).await?,
            None => return Ok(None),
        },
        Resource::Power => match &config.power {
            Some(power) => {
                device.power(power).await?;
                false
            }
            None => return Ok(None),
        },
    };
    Ok(Some(reset))
}

/// Run the ordered resource loop, then reset the controller if any
/// resource asked for it.
pub(crate) async fn apply_resources<D: Configure + ?Sized>(
    device: &mut D,
    config: &ResourcesConfig,
    ctx: &ApplyContext<'_>,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    let (ordered, unsupported) = plan(device.resources(), ctx.allow_list);
    for name in unsupported {
        warn!(serial = %ctx.serial, resource = %name, "Resource not supported by device, skipping");
        report.skipped.push(name);
    }

    for (index, name) in ordered.iter().enumerate() {
        if ctx.stop.is_cancelled() {
            warn!(
                serial = %ctx.serial,
                remaining = ?&ordered[index..],
                "Interrupt received, skipping remaining resources"
            );
            report.interrupted = true;
            break;
        }

        let resource = match name.parse::<Resource>() {
            Ok(resource) => resource,
            Err(e) => {
                warn!(serial = %ctx.serial, error = %e, "Skipping resource");
                report.skipped.push(name.clone());
                continue;
            }
        };

        match apply_one(device, resource, config, ctx.signer).await {
            Ok(None) => {
                debug!(serial = %ctx.serial, resource = %name, "Resource not declared");
                report.skipped.push(name.clone());
            }
            Ok(Some(reset)) => {
                debug!(serial = %ctx.serial, resource = %name, reset_required = reset, "Resource applied");
                report.applied.push(name.clone());
                if reset {
                    report.reset_causes.push(name.clone());
                }
            }
            Err(e) => {
                warn!(serial = %ctx.serial, resource = %name, error = %e, "Resource apply failed");
                report.failed.push(ResourceFailure {
                    resource: name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    if !report.reset_causes.is_empty() {
        device.close().await;
        report.session_closed = true;
        match device.power_cycle_bmc().await {
            Ok(_) => {
                info!(serial = %ctx.serial, causes = ?report.reset_causes, "Controller reset");
                report.bmc_reset = Some(true);
            }
            Err(e) => {
                warn!(serial = %ctx.serial, causes = ?report.reset_causes, error = %e, "Controller reset failed");
                report.bmc_reset = Some(false);
            }
        }
    }

    if report.is_success() {
        info!(
            serial = %ctx.serial,
            applied = ?report.applied,
            skipped = report.skipped.len(),
            interrupted = report.interrupted,
            "Configuration applied"
        );
    } else {
        warn!(
            serial = %ctx.serial,
            applied = ?report.applied,
            failed = ?report.failed_resources(),
            skipped = report.skipped.len(),
            interrupted = report.interrupted,
            "Configuration partially applied"
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_plan_without_allow_list_keeps_driver_order() {
        let (ordered, unsupported) = plan(names(&["user", "ldap", "ldap_group", "network"]), &[]);
        assert_eq!(ordered, names(&["user", "ldap", "ldap_group", "network"]));
        assert!(unsupported.is_empty());
    }

    #[test]
    fn test_plan_allow_list_follows_driver_order() {
        let (ordered, unsupported) = plan(
            names(&["user", "syslog", "ldap", "ldap_group", "https_cert"]),
            &names(&["https_cert", "ldap_group", "ldap", "bios"]),
        );
        assert_eq!(ordered, names(&["ldap", "ldap_group", "https_cert"]));
        assert_eq!(unsupported, names(&["bios"]));
    }

    #[test]
    fn test_resource_names_round_trip() {
        for name in [
            "user", "syslog", "ntp", "ldap", "ldap_group", "license", "network", "bios",
            "https_cert", "power",
        ] {
            assert_eq!(name.parse::<Resource>().unwrap().to_string(), name);
        }
        assert!("snmp".parse::<Resource>().is_err());
    }
}
