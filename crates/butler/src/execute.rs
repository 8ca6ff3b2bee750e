//! One-off commands against devices.

use crate::asset::{Asset, DeviceKind};
use crate::device::{Connection, Connector, Credential, Device, DeviceError, DeviceHandle};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors from executing a command.
#[derive(Error, Debug)]
pub enum ExecuteError {
    /// The command name is not known.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Login failed on every address/credential pair.
    #[error("connect failed: {0}")]
    Connect(#[source] DeviceError),

    /// The device rejected or failed the command.
    #[error("{command} failed: {source}")]
    Command {
        command: ExecuteCommand,
        #[source]
        source: DeviceError,
    },
}

/// Commands accepted by `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteCommand {
    /// Reset the management controller.
    BmcReset,
    /// Power cycle the host or chassis.
    PowerCycle,
}

impl FromStr for ExecuteCommand {
    type Err = ExecuteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bmc-reset" => Ok(Self::BmcReset),
            "powercycle" => Ok(Self::PowerCycle),
            other => Err(ExecuteError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for ExecuteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BmcReset => write!(f, "bmc-reset"),
            Self::PowerCycle => write!(f, "powercycle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    DryRun,
    Interrupted,
    Executed {
        command: ExecuteCommand,
        kind: DeviceKind,
    },
}

/// Runs commands on devices.
pub struct Executor {
    connector: Arc<dyn Connector>,
    credentials: Arc<[Credential]>,
    dry_run: bool,
    stop: CancellationToken,
}

impl Executor {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: impl Into<Arc<[Credential]>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            connector,
            credentials: credentials.into(),
            dry_run: false,
            stop,
        }
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Execute `command` on one device.
    ///
    /// Unknown commands are rejected before any connection is made.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError`] for unknown commands, login failures and
    /// failed commands.
    pub async fn execute(
        &self,
        asset: &mut Asset,
        command: &str,
    ) -> Result<ExecuteOutcome, ExecuteError> {
        let command: ExecuteCommand = command.parse()?;

        if self.dry_run {
            info!(serial = %asset.label(), command = %command, "Dry run, command skipped");
            return Ok(ExecuteOutcome::DryRun);
        }
        if self.stop.is_cancelled() {
            debug!(serial = %asset.label(), "Interrupt received, not connecting");
            return Ok(ExecuteOutcome::Interrupted);
        }

        let Connection {
            handle,
            active_address,
        } = self
            .connector
            .login(&asset.ip_addresses, &self.credentials)
            .await
            .map_err(ExecuteError::Connect)?;

        let kind = handle.kind();
        asset.ip_address = Some(active_address);
        asset.kind = Some(kind);

        let result = match handle {
            DeviceHandle::Server(mut server) => run(server.as_mut(), command).await,
            DeviceHandle::Chassis(mut chassis) => run(chassis.as_mut(), command).await,
        };
        result.map_err(|source| ExecuteError::Command { command, source })?;

        info!(serial = %asset.label(), kind = %kind, command = %command, "Command executed");
        Ok(ExecuteOutcome::Executed { command, kind })
    }
}

async fn run<D: Device + ?Sized>(
    device: &mut D,
    command: ExecuteCommand,
) -> Result<bool, DeviceError> {
    let result = match command {
        ExecuteCommand::BmcReset => device.power_cycle_bmc().await,
        ExecuteCommand::PowerCycle => device.power_cycle().await,
    };
    device.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "bmc-reset".parse::<ExecuteCommand>().unwrap(),
            ExecuteCommand::BmcReset
        );
        assert_eq!(
            "powercycle".parse::<ExecuteCommand>().unwrap(),
            ExecuteCommand::PowerCycle
        );
        assert!(matches!(
            "reboot".parse::<ExecuteCommand>(),
            Err(ExecuteError::UnknownCommand(c)) if c == "reboot"
        ));
    }
}
