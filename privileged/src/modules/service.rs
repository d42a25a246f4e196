//! Handle system services through `systemctl`.
//!
//! Only units registered as managed can be controlled.  The set is
//! filled once at startup from the configuration, before the first call
//! is dispatched.

use crate::{action::Module, outcome::FromException, Exception};
use derive_more::{Display, From};
use privileged_derive::privileged;
use std::{
    collections::BTreeSet,
    io,
    process::{Command, Output},
    sync::{PoisonError, RwLock},
};

/// Binary used to control services.
pub const SYSTEMCTL: &str = "systemctl";

/// Boot targets accepted by [`systemd_set_default`].
pub const DEFAULT_TARGETS: &[&str] = &["graphical.target", "multi-user.target"];

static MANAGED_UNITS: RwLock<BTreeSet<String>> = RwLock::new(BTreeSet::new());

#[derive(Debug, Display, From)]
pub enum ServiceError {
    #[from(ignore)]
    #[display(fmt = "Invalid service name: {:?}", "_0")]
    InvalidName(String),
    #[from(ignore)]
    #[display(
        fmt = "The service '{}' is not managed by FreedomBox. Access is only permitted for managed services.",
        "_0"
    )]
    NotManaged(String),
    #[from(ignore)]
    #[display(fmt = "Invalid target: {:?}", "_0")]
    InvalidTarget(String),
    #[from(ignore)]
    #[display(fmt = "systemctl {} failed: {}", "command", "message")]
    Failed { command: String, message: String },
    #[display(fmt = "Failed to run systemctl: {}", "_0")]
    IoError(io::Error),
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl FromException for ServiceError {
    fn from_exception(exception: &Exception) -> Option<Self> {
        Some(Self::Failed {
            command: "remote".to_string(),
            message: exception.message(),
        })
    }
}

/// Only plain unit names are passed to `systemctl`.
fn check_unit(unit: &str) -> Result<(), ServiceError> {
    let valid = !unit.is_empty()
        && !unit.starts_with('-')
        && unit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@._-:\\".contains(c));
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidName(unit.to_string()))
    }
}

/// `apache2` and `apache2.service` name the same unit.
fn unit_name(unit: &str) -> String {
    if unit.contains('.') {
        unit.to_string()
    } else {
        format!("{}.service", unit)
    }
}

/// Allow the service actions to control these units.
pub fn manage<I>(units: I)
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut managed = MANAGED_UNITS
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    managed.extend(units.into_iter().map(|unit| unit_name(unit.as_ref())));
}

fn check_managed(unit: &str) -> Result<(), ServiceError> {
    check_unit(unit)?;
    let managed = MANAGED_UNITS
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    if managed.contains(&unit_name(unit)) {
        Ok(())
    } else {
        Err(ServiceError::NotManaged(unit.to_string()))
    }
}

fn systemctl(args: &[&str]) -> Result<Output, ServiceError> {
    Command::new(SYSTEMCTL).args(args).output().map_err(Into::into)
}

fn control(command: &str, unit: &str) -> Result<(), ServiceError> {
    let output = systemctl(&[command, unit])?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ServiceError::Failed {
            command: format!("{} {}", command, unit),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn query(command: &str, unit: &str) -> Result<bool, ServiceError> {
    check_managed(unit)?;
    Ok(systemctl(&[command, "--quiet", unit])?.status.success())
}

/// Set the default target that systemd boots into.
#[privileged]
pub fn systemd_set_default(target: String) -> Result<(), ServiceError> {
    if !DEFAULT_TARGETS.contains(&target.as_str()) {
        return Err(ServiceError::InvalidTarget(target));
    }
    control("set-default", &target)
}

#[privileged]
pub fn start(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("start", &service)
}

#[privileged]
pub fn stop(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("stop", &service)
}

#[privileged]
pub fn restart(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("restart", &service)
}

/// Restart a service if it is running.
#[privileged]
pub fn try_restart(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("try-restart", &service)
}

#[privileged]
pub fn reload(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("reload", &service)
}

/// Reload a service if it supports reloading, restart it otherwise.
///
/// Does nothing if the service is not running.
#[privileged]
pub fn try_reload_or_restart(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("try-reload-or-restart", &service)
}

#[privileged]
pub fn enable(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("enable", &service)
}

#[privileged]
pub fn disable(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("disable", &service)
}

#[privileged]
pub fn mask(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("mask", &service)
}

#[privileged]
pub fn unmask(service: String) -> Result<(), ServiceError> {
    check_managed(&service)?;
    control("unmask", &service)
}

#[privileged]
pub fn is_enabled(service: String) -> Result<bool, ServiceError> {
    query("is-enabled", &service)
}

#[privileged]
pub fn is_running(service: String) -> Result<bool, ServiceError> {
    query("is-active", &service)
}

/// The `service` module, controlling the given units.
pub fn module<I>(managed: I) -> Module
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    manage(managed);
    Module::new("service")
        .action(systemd_set_default::action())
        .action(start::action())
        .action(stop::action())
        .action(restart::action())
        .action(try_restart::action())
        .action(reload::action())
        .action(try_reload_or_restart::action())
        .action(enable::action())
        .action(disable::action())
        .action(mask::action())
        .action(unmask::action())
        .action(is_enabled::action())
        .action(is_running::action())
}
