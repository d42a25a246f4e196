//! Privileged modules compiled into the dispatcher.

pub mod service;

use crate::{config::Config, registry::Registry};

/// The registry of the dispatcher and the daemon.
pub fn registry(config: &Config) -> Registry {
    Registry::new().module(service::module(&config.services))
}
