//! Privileged actions for FreedomBox.
//!
//! The web interface runs unprivileged.  Every change to the system
//! goes through a small set of whitelisted functions, the privileged
//! actions, that run as root in a separate process started through
//! `sudo`.  Nothing but JSON data crosses the boundary: the caller
//! names a module and an action and passes positional and keyword
//! arguments; the dispatcher checks that the action is marked as
//! privileged, validates every argument against its declared type and
//! sends back either the return value or the raised error.
//!
//! # Examples
//!
//! A module declares its actions with the [`privileged`] attribute:
//!
//! ```ignore
//! use privileged::{privileged, Module};
//!
//! /// Change the hostname.
//! #[privileged(defaults(transient = false))]
//! pub fn set_hostname(hostname: String, transient: bool) -> Result<(), std::io::Error> {
//!     // ...
//!     Ok(())
//! }
//!
//! pub fn module() -> Module {
//!     Module::new("config").action(set_hostname::action())
//! }
//! ```
//!
//! The unprivileged side calls it through a [`Client`], either by
//! running the dispatcher through `sudo` or by connecting to the
//! privileged daemon:
//!
//! ```ignore
//! let config = Config::read(None)?;
//! let client = Client::from_config(&config)?;
//! client
//!     .call::<()>(Request::new("config", "set_hostname").arg("freedombox"))
//!     .await?;
//!
//! let client = Client::connect(&config);
//! let running: bool = client
//!     .call(Request::new("service", "is_running").arg("apache2"))
//!     .await?;
//! ```

extern crate self as privileged;

pub mod action;
pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod modules;
pub mod outcome;
pub mod registry;
pub mod request;
pub mod runner;
pub mod types;
pub mod validate;

pub use crate::{
    action::{Action, Module, Param},
    client::{Client, Execute},
    config::{Config, DaemonConfig},
    daemon::{Connector, Server},
    error::{ActionError, Error},
    outcome::{Exception, FromException, IntoOutcome, Outcome},
    registry::Registry,
    request::Request,
    runner::{Captured, Invocation, Privilege, Process, Runner},
    types::{ArgType, Secret, Type},
};
pub use privileged_derive::privileged;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::{json, Value};
}
