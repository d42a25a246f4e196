//! Configuration shared by the caller, the dispatcher and the daemon.
//!
//! ```toml
//! actions_dir = "/usr/share/plinth/actions"
//! program = "privileged-actions"
//! sudo = "sudo"
//! timeout = 300
//! services = ["apache2", "tor@plinth"]
//!
//! [daemon]
//! socket = "/run/freedombox/privileged.socket"
//! user = "plinth"
//! idle_timeout = 300
//!
//! [log]
//! foreground = false
//! filter = "privileged=info"
//! ```

use crate::error::Error;
use serde_derive::{Deserialize, Serialize};
use privileged_log::GlobalLoggerGuard;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Configuration file read when no other file is given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/plinth/privileged.toml";

/// Directory holding the executables that may be run as root.
pub const DEFAULT_ACTIONS_DIR: &str = "/usr/share/plinth/actions";

/// Socket of the privileged daemon.
pub const DEFAULT_SOCKET: &str = "/run/freedombox/privileged.socket";

/// The unprivileged user that runs the web interface.
pub const DEFAULT_USER: &str = "plinth";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Only executables inside this directory can be run.
    pub actions_dir: PathBuf,
    /// Dispatcher program inside the actions directory.
    pub program: String,
    /// The `sudo` binary used for privilege elevation.
    pub sudo: PathBuf,
    /// Kill actions that run longer than this many seconds.
    pub timeout: Option<u64>,
    /// Units the `service` module may control.
    pub services: Vec<String>,
    pub daemon: DaemonConfig,
    pub log: LogConfig,
}

/// The privileged daemon serving calls over a Unix socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub socket: PathBuf,
    /// Peers running as this user or as root may connect.
    pub user: String,
    /// Exit when idle for this many seconds; socket activation only.
    pub idle_timeout: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: DEFAULT_SOCKET.into(),
            user: DEFAULT_USER.to_string(),
            idle_timeout: Some(300),
        }
    }
}

/// Re-exported logging configuration.
pub type LogConfig = privileged_log::Config;

impl Default for Config {
    fn default() -> Self {
        Self {
            actions_dir: DEFAULT_ACTIONS_DIR.into(),
            program: crate::dispatch::PROGRAM.to_string(),
            sudo: "sudo".into(),
            timeout: None,
            services: vec![],
            daemon: DaemonConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Read the configuration file.
    ///
    /// Without an explicit path, the default file is used if it exists
    /// and the built-in defaults otherwise.
    pub fn read(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        fs::read_to_string(path)?.parse()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Set up the configured global async logger.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn logger(&self, name: &str) -> Result<GlobalLoggerGuard, Error> {
        privileged_log::async_logger(name, self.log.clone())
            .await
            .map_err(Into::into)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(Into::into)
    }
}
