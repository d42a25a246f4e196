use crate::outcome::Exception;
use derive_more::{Display, From};
use std::{fmt, io};

/// Message prefixes of [`Error::Type`] errors.
const TYPE_MESSAGES: &[&str] = &["Expected type ", "Invalid value for arg "];

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "JSON error: {}", "_0")]
    JsonError(serde_json::Error),
    #[display(fmt = "Invalid configuration: {}", "_0")]
    ConfigError(toml::de::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Logging error: {}", "_0")]
    LogError(privileged_log::Error),
    #[from(ignore)]
    #[display(fmt = "Permission denied, must run as root")]
    PermissionDenied,
    #[from(ignore)]
    #[display(fmt = "Username '{}' for running the action not found", "_0")]
    UserNotFound(String),
    #[from(ignore)]
    #[display(fmt = "Invalid process")]
    InvalidProcess,
    /// The action name or its location was rejected before running anything.
    #[from(ignore)]
    #[display(fmt = "{}", "_0")]
    InvalidAction(String),
    /// The call was malformed: bad module or action name, bad argument shape.
    #[from(ignore)]
    #[display(fmt = "{}", "_0")]
    Syntax(String),
    /// An argument did not match its declared type.
    #[from(ignore)]
    #[display(fmt = "{}", "_0")]
    Type(String),
    /// The action process exited with an error or without a result.
    #[from(ignore)]
    #[display(fmt = "{}", "_0")]
    Action(ActionError),
    /// The non-interactive privilege elevation was refused.
    #[from(ignore)]
    #[display(fmt = "Privilege elevation refused: {}", "_0")]
    Elevation(ActionError),
    #[from(ignore)]
    #[display(fmt = "Action '{}' timed out after {}s", "action", "seconds")]
    Timeout { action: String, seconds: u64 },
    /// An error raised by the privileged action itself.
    #[from(ignore)]
    #[display(fmt = "{}", "_0")]
    Exception(Exception),
}

impl std::error::Error for Error {}

impl Error {
    /// Returns `true` if the call was rejected before any action ran.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAction(_) | Self::Syntax(_) | Self::Type(_)
        )
    }

    pub(crate) fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax(message.into())
    }

    pub(crate) fn invalid_action(message: impl Into<String>) -> Self {
        Self::InvalidAction(message.into())
    }

    /// Rebuild a rejected call from the message reported by the dispatcher.
    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        if TYPE_MESSAGES.iter().any(|prefix| message.starts_with(prefix)) {
            Self::Type(message)
        } else {
            Self::Syntax(message)
        }
    }
}

/// A failed action process with everything it printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    /// Name of the action that was run.
    pub action: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

impl ActionError {
    /// The last non-empty line of standard error.
    pub fn message(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
    }

    /// `sudo` refused to run the command without asking for a password.
    pub fn is_elevation_failure(&self) -> bool {
        self.code == Some(1) && self.stderr.trim_start().starts_with("sudo:")
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error running action '{}': {}", self.action, self.message())
    }
}

impl std::error::Error for ActionError {}
