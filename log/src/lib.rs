//! Simple async logging crate inspired by OpenBSD's `log.c`
//!
//! Both sides of the privilege boundary log through this crate: the
//! unprivileged caller usually logs to syslog from an async drain, the
//! `privileged-actions` dispatcher logs to stderr because its stderr is
//! the human-readable diagnostics channel read back by the caller.

mod envlogger;

use derive_more::{Display, From, Into};
use libc::openlog;
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, OwnedKVList, Record, KV};
use std::{
    ffi::{CStr, CString},
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{Mutex, Once},
    thread,
    time::Duration,
};
use tokio::{runtime, sync::mpsc, time};

pub use slog_scope::GlobalLoggerGuard;

#[doc(hidden)]
pub use {slog as __slog, slog_scope as __slog_scope};

/// Default directive when neither `RUST_LOG` nor the configuration sets one.
pub const DEFAULT_FILTER: &str = "info";

static LOG_BRIDGE: Once = Once::new();

/// Log a critical message with the global logger.
#[macro_export]
macro_rules! crit {
    ($($args:tt)+) => {
        $crate::__slog::crit!($crate::__slog_scope::logger(), $($args)+)
    };
}

/// Log an error message with the global logger.
#[macro_export]
macro_rules! error {
    ($($args:tt)+) => {
        $crate::__slog::error!($crate::__slog_scope::logger(), $($args)+)
    };
}

/// Log a warning with the global logger.
#[macro_export]
macro_rules! warn {
    ($($args:tt)+) => {
        $crate::__slog::warn!($crate::__slog_scope::logger(), $($args)+)
    };
}

/// Log an informational message with the global logger.
#[macro_export]
macro_rules! info {
    ($($args:tt)+) => {
        $crate::__slog::info!($crate::__slog_scope::logger(), $($args)+)
    };
}

/// Log a debug message with the global logger.
#[macro_export]
macro_rules! debug {
    ($($args:tt)+) => {
        $crate::__slog::debug!($crate::__slog_scope::logger(), $($args)+)
    };
}

/// Log a trace message with the global logger.
#[macro_export]
macro_rules! trace {
    ($($args:tt)+) => {
        $crate::__slog::trace!($crate::__slog_scope::logger(), $($args)+)
    };
}

/// Configuration for the logging crate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Log to the foreground or to syslog (default: syslog).
    pub foreground: bool,
    /// Directives like `privileged=debug,warn`, overridden by `RUST_LOG`.
    pub filter: Option<String>,
}

impl From<bool> for Config {
    fn from(foreground: bool) -> Self {
        Self {
            foreground,
            filter: None,
        }
    }
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    SendError(mpsc::error::SendError<Message>),
}

impl std::error::Error for Error {}

fn init(
    drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>,
    config: Config,
) -> GlobalLoggerGuard {
    let kv = slog::o!();

    let filter = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    let drain = envlogger::Logger::with_default_filter(drain, filter);

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());

    let logger = slog::Logger::root(drain.fuse(), kv).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        // Another `log` implementation may already be installed.
        let _ = slog_stdlog::init();
    });

    guard
}

/// Return a new global async logger.
///
/// Must be called from within a Tokio runtime.
pub async fn async_logger<C: Into<Config>>(
    name: &str,
    config: C,
) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();

    let drain = if config.foreground {
        Async::new(Box::new(Stderr::new(name)?)).await
    } else {
        Async::new(Box::new(Syslog::new(name)?)).await
    };

    Ok(init(Box::new(drain.fuse()), config))
}

/// Return a new global sync logger.
pub fn sync_logger<C: Into<Config>>(name: &str, config: C) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();

    let guard = if config.foreground {
        init(Box::new(Stderr::new(name)?.fuse()), config)
    } else {
        init(Box::new(Syslog::new(name)?.fuse()), config)
    };

    Ok(guard)
}

/// Local trait that can be used by the async logger.
pub trait Target: Send + Sync {
    fn new(name: &str) -> Result<Self, Error>
    where
        Self: Sized;
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error>;
}

/// Foreground logger that logs to stderr.
pub struct Stderr {
    name: String,
}

impl Target for Stderr {
    /// Create a new foreground logger.
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Log the pre-formatted string.
    fn log_str(&self, _level: Level, message: &str) -> Result<(), Error> {
        let message = format!("{}: {}\n", self.name, message);
        io::stderr()
            .write_all(message.as_bytes())
            .map_err(Into::into)
    }
}

impl Drain for Stderr {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_str(record.level(), &message)
    }
}

/// Background logger to log to syslog.
pub struct Syslog {
    /// We need to keep a reference to the const char * around.
    _name: Pin<CString>,
}

impl Target for Syslog {
    /// Create a new background logger.
    fn new(name: &str) -> Result<Self, Error> {
        let name = name.to_string();
        let _name = CString::new(&name[..name.find('(').unwrap_or(name.len())])?;
        let c_str: &CStr = _name.as_c_str();

        unsafe {
            openlog(
                c_str.as_ptr(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            )
        };

        Ok(Self {
            _name: Pin::new(_name),
        })
    }

    /// Convert the log string into a syslog message.
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        let c_string: CString = CString::new(message.as_bytes())?;
        let c_message: &CStr = c_string.as_c_str();

        let priority = match level {
            Level::Critical => libc::LOG_CRIT,
            Level::Error => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        // Never pass the message as the format string.
        unsafe {
            libc::syslog(priority, b"%s\0".as_ptr().cast(), c_message.as_ptr());
        }

        Ok(())
    }
}

impl Drop for Syslog {
    /// Close syslog on shutdown.
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

impl Drain for Syslog {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_str(record.level(), &message)
    }
}

/// Async channel that sends log messages to a background task.
pub struct Async {
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Async {
    /// Create new async logger that holds one of the supported target loggers.
    pub async fn new(target: Box<dyn Target>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Message>();

        let handle = tokio::spawn(async move {
            let mut logger = AsyncLogger::new(receiver, target);
            logger.listen().await;
        });

        Self {
            sender,
            handle: Some(handle),
        }
    }
}

impl Drain for Async {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.sender
            .send(Message::Entry(record.level(), message))
            .map_err(Into::into)
    }
}

impl Drop for Async {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if self.sender.send(Message::Close).is_err() {
                return;
            }

            // Give the background task a moment to flush pending entries.
            let waiter = thread::spawn(|| {
                let runtime = runtime::Builder::new_current_thread()
                    .enable_time()
                    .build();
                if let Ok(runtime) = runtime {
                    runtime.block_on(async move {
                        let _ = time::timeout(Duration::from_secs(1), handle).await;
                    });
                }
            });
            let _ = waiter.join();
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Entry(Level, String),
    Close,
}

pub struct AsyncLogger {
    receiver: mpsc::UnboundedReceiver<Message>,
    target: Box<dyn Target>,
}

impl AsyncLogger {
    pub fn new(receiver: mpsc::UnboundedReceiver<Message>, target: Box<dyn Target>) -> Self {
        Self { receiver, target }
    }

    pub async fn listen(&mut self) {
        while let Some(Message::Entry(level, message)) = self.receiver.recv().await {
            // A failing target must not take the caller down with it.
            let _ = self.target.log_str(level, &message);
        }
    }
}

/// Format the log message to a string.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.into()
}

/// Formatter to create a log message from a record.
#[derive(Into)]
struct Formatter {
    #[into]
    buf: String,
}

impl Formatter {
    /// Return a new formatter.
    fn new(record: &Record<'_>) -> Self {
        let mut buf = format!("{}", record.msg());

        if record.level() >= Level::Debug {
            buf.push_str(&format!(
                ", source: {}:{}, module: {}",
                record.file(),
                record.line(),
                record.module()
            ));
        };

        Self { buf }
    }
}

/// Serializer for key-value fields.
impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{async_logger, sync_logger, Config};
    use crate::{debug, error, info};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_log_stderr() {
        let _guard = async_logger("test", true).await.unwrap();

        for i in 1..=1000 {
            info!("Executing command - {}", i);
            debug!("Executing command - {}", i; "action" => "echo");
        }
    }

    #[test]
    fn test_sync_logger_with_filter() {
        let config = Config {
            foreground: true,
            filter: Some("error".to_string()),
        };
        let _guard = sync_logger("privileged-actions", config).unwrap();

        info!("filtered out");
        error!("Specified action not found");
    }

    #[test]
    fn test_log_crate_bridge() {
        let _guard = sync_logger("privileged-actions", true).unwrap();

        // Records of crates using `log` end up in the same drain.
        log::warn!("Logged through the log crate");
        log::trace!("filtered out");
    }

    #[test]
    fn test_config_from_foreground() {
        let config = Config::from(true);
        assert!(config.foreground);
        assert!(config.filter.is_none());
    }
}
