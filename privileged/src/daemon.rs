//! The privileged daemon.
//!
//! Instead of starting the dispatcher through `sudo` for every call, the
//! caller can connect to a daemon that runs as root and serves calls over
//! a Unix socket.  Every connection carries one request and one response,
//! each a single JSON document; the client shuts down its writing side
//! after the request.
//!
//! ```text
//! request:  {"module": "service", "action": "start", "args": ["apache2"], "kwargs": {}}
//! response: {"code": 0, "outcome": {"result": "success", "return": null}}
//!           {"code": 10, "error": "Too many arguments"}
//! ```
//!
//! The codes are the exit codes of the `privileged-actions` dispatcher,
//! so a [`Client`](crate::Client) maps daemon responses exactly like
//! dispatcher runs.  Only peers running as root or as the configured
//! user are served; their uid is taken from the socket credentials.

use crate::{
    client::Execute,
    config::Config,
    dispatch::{self, EXIT_FAILURE, MAX_REQUEST_LENGTH},
    error::{ActionError, Error},
    outcome::Outcome,
    registry::Registry,
    runner::{Captured, Invocation},
};
use async_trait::async_trait;
use nix::{
    sys::socket::{getsockopt, sockopt},
    unistd::{getpid, Uid, User},
};
use privileged_log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    env,
    fs::{self, DirBuilder},
    future::{self, Future},
    io,
    os::unix::{
        fs::{DirBuilderExt, PermissionsExt},
        io::{FromRawFd, IntoRawFd, RawFd},
        net::UnixListener as StdUnixListener,
    },
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::mpsc,
    time,
};

/// First file descriptor passed by systemd socket activation.
pub const LISTEN_FDS_START: RawFd = 3;

/// Reply to a single daemon request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Response {
    /// Dispatcher exit code: 0, 10, 20 or 1.
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Why the call was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn outcome(outcome: Outcome) -> Self {
        Self {
            code: 0,
            outcome: Some(outcome),
            error: None,
        }
    }

    pub fn rejected(err: &Error) -> Self {
        Self {
            code: dispatch::exit_code(err),
            outcome: None,
            error: Some(err.to_string()),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_FAILURE,
            outcome: None,
            error: Some(message.into()),
        }
    }

    /// Convert the response into what a dispatcher run would have produced.
    pub fn into_captured(self, action: &str) -> Result<Captured, Error> {
        match self {
            Self {
                code: 0,
                outcome: Some(outcome),
                ..
            } => Ok(Captured {
                stdout: serde_json::to_string(&outcome)?,
                stderr: String::new(),
            }),
            Self { code, error, .. } => Err(Error::Action(ActionError {
                action: action.to_string(),
                stdout: String::new(),
                stderr: error.unwrap_or_default(),
                code: Some(code),
            })),
        }
    }
}

/// Handle one raw request.
pub fn respond(registry: &Registry, request: &[u8]) -> Response {
    let result = parse_request(request).and_then(|(module, action, arguments)| {
        dispatch::call(registry, &module, &action, &arguments)
    });

    match result {
        Ok(outcome) => Response::outcome(outcome),
        Err(err) => {
            error!("Error running privileged request - {}", err);
            Response::rejected(&err)
        }
    }
}

fn parse_request(request: &[u8]) -> Result<(String, String, Value), Error> {
    if request.len() as u64 > MAX_REQUEST_LENGTH {
        return Err(Error::syntax("Request too large"));
    }

    let mut request: Map<String, Value> =
        serde_json::from_slice(request).map_err(|_| Error::syntax("Request not JSON."))?;
    let module = take_name(&mut request, "module")?;
    let action = take_name(&mut request, "action")?;

    // What remains are the arguments; their shape is validated on dispatch.
    Ok((module, action, Value::Object(request)))
}

fn take_name(request: &mut Map<String, Value>, field: &str) -> Result<String, Error> {
    match request.remove(field) {
        Some(Value::String(name)) => Ok(name),
        _ => Err(Error::syntax(format!("Invalid request: {} missing", field))),
    }
}

/// Serves privileged calls on a Unix socket.
#[derive(Debug)]
pub struct Server {
    registry: Arc<Registry>,
    listener: UnixListener,
    allowed: Arc<Vec<Uid>>,
    idle_timeout: Option<Duration>,
    /// Socket file created by the server and removed on shutdown.
    socket: Option<PathBuf>,
}

impl Server {
    /// Serve on an existing listener; only root may connect.
    pub fn new(listener: UnixListener, registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            listener,
            allowed: Arc::new(vec![Uid::from_raw(0)]),
            idle_timeout: None,
            socket: None,
        }
    }

    /// Create the socket file; any local user may connect to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(path: &Path, registry: Registry) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            DirBuilder::new().recursive(true).mode(0o755).create(parent)?;
        }
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;

        let mut server = Self::new(listener, registry);
        server.socket = Some(path.to_path_buf());
        Ok(server)
    }

    /// Use the socket passed by systemd, or bind the configured one.
    ///
    /// Only a socket-activated daemon exits when idle.
    pub fn from_config(config: &Config, registry: Registry) -> Result<Self, Error> {
        let server = match listen_fds()? {
            Some(listener) => {
                info!("systemd socket activated");
                Self::new(listener, registry)
                    .with_idle_timeout(config.daemon.idle_timeout.map(Duration::from_secs))
            }
            None => {
                info!("systemd service activated");
                Self::bind(&config.daemon.socket, registry)?
            }
        };
        server.allow_user(&config.daemon.user)
    }

    /// Also serve peers running as this user.
    pub fn allow_user(self, name: &str) -> Result<Self, Error> {
        let user = User::from_name(name)?.ok_or_else(|| Error::UserNotFound(name.to_string()))?;
        Ok(self.allow(user.uid))
    }

    pub fn allow(mut self, uid: Uid) -> Self {
        Arc::make_mut(&mut self.allowed).push(uid);
        self
    }

    /// Replace the set of peers that are served.
    pub fn with_allowed_uids(mut self, uids: Vec<Uid>) -> Self {
        self.allowed = Arc::new(uids);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Serve until `shutdown` completes or the server was idle for too long.
    ///
    /// Requests that are still running are completed before returning.
    pub async fn serve<F: Future<Output = ()>>(self, shutdown: F) -> Result<(), Error> {
        // Every request holds a clone; the receiver sees the channel
        // close once all of them are done.
        let (done, mut finished) = mpsc::channel::<()>(1);
        let pending = Arc::new(done);

        tokio::pin!(shutdown);
        loop {
            let idle = async {
                match self.idle_timeout {
                    Some(limit) => time::sleep(limit).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down the server");
                    break;
                }
                _ = idle => {
                    if Arc::strong_count(&pending) == 1 {
                        info!("Privileged daemon exiting on idle");
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            warn!("Failed to accept connection - {}", err);
                            continue;
                        }
                    };

                    let registry = self.registry.clone();
                    let allowed = self.allowed.clone();
                    let pending = pending.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle(registry, &allowed, stream).await {
                            warn!("Failed to handle request - {}", err);
                        }
                        drop(pending);
                    });
                }
            }
        }

        drop(pending);
        let _ = finished.recv().await;
        info!("All requests completed");

        if let Some(path) = &self.socket {
            let _ = fs::remove_file(path);
        }

        Ok(())
    }
}

async fn handle(registry: Arc<Registry>, allowed: &[Uid], mut stream: UnixStream) -> Result<(), Error> {
    let uid = Uid::from_raw(stream.peer_cred()?.uid());

    let response = if allowed.contains(&uid) {
        let mut request = Vec::new();
        (&mut stream)
            .take(MAX_REQUEST_LENGTH + 1)
            .read_to_end(&mut request)
            .await?;
        debug!("Request of {} bytes from uid {}", request.len(), uid);

        tokio::task::spawn_blocking(move || respond(&registry, &request))
            .await
            .unwrap_or_else(|err| Response::failed(err.to_string()))
    } else {
        warn!("Rejected request from uid {}", uid);
        Response::rejected(&Error::PermissionDenied)
    };

    stream.write_all(&serde_json::to_vec(&response)?).await?;
    stream.shutdown().await.map_err(Into::into)
}

/// Take over the listening socket passed by systemd, if any.
fn listen_fds() -> Result<Option<UnixListener>, Error> {
    let pid = env::var("LISTEN_PID").ok();
    let fds = env::var("LISTEN_FDS").ok();
    for name in ["LISTEN_PID", "LISTEN_FDS", "LISTEN_FDNAMES"] {
        env::remove_var(name);
    }

    let ours = pid.and_then(|pid| pid.parse::<i32>().ok()) == Some(getpid().as_raw());
    if !ours || fds.as_deref() != Some("1") {
        return Ok(None);
    }
    if !getsockopt(LISTEN_FDS_START, sockopt::AcceptConn)? {
        return Ok(None);
    }

    // Safe: systemd passes ownership of the descriptor to the process.
    let listener = unsafe { StdUnixListener::from_raw_fd(LISTEN_FDS_START) };
    if listener.local_addr().is_err() {
        // Not a Unix socket; leave the descriptor alone.
        let _ = listener.into_raw_fd();
        return Ok(None);
    }

    listener.set_nonblocking(true)?;
    Ok(Some(UnixListener::from_std(listener)?))
}

/// Tell systemd that the daemon is ready, if it asked to be told.
pub fn notify_ready() -> Result<(), Error> {
    let path = match env::var_os("NOTIFY_SOCKET") {
        Some(path) => path,
        None => return Ok(()),
    };
    let socket = std::os::unix::net::UnixDatagram::unbound()?;

    match path.to_str().and_then(|path| path.strip_prefix('@')) {
        #[cfg(target_os = "linux")]
        Some(name) => {
            use std::os::{linux::net::SocketAddrExt, unix::net::SocketAddr};
            let addr = SocketAddr::from_abstract_name(name)?;
            socket.send_to_addr(b"READY=1", &addr)?;
        }
        #[cfg(not(target_os = "linux"))]
        Some(_) => warn!("Abstract notification sockets are not supported"),
        None => {
            socket.send_to(b"READY=1", Path::new(&path))?;
        }
    }

    Ok(())
}

/// Runs dispatcher invocations on the privileged daemon.
#[derive(Debug, Clone)]
pub struct Connector {
    socket: PathBuf,
    timeout: Option<Duration>,
}

impl Connector {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            socket: config.daemon.socket.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send one request to the daemon.
    pub async fn request(
        &self,
        module: &str,
        action: &str,
        arguments: Value,
    ) -> Result<Response, Error> {
        let mut request = match arguments {
            Value::Object(arguments) => arguments,
            _ => return Err(Error::syntax("Invalid arguments format")),
        };
        request.insert("module".to_string(), module.into());
        request.insert("action".to_string(), action.into());
        let request = serde_json::to_vec(&request)?;

        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket).await?;
            stream.write_all(&request).await?;
            stream.shutdown().await?;

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<_, Error>(response)
        };

        let response = match self.timeout {
            Some(limit) => time::timeout(limit, exchange)
                .await
                .map_err(|_| Error::Timeout {
                    action: format!("{}.{}", module, action),
                    seconds: limit.as_secs(),
                })??,
            None => exchange.await?,
        };

        serde_json::from_slice(&response).map_err(Into::into)
    }
}

#[async_trait]
impl Execute for Connector {
    async fn execute(&self, invocation: Invocation) -> Result<Captured, Error> {
        let (module, action) = match invocation.arguments() {
            [module, action] => (module, action),
            _ => {
                return Err(Error::invalid_action(
                    "Daemon requests need a module and an action",
                ))
            }
        };
        let arguments = match invocation.input() {
            Some(input) => serde_json::from_slice(input)?,
            None => dispatch::empty_arguments(),
        };

        self.request(module, action, arguments)
            .await?
            .into_captured(invocation.action())
    }
}
