//! Calling privileged actions from the unprivileged side.
//!
//! A [`Client`] runs the dispatcher program as root with the module and
//! action names as its only options and the JSON arguments on stdin, or
//! sends the same call to the privileged daemon.
//! The exit code and the printed [`Outcome`] are mapped back to a
//! return value or an error:
//!
//! | Dispatcher result      | Error                        |
//! |------------------------|------------------------------|
//! | exit code 10           | [`Error::Syntax`] or [`Error::Type`] |
//! | exit code 20           | [`Error::PermissionDenied`]  |
//! | other non-zero exit    | [`Error::Action`]            |
//! | no parseable outcome   | [`Error::Action`]            |
//! | `exception` outcome    | [`Error::Exception`]         |

use crate::{
    config::Config,
    daemon::Connector,
    dispatch::{EXIT_PERM, EXIT_SYNTAX, PROGRAM},
    error::{ActionError, Error},
    outcome::Outcome,
    request::Request,
    runner::{Captured, Invocation, Privilege, Runner},
};
use async_trait::async_trait;
use privileged_log::{debug, error};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Something that runs an action invocation to completion.
#[async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, invocation: Invocation) -> Result<Captured, Error>;
}

#[async_trait]
impl Execute for Runner {
    async fn execute(&self, invocation: Invocation) -> Result<Captured, Error> {
        self.output(invocation).await
    }
}

/// Caller of privileged actions.
#[derive(Debug, Clone)]
pub struct Client<E = Runner> {
    executor: E,
    program: String,
    privilege: Privilege,
}

impl Client<Runner> {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self::new(Runner::new(config)?, config.program.clone()))
    }
}

impl Client<Connector> {
    /// Call actions on the privileged daemon instead of through `sudo`.
    pub fn connect(config: &Config) -> Self {
        Self::new(Connector::from_config(config), config.program.clone())
    }
}

impl<E: Execute> Client<E> {
    /// Create a client that runs `program` as root.
    pub fn new(executor: E, program: impl Into<String>) -> Self {
        Self {
            executor,
            program: program.into(),
            privilege: Privilege::Root,
        }
    }

    /// Change the user the dispatcher runs as.
    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Call a privileged action and convert its return value.
    pub async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, Error> {
        let value = self.call_value(request).await?;
        serde_json::from_value(value).map_err(Into::into)
    }

    /// Call a privileged action and return the raw JSON return value.
    pub async fn call_value(&self, request: Request) -> Result<Value, Error> {
        let result = self.run(&request).await;
        if let Err(err) = &result {
            if !request.is_quiet() {
                error!("Error running privileged request {} - {}", request, err);
            }
        }
        result
    }

    async fn run(&self, request: &Request) -> Result<Value, Error> {
        debug!("Running privileged request - {}", request);

        let invocation = Invocation::new(&self.program)
            .arg(request.module())
            .arg(request.action())
            .stdin(serde_json::to_vec(&request.payload())?)
            .with_privilege(self.privilege.clone())
            .quiet();

        let captured = match self.executor.execute(invocation).await {
            Ok(captured) => captured,
            Err(Error::Action(err)) => return Err(failure(err)),
            Err(err) => return Err(err),
        };

        let outcome = match serde_json::from_str::<Outcome>(&captured.stdout) {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(Error::Action(ActionError {
                    action: self.program.clone(),
                    stdout: captured.stdout,
                    stderr: captured.stderr,
                    code: Some(0),
                }))
            }
        };

        match outcome {
            Outcome::Success { value } => Ok(value),
            Outcome::Exception { mut exception } => {
                exception.stderr = captured.stderr;
                Err(Error::Exception(exception))
            }
        }
    }
}

fn failure(err: ActionError) -> Error {
    match err.code {
        Some(EXIT_SYNTAX) => {
            let message = err.message();
            let prefix = format!("{}: ", PROGRAM);
            Error::rejected(message.strip_prefix(&prefix).unwrap_or(message))
        }
        Some(EXIT_PERM) => Error::PermissionDenied,
        _ => Error::Action(err),
    }
}
