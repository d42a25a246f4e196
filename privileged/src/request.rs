use crate::types::REDACTED;
use serde_json::{json, Map, Value};
use std::{collections::BTreeSet, fmt};

/// A call of a privileged action from the unprivileged side.
#[derive(Clone, Default)]
pub struct Request {
    module: String,
    action: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    secret_args: BTreeSet<usize>,
    secret_kwargs: BTreeSet<String>,
    quiet: bool,
}

impl Request {
    pub fn new(module: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    /// Add a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Add a positional argument that is never logged.
    pub fn secret_arg(mut self, value: impl Into<Value>) -> Self {
        self.secret_args.insert(self.args.len());
        self.arg(value)
    }

    /// Add a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Add a keyword argument that is never logged.
    pub fn secret_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        self.secret_kwargs.insert(name.clone());
        self.kwarg(name, value)
    }

    /// Do not log failures of this call.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// The JSON arguments written to the dispatcher.
    pub fn payload(&self) -> Value {
        json!({
            "args": self.args,
            "kwargs": self.kwargs,
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args.iter().enumerate().map(|(index, value)| {
            if self.secret_args.contains(&index) {
                REDACTED.to_string()
            } else {
                value.to_string()
            }
        });
        let kwargs = self.kwargs.iter().map(|(name, value)| {
            if self.secret_kwargs.contains(name) {
                format!("{}={}", name, REDACTED)
            } else {
                format!("{}={}", name, value)
            }
        });

        write!(
            f,
            "{}.{}({})",
            self.module,
            self.action,
            args.chain(kwargs).collect::<Vec<_>>().join(", ")
        )
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Request").field(&self.to_string()).finish()
    }
}
