//! Privileged action descriptors.

use crate::{
    error::Error,
    outcome::Outcome,
    types::Type,
    validate,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};

/// Function that runs an action with validated arguments.
///
/// Arguments are passed in declared parameter order with defaults
/// filled in.
pub type Handler = fn(Vec<Value>) -> Result<Outcome, Error>;

/// A declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: &'static str,
    pub ty: Type,
    /// Value used when the caller does not provide the argument.
    pub default: Option<Value>,
}

impl Param {
    pub fn new(name: &'static str, ty: Type) -> Self {
        Self {
            name,
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A function that can be called through the dispatcher.
///
/// Only actions marked with [`Action::privileged`] are callable across
/// the privilege boundary; everything else is rejected by the
/// dispatcher even if it is registered.
#[derive(Debug, Clone)]
pub struct Action {
    name: &'static str,
    params: Vec<Param>,
    handler: Handler,
    privileged: bool,
}

impl Action {
    pub fn new(name: &'static str, params: Vec<Param>, handler: Handler) -> Self {
        Self {
            name,
            params,
            handler,
            privileged: false,
        }
    }

    /// Mark the action as privileged.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Validate the `{"args": [...], "kwargs": {...}}` payload and run.
    pub fn call(&self, arguments: &Value) -> Result<Outcome, Error> {
        let values = validate::validate(&self.params, arguments)?;
        self.invoke(values)
    }

    /// Run the handler with already validated values.
    ///
    /// A panicking handler is reported as an exception outcome.
    pub fn invoke(&self, values: Vec<Value>) -> Result<Outcome, Error> {
        let handler = self.handler;
        panic::catch_unwind(AssertUnwindSafe(move || handler(values)))
            .unwrap_or_else(|payload| Ok(Outcome::from_panic(payload)))
    }

    /// Take the next validated argument and convert it to `T`.
    pub fn argument<T: DeserializeOwned>(
        arguments: &mut impl Iterator<Item = Value>,
        name: &str,
    ) -> Result<T, Error> {
        let value = arguments
            .next()
            .ok_or_else(|| Error::syntax(format!("Argument not provided: {}", name)))?;
        serde_json::from_value(value)
            .map_err(|err| Error::Type(format!("Invalid value for arg {}: {}", name, err)))
    }
}

/// A named group of actions.
#[derive(Debug, Clone)]
pub struct Module {
    name: &'static str,
    actions: Vec<Action>,
}

impl Module {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            actions: vec![],
        }
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    /// Look up an action; `-` and `_` are equivalent.
    pub fn get(&self, name: &str) -> Option<&Action> {
        let name = normalize(name);
        self.actions
            .iter()
            .find(|action| normalize(action.name) == name)
    }
}

pub(crate) fn normalize(name: &str) -> String {
    name.replace('-', "_")
}
