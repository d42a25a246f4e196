//! Lookup of privileged actions by module and action name.

use crate::{
    action::{normalize, Action, Module},
    error::Error,
};
use std::collections::BTreeMap;

/// All modules known to the dispatcher.
///
/// Populated once at startup and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    modules: BTreeMap<String, Module>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, replacing an earlier one with the same name.
    pub fn module(mut self, module: Module) -> Self {
        self.modules.insert(normalize(module.name()), module);
        self
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Find a privileged action.
    ///
    /// The module name is checked before any lookup is attempted.
    pub fn resolve(&self, module: &str, action: &str) -> Result<&Action, Error> {
        if !is_valid_module_name(module) {
            return Err(Error::syntax("Invalid module name"));
        }

        let module = self
            .modules
            .get(&normalize(module))
            .ok_or_else(|| Error::syntax("Specified module not found"))?;
        let action = module
            .get(action)
            .ok_or_else(|| Error::syntax("Specified action not found"))?;

        if !action.is_privileged() {
            return Err(Error::syntax("Specified action is not privileged action"));
        }

        Ok(action)
    }
}

fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
