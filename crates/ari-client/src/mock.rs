//! Mock AriClient for unit testing
//!
//! Records every reload call and answers readiness checks from a
//! configurable value, so reload sequencing can be tested without Asterisk.

#![allow(clippy::unwrap_used, reason = "test support code")]

use crate::ari_trait::AriClientTrait;
use crate::error::AriError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock AriClient for testing
#[derive(Debug, Clone, Default)]
pub struct MockAriClient {
    variables: Arc<Mutex<HashMap<String, String>>>,
    variable_reads: Arc<Mutex<usize>>,
    reloads: Arc<Mutex<Vec<String>>>,
    not_loaded: Arc<Mutex<Vec<String>>>,
}

impl MockAriClient {
    /// Create a mock that reports the system as ready
    #[must_use]
    pub fn ready() -> Self {
        let mock = Self::default();
        mock.set_variable(crate::SYSTEM_READY_VARIABLE, "1");
        mock
    }

    /// Create a mock that never reports the system as ready
    #[must_use]
    pub fn not_ready() -> Self {
        let mock = Self::default();
        mock.set_variable(crate::SYSTEM_READY_VARIABLE, "0");
        mock
    }

    /// Set a variable value
    pub fn set_variable(&self, name: &str, value: &str) {
        self.variables
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    /// Make reloads of `module` fail with [`AriError::ModuleNotLoaded`]
    pub fn set_not_loaded(&self, module: &str) {
        self.not_loaded.lock().unwrap().push(module.to_string());
    }

    /// Modules reload was requested for, in call order (including failed calls)
    #[must_use]
    pub fn reloads(&self) -> Vec<String> {
        self.reloads.lock().unwrap().clone()
    }

    /// Number of variable reads so far
    #[must_use]
    pub fn variable_reads(&self) -> usize {
        *self.variable_reads.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl AriClientTrait for MockAriClient {
    async fn get_variable(&self, name: &str) -> Result<String, AriError> {
        *self.variable_reads.lock().unwrap() += 1;
        Ok(self
            .variables
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn reload_module(&self, module: &str) -> Result<(), AriError> {
        self.reloads.lock().unwrap().push(module.to_string());
        if self.not_loaded.lock().unwrap().iter().any(|m| m == module) {
            return Err(AriError::ModuleNotLoaded(module.to_string()));
        }
        Ok(())
    }
}
