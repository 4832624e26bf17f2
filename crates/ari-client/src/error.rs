//! ARI client errors

use thiserror::Error;

/// Errors that can occur when talking to the Asterisk REST Interface
#[derive(Debug, Error)]
pub enum AriError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The module is not loaded in Asterisk (404)
    #[error("module {0} not loaded")]
    ModuleNotLoaded(String),

    /// ARI rejected the credentials (401)
    #[error("bad authentication reloading module {0}")]
    Unauthorized(String),

    /// Asterisk could not reload the module (409)
    #[error("module {0} could not be reloaded")]
    ModuleBusy(String),

    /// Any other non-success status
    #[error("unexpected response reloading {module}: {status}")]
    Unexpected {
        /// Module that was being reloaded
        module: String,
        /// Status line returned by ARI
        status: String,
    },

    /// The variable endpoint answered with an error status
    #[error("failed to read variable {name}: {status}")]
    Variable {
        /// Variable that was requested
        name: String,
        /// Status line returned by ARI
        status: String,
    },
}

impl AriError {
    /// Module named by a reload failure, if any.
    #[must_use]
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::ModuleNotLoaded(m) | Self::Unauthorized(m) | Self::ModuleBusy(m) => Some(m),
            Self::Unexpected { module, .. } => Some(module),
            _ => None,
        }
    }
}
