//! AriClient trait for mocking
//!
//! The reloader depends on this trait rather than on [`AriClient`](crate::AriClient)
//! so tests can observe reload calls without a running Asterisk.

use crate::error::AriError;

/// Channel variable Asterisk's dialplan sets to `1` once the system is ready
pub const SYSTEM_READY_VARIABLE: &str = "ASTERISK_CONFIG_SYSTEM_READY";

/// Trait for the ARI operations used by the reloader
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait AriClientTrait: Send + Sync {
    /// Reads a global variable.
    async fn get_variable(&self, name: &str) -> Result<String, AriError>;

    /// Reloads a single module.
    async fn reload_module(&self, module: &str) -> Result<(), AriError>;

    /// Whether Asterisk reports itself ready for reloads.
    async fn system_ready(&self) -> Result<bool, AriError> {
        Ok(self.get_variable(SYSTEM_READY_VARIABLE).await? == "1")
    }
}
