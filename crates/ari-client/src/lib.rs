//! Asterisk REST Interface client
//!
//! A small client for the parts of ARI a configuration sidecar needs:
//! reloading modules after new configuration is written, and checking the
//! readiness variable before the first reload.
//!
//! # Example
//!
//! ```no_run
//! use ari_client::{ARI_USERNAME, AriClient, AriClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AriClient::new("http://127.0.0.1:8088/ari", ARI_USERNAME, "secret")?;
//!
//! if client.system_ready().await? {
//!     client.reload_module("res_pjsip.so").await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod ari_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use ari_trait::{AriClientTrait, SYSTEM_READY_VARIABLE};
pub use client::{ARI_USERNAME, AriClient};
pub use error::AriError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockAriClient;
