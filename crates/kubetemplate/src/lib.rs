//! Kubernetes-aware templates
//!
//! Renders configuration templates whose content comes from live cluster
//! objects and network discovery. While a template tree is first evaluated,
//! every (kind, namespace) it reads is watched; [`Engine::wait`] then
//! resolves as soon as any of that state changes.

pub mod client;
pub mod cluster;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod renderer;
pub mod watch;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster::{ChangeStream, ClusterClient, ClusterObject, ResourceKind, WatchKey, endpoint_ips};
pub use discovery::{CloudProvider, Discoverer, LocalDiscoverer, MetadataDiscoverer, NetworkFact, discoverer_for};
pub use engine::{DEFAULT_API_TIMEOUT, Engine, EngineOptions};
pub use error::{ClusterError, EngineError, ResolveError, TemplateError};
pub use renderer::{RenderMode, TemplateRenderer};
pub use watch::{ChangeState, WatchRegistry, WatchState};
