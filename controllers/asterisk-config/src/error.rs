//! Controller-specific error types.
//!
//! Library errors (cluster, template, ARI) convert into [`ControllerError`];
//! the supervisor decides from [`ControllerError::is_fatal`] whether a
//! failed run is retried.

use ari_client::AriError;
use kubetemplate::{ClusterError, EngineError, ResolveError, TemplateError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems with settings or with the template trees themselves.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A template root does not exist
    #[error("template root {0} does not exist")]
    MissingRoot(PathBuf),

    /// A pass walked both roots without finding a single file
    #[error("no files processed")]
    NoFilesProcessed,

    /// A template would overwrite a file the sidecar owns
    #[error("{0} is reserved and cannot be produced by a template")]
    ReservedName(String),

    /// An environment setting could not be used
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Environment variable
        key: String,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Errors that can occur in the asterisk-config controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Settings or template tree problem
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cluster lookup or watch error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Template syntax, evaluation or output error
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Cloud discovery could not be set up
    #[error("Discovery error: {0}")]
    Resolve(#[from] ResolveError),

    /// The template engine's watches failed
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// ARI error
    #[error("ARI error: {0}")]
    Ari(#[from] AriError),

    /// Filesystem error without a known path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem error on a specific path
    #[error("{action} {path}: {source}")]
    File {
        /// What was being attempted
        action: &'static str,
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Directory walk error
    #[error("Failed to walk template tree: {0}")]
    Walk(#[from] walkdir::Error),

    /// Archive could not be read
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// HTTP transport error while downloading the source
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Source download answered but could not be used
    #[error("Failed to download source: {0}")]
    Download(String),

    /// The source secret is missing its archive key
    #[error("Source secret error: {0}")]
    SourceSecret(String),

    /// An archive entry would be written outside the custom root
    #[error("Archive entry {0:?} escapes the destination directory")]
    UnsafeArchivePath(String),

    /// Asterisk never reported ready
    #[error("Asterisk did not become ready within {}s", .0.as_secs())]
    NeverReady(Duration),

    /// Too many consecutive short runs
    #[error("Giving up after {deaths} consecutive short runs; last error: {last}")]
    CrashLoop {
        /// Consecutive short runs
        deaths: u32,
        /// Error that ended the final run
        last: Box<ControllerError>,
    },

    /// A background task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

impl ControllerError {
    /// Errors that end the process without a restart.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NeverReady(_) | Self::CrashLoop { .. })
    }

    pub(crate) fn file(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::File {
            action,
            path,
            source,
        }
    }
}

impl From<tokio::task::JoinError> for ControllerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
