//! Template engine errors

use crate::cluster::ResourceKind;
use thiserror::Error;

/// Errors returned by a [`ClusterClient`](crate::ClusterClient) implementation
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The requested object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: ResourceKind,
        /// Namespace that was searched
        namespace: String,
        /// Name of the missing object
        name: String,
    },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(String),

    /// The API server returned a different kind than was asked for
    #[error("expected {expected}, got {actual}")]
    UnexpectedKind {
        /// Kind that was requested
        expected: ResourceKind,
        /// Kind that was returned
        actual: ResourceKind,
    },

    /// Watch stream failed
    #[error("watch failed: {0}")]
    Watch(String),
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        Self::Api(err.to_string())
    }
}

/// Errors returned by the resolver functions exposed to templates
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No namespace was given and no default namespace is configured
    #[error("failed to determine namespace for {kind} {name}")]
    NamespaceUnresolved {
        /// Kind being looked up
        kind: ResourceKind,
        /// Name being looked up
        name: String,
    },

    /// The cluster lookup failed
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The cluster lookup did not answer within the API timeout
    #[error("timed out after {seconds}s fetching {kind} {namespace}/{name}")]
    Timeout {
        /// Kind being looked up
        kind: ResourceKind,
        /// Namespace being searched
        namespace: String,
        /// Name being looked up
        name: String,
        /// Timeout that elapsed
        seconds: u64,
    },

    /// The network query key is not one of the supported facts
    #[error("unsupported network query: {0}")]
    UnsupportedQuery(String),

    /// Network discovery failed
    #[error("network discovery failed: {0}")]
    Discovery(String),

    /// The engine was closed while a lookup was in flight
    #[error("template engine is closed")]
    Closed,
}

/// Errors produced while rendering a single template
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template text could not be parsed
    #[error("template syntax error in {name}: {detail}")]
    Syntax {
        /// Template name (usually its path)
        name: String,
        /// Parser message including the offending location
        detail: String,
    },

    /// Evaluation failed, usually because a resolver function failed
    #[error("failed to evaluate template {name}: {source}")]
    Evaluation {
        /// Template name (usually its path)
        name: String,
        /// Underlying evaluation error
        #[source]
        source: minijinja::Error,
    },

    /// Writing rendered output failed
    #[error("failed to write rendered output for {name}: {source}")]
    Io {
        /// Template name (usually its path)
        name: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl TemplateError {
    /// Builds the error variant matching the kind of a minijinja failure.
    pub(crate) fn from_minijinja(name: &str, err: minijinja::Error) -> Self {
        if err.kind() == minijinja::ErrorKind::SyntaxError {
            let detail = match err.line() {
                Some(line) => format!("line {line}: {err:#}"),
                None => format!("{err:#}"),
            };
            Self::Syntax {
                name: name.to_string(),
                detail,
            }
        } else {
            Self::Evaluation {
                name: name.to_string(),
                source: err,
            }
        }
    }

    /// Whether this is a parse failure rather than an evaluation failure.
    #[must_use]
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}

/// Errors reported by [`Engine::wait`](crate::Engine::wait)
#[derive(Debug, Error)]
pub enum EngineError {
    /// A resource watch failed; the engine can no longer detect changes
    #[error("resource watch failed: {0}")]
    WatchFailed(String),

    /// The engine was closed or its cancellation token fired
    #[error("template engine was cancelled")]
    Cancelled,
}
