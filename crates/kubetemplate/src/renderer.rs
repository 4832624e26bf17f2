//! Template rendering
//!
//! Templates use minijinja syntax. Cluster state is reached through an
//! explicit set of functions backed by an [`Engine`]:
//!
//! - `configmap(name, namespace?)`
//! - `service(name, namespace?)`
//! - `endpoints(name, namespace?)`
//! - `endpoint_ips(name, namespace?)`
//! - `network(kind)`
//! - `env(name)`

use crate::engine::Engine;
use crate::error::{ResolveError, TemplateError};
use minijinja::{Environment, ErrorKind, Value};
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

/// How a template is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Evaluate to discover dependencies; output is discarded and evaluation errors are tolerated
    Learn,
    /// Evaluate to produce the final output; any error is returned
    Render,
}

fn resolve_error(err: ResolveError) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, err.to_string()).with_source(err)
}

/// Renders templates against an [`Engine`].
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    /// Creates a renderer whose functions resolve through `engine`.
    #[must_use]
    pub fn new(engine: &Arc<Engine>) -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);

        let e = Arc::clone(engine);
        env.add_function(
            "configmap",
            move |name: String, namespace: Option<String>| -> Result<Value, minijinja::Error> {
                e.config_map(&name, namespace.as_deref())
                    .map(|cm| Value::from_serialize(&cm))
                    .map_err(resolve_error)
            },
        );

        let e = Arc::clone(engine);
        env.add_function(
            "service",
            move |name: String, namespace: Option<String>| -> Result<Value, minijinja::Error> {
                e.service(&name, namespace.as_deref())
                    .map(|svc| Value::from_serialize(&svc))
                    .map_err(resolve_error)
            },
        );

        let e = Arc::clone(engine);
        env.add_function(
            "endpoints",
            move |name: String, namespace: Option<String>| -> Result<Value, minijinja::Error> {
                e.endpoints(&name, namespace.as_deref())
                    .map(|ep| Value::from_serialize(&ep))
                    .map_err(resolve_error)
            },
        );

        let e = Arc::clone(engine);
        env.add_function(
            "endpoint_ips",
            move |name: String, namespace: Option<String>| -> Result<Value, minijinja::Error> {
                e.endpoint_ips(&name, namespace.as_deref())
                    .map(Value::from)
                    .map_err(resolve_error)
            },
        );

        let e = Arc::clone(engine);
        env.add_function(
            "network",
            move |kind: String| -> Result<Value, minijinja::Error> {
                e.network(&kind).map(Value::from).map_err(resolve_error)
            },
        );

        let e = Arc::clone(engine);
        env.add_function("env", move |name: String| -> Value {
            Value::from(e.env(&name))
        });

        Self { env }
    }

    /// Renders `source` (named `name` in errors) and writes the result to `sink`.
    ///
    /// In [`RenderMode::Learn`] nothing is written and evaluation errors are
    /// logged and swallowed. In [`RenderMode::Render`] the sink is only
    /// written once the whole template rendered.
    ///
    /// # Errors
    /// Syntax errors in either mode; evaluation and write errors in render mode.
    pub fn render(
        &self,
        name: &str,
        source: &str,
        sink: &mut impl Write,
        mode: RenderMode,
    ) -> Result<(), TemplateError> {
        let rendered = match self.env.render_named_str(name, source, ()) {
            Ok(rendered) => rendered,
            Err(err) => {
                let err = TemplateError::from_minijinja(name, err);
                if mode == RenderMode::Learn && !err.is_syntax() {
                    warn!("Ignoring error while learning {}: {}", name, err);
                    return Ok(());
                }
                return Err(err);
            }
        };

        if mode == RenderMode::Render {
            sink.write_all(rendered.as_bytes())
                .map_err(|source| TemplateError::Io {
                    name: name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}
