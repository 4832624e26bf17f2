//! # Controller Configuration
//!
//! Settings loaded from environment variables. Every setting has a default;
//! an empty value counts as unset.

use crate::error::ConfigError;
use crate::secret::ARI_SECRET_ENV;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default local archive path
pub const DEFAULT_SOURCE: &str = "/source/asterisk-config.zip";
/// Where a secret-backed archive is materialized
pub const DEFAULT_SECRET_SOURCE_PATH: &str = "/asterisk-config.zip";
/// Default templates root
pub const DEFAULT_DEFAULTS_DIR: &str = "/defaults";
/// Default custom templates root (archive extraction target)
pub const DEFAULT_CUSTOM_DIR: &str = "/custom";
/// Default export root read by Asterisk
pub const DEFAULT_EXPORT_DIR: &str = "/etc/asterisk";
/// Modules reloaded after each render
pub const DEFAULT_RELOAD_MODULES: &str = "res_pjsip.so";
/// Default ARI base URL
pub const DEFAULT_ARI_URL: &str = "http://127.0.0.1:8088/ari";
/// Default minimum interval between reload passes (seconds)
pub const DEFAULT_MIN_RELOAD_INTERVAL_SECS: u64 = 5;
/// Default time Asterisk has to report ready (seconds)
pub const DEFAULT_ARI_READY_TIMEOUT_SECS: u64 = 600;
/// Default bound on each cluster lookup (seconds)
pub const DEFAULT_KUBE_API_TIMEOUT_SECS: u64 = 10;
/// Runs shorter than this count as short deaths (seconds)
pub const DEFAULT_MIN_RUNTIME_SECS: u64 = 60;
/// Consecutive short deaths before giving up
pub const DEFAULT_MAX_SHORT_DEATHS: u32 = 10;

/// Ordered list of modules to reload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleList(Vec<String>);

impl ModuleList {
    /// Parses a comma-separated list; entries are trimmed and empty ones dropped.
    #[must_use]
    pub fn parse(list: &str) -> Self {
        Self(
            list.split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Modules in reload order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Whether there is nothing to reload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ModuleList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// Credentials for downloading an HTTP source.
#[derive(Clone, Default)]
pub struct SourceAuth {
    /// Basic auth user (`URL_USERNAME`)
    pub username: Option<String>,
    /// Basic auth password (`URL_PASSWORD`)
    pub password: Option<String>,
    /// Opaque `Authorization` header value (`URL_AUTHORIZATION`)
    pub authorization: Option<String>,
}

impl fmt::Debug for SourceAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where the custom archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    /// A zip on the local filesystem
    Local(PathBuf),
    /// A zip fetched over HTTP(S)
    Remote(String),
    /// A zip stored in a Secret, materialized to `path` before each cycle
    Secret {
        /// Secret namespace
        namespace: String,
        /// Secret name
        name: String,
        /// Local path the archive is written to
        path: PathBuf,
    },
}

impl fmt::Display for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
            Self::Secret { namespace, name, path } => {
                write!(f, "secret {namespace}/{name} (via {})", path.display())
            }
        }
    }
}

/// Controller configuration
#[derive(Clone)]
pub struct Config {
    /// Cloud provider for network discovery (`CLOUD`)
    pub cloud: String,
    /// Archive location
    pub source: ArchiveSource,
    /// Pod namespace (`POD_NAMESPACE`), default for template lookups
    pub namespace: Option<String>,
    /// Templates shipped with the image (`DEFAULTS_DIR`)
    pub defaults_dir: PathBuf,
    /// Templates extracted from the archive (`CUSTOM_DIR`)
    pub custom_dir: PathBuf,
    /// Rendered output (`EXPORT_DIR`)
    pub export_dir: PathBuf,
    /// Modules reloaded after each render (`RELOAD_MODULES`)
    pub reload_modules: ModuleList,
    /// Preset ARI secret (`ARI_AUTOSECRET`)
    pub ari_secret: Option<String>,
    /// ARI base URL (`ARI_URL`)
    pub ari_url: String,
    /// Credentials for HTTP sources
    pub source_auth: SourceAuth,
    /// Minimum interval between reload passes
    pub min_reload_interval: Duration,
    /// How long Asterisk has to report ready
    pub ari_ready_timeout: Duration,
    /// Bound on each cluster lookup
    pub kube_api_timeout: Duration,
    /// Runs shorter than this are short deaths
    pub min_runtime: Duration,
    /// Short deaths tolerated before giving up
    pub max_short_deaths: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("cloud", &self.cloud)
            .field("source", &self.source)
            .field("namespace", &self.namespace)
            .field("defaults_dir", &self.defaults_dir)
            .field("custom_dir", &self.custom_dir)
            .field("export_dir", &self.export_dir)
            .field("reload_modules", &self.reload_modules)
            .field("ari_secret", &self.ari_secret.as_ref().map(|_| "<redacted>"))
            .field("ari_url", &self.ari_url)
            .field("source_auth", &self.source_auth)
            .field("min_reload_interval", &self.min_reload_interval)
            .field("ari_ready_timeout", &self.ari_ready_timeout)
            .field("kube_api_timeout", &self.kube_api_timeout)
            .field("min_runtime", &self.min_runtime)
            .field("max_short_deaths", &self.max_short_deaths)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables with defaults
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] for unparsable numbers, a zero reload interval
    /// or API timeout, or a secret source without a namespace.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// # Errors
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| -> Result<Duration, ConfigError> {
            parse_or(get(key), key, default).map(Duration::from_secs)
        };
        let nonzero_secs = |key: &str, default: u64| -> Result<Duration, ConfigError> {
            let value = secs(key, default)?;
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(value)
        };

        let namespace = get("POD_NAMESPACE");
        let source = match get("SECRET_SOURCE_NAME") {
            Some(name) => ArchiveSource::Secret {
                namespace: namespace.clone().ok_or_else(|| ConfigError::Invalid {
                    key: "SECRET_SOURCE_NAME".to_string(),
                    value: name.clone(),
                    reason: "POD_NAMESPACE must be set to read the source secret".to_string(),
                })?,
                name,
                path: PathBuf::from(get_or("SECRET_SOURCE_PATH", DEFAULT_SECRET_SOURCE_PATH)),
            },
            None => {
                let source = get_or("SOURCE", DEFAULT_SOURCE);
                if is_remote(&source) {
                    ArchiveSource::Remote(source)
                } else {
                    ArchiveSource::Local(PathBuf::from(source))
                }
            }
        };

        Ok(Self {
            cloud: get("CLOUD").unwrap_or_default(),
            source,
            namespace,
            defaults_dir: PathBuf::from(get_or("DEFAULTS_DIR", DEFAULT_DEFAULTS_DIR)),
            custom_dir: PathBuf::from(get_or("CUSTOM_DIR", DEFAULT_CUSTOM_DIR)),
            export_dir: PathBuf::from(get_or("EXPORT_DIR", DEFAULT_EXPORT_DIR)),
            reload_modules: ModuleList::parse(&get_or("RELOAD_MODULES", DEFAULT_RELOAD_MODULES)),
            ari_secret: get(ARI_SECRET_ENV),
            ari_url: get_or("ARI_URL", DEFAULT_ARI_URL),
            source_auth: SourceAuth {
                username: get("URL_USERNAME"),
                password: get("URL_PASSWORD"),
                authorization: get("URL_AUTHORIZATION"),
            },
            min_reload_interval: nonzero_secs("MIN_RELOAD_INTERVAL_SECS", DEFAULT_MIN_RELOAD_INTERVAL_SECS)?,
            ari_ready_timeout: secs("ARI_READY_TIMEOUT_SECS", DEFAULT_ARI_READY_TIMEOUT_SECS)?,
            kube_api_timeout: nonzero_secs("KUBE_API_TIMEOUT_SECS", DEFAULT_KUBE_API_TIMEOUT_SECS)?,
            min_runtime: secs("MIN_RUNTIME_SECS", DEFAULT_MIN_RUNTIME_SECS)?,
            max_short_deaths: parse_or(get("MAX_SHORT_DEATHS"), "MAX_SHORT_DEATHS", DEFAULT_MAX_SHORT_DEATHS)?,
        })
    }
}

/// Whether a source refers to an HTTP(S) download.
#[must_use]
pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: v.clone(),
            reason: e.to_string(),
        }),
    }
}
