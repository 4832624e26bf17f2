//! Network discovery
//!
//! Answers the `network(...)` template function: the pod's hostname and its
//! private/public addresses. Cloud providers are queried through their
//! instance-metadata services; anything else falls back to local discovery.

use crate::error::ResolveError;
use reqwest::Client;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// A network fact a template can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFact {
    /// Host name of the node/instance
    Hostname,
    /// Private IPv4 address
    PrivateIpv4,
    /// Public IPv4 address
    PublicIpv4,
    /// Public IPv6 address
    PublicIpv6,
}

impl FromStr for NetworkFact {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hostname" => Ok(Self::Hostname),
            "privateipv4" | "privatev4" => Ok(Self::PrivateIpv4),
            "publicipv4" | "publicv4" => Ok(Self::PublicIpv4),
            "publicipv6" | "publicv6" => Ok(Self::PublicIpv6),
            _ => Err(ResolveError::UnsupportedQuery(s.to_string())),
        }
    }
}

/// Trait for network discovery backends
#[async_trait::async_trait]
pub trait Discoverer: Send + Sync {
    /// Host name
    async fn hostname(&self) -> Result<String, ResolveError>;
    /// Private IPv4 address
    async fn private_ipv4(&self) -> Result<Ipv4Addr, ResolveError>;
    /// Public IPv4 address
    async fn public_ipv4(&self) -> Result<Ipv4Addr, ResolveError>;
    /// Public IPv6 address
    async fn public_ipv6(&self) -> Result<Ipv6Addr, ResolveError>;

    /// Answers a single fact as a string.
    async fn lookup(&self, fact: NetworkFact) -> Result<String, ResolveError> {
        match fact {
            NetworkFact::Hostname => self.hostname().await,
            NetworkFact::PrivateIpv4 => self.private_ipv4().await.map(|ip| ip.to_string()),
            NetworkFact::PublicIpv4 => self.public_ipv4().await.map(|ip| ip.to_string()),
            NetworkFact::PublicIpv6 => self.public_ipv6().await.map(|ip| ip.to_string()),
        }
    }
}

/// Cloud providers with an instance-metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// Google Cloud Platform
    Gcp,
    /// DigitalOcean
    DigitalOcean,
}

impl CloudProvider {
    /// Parses the `CLOUD` setting. Returns `None` for local discovery.
    #[must_use]
    pub fn from_name(cloud: &str) -> Option<Self> {
        match cloud.to_ascii_lowercase().as_str() {
            "aws" => Some(Self::Aws),
            "azure" => Some(Self::Azure),
            "gcp" => Some(Self::Gcp),
            "digitalocean" | "do" => Some(Self::DigitalOcean),
            _ => None,
        }
    }

    fn base_url(self) -> &'static str {
        match self {
            Self::Aws => "http://169.254.169.254/latest/meta-data",
            Self::Azure => "http://169.254.169.254/metadata/instance",
            Self::Gcp => "http://metadata.google.internal/computeMetadata/v1/instance",
            Self::DigitalOcean => "http://169.254.169.254/metadata/v1",
        }
    }

    fn header(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Azure => Some(("Metadata", "true")),
            Self::Gcp => Some(("Metadata-Flavor", "Google")),
            Self::Aws | Self::DigitalOcean => None,
        }
    }

    fn path(self, fact: NetworkFact) -> Option<&'static str> {
        use NetworkFact::{Hostname, PrivateIpv4, PublicIpv4, PublicIpv6};
        match (self, fact) {
            (Self::Aws, Hostname) => Some("local-hostname"),
            (Self::Aws, PrivateIpv4) => Some("local-ipv4"),
            (Self::Aws, PublicIpv4) => Some("public-ipv4"),
            (Self::Aws, PublicIpv6) => Some("ipv6"),
            (Self::Azure, Hostname) => Some("compute/name?api-version=2017-08-01&format=text"),
            (Self::Azure, PrivateIpv4) => Some(
                "network/interface/0/ipv4/ipAddress/0/privateIpAddress?api-version=2017-08-01&format=text",
            ),
            (Self::Azure, PublicIpv4) => Some(
                "network/interface/0/ipv4/ipAddress/0/publicIpAddress?api-version=2017-08-01&format=text",
            ),
            (Self::Azure, PublicIpv6) => Some(
                "network/interface/0/ipv6/ipAddress/0/publicIpAddress?api-version=2017-08-01&format=text",
            ),
            (Self::Gcp, Hostname) => Some("hostname"),
            (Self::Gcp, PrivateIpv4) => Some("network-interfaces/0/ip"),
            (Self::Gcp, PublicIpv4) => Some("network-interfaces/0/access-configs/0/external-ip"),
            (Self::Gcp, PublicIpv6) => None,
            (Self::DigitalOcean, Hostname) => Some("hostname"),
            (Self::DigitalOcean, PrivateIpv4) => Some("interfaces/private/0/ipv4/address"),
            (Self::DigitalOcean, PublicIpv4) => Some("interfaces/public/0/ipv4/address"),
            (Self::DigitalOcean, PublicIpv6) => Some("interfaces/public/0/ipv6/address"),
        }
    }
}

fn http_client() -> Result<Client, ResolveError> {
    Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()
        .map_err(|e| ResolveError::Discovery(format!("failed to build HTTP client: {e}")))
}

async fn fetch_text(request: reqwest::RequestBuilder, what: &str) -> Result<String, ResolveError> {
    let response = request
        .send()
        .await
        .map_err(|e| ResolveError::Discovery(format!("{what}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ResolveError::Discovery(format!("{what}: HTTP {status}")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| ResolveError::Discovery(format!("{what}: {e}")))?;
    Ok(body.trim().to_string())
}

fn parse_ip<T: FromStr>(raw: &str, what: &str) -> Result<T, ResolveError> {
    raw.parse()
        .map_err(|_| ResolveError::Discovery(format!("{what}: not an address: {raw:?}")))
}

/// Discovery through a cloud provider's instance-metadata service.
#[derive(Debug, Clone)]
pub struct MetadataDiscoverer {
    http: Client,
    provider: CloudProvider,
    base_url: String,
}

impl MetadataDiscoverer {
    /// Creates a discoverer for `provider` using its well-known metadata endpoint.
    ///
    /// # Errors
    /// Returns [`ResolveError::Discovery`] if the HTTP client cannot be built.
    pub fn new(provider: CloudProvider) -> Result<Self, ResolveError> {
        Self::with_base_url(provider, provider.base_url())
    }

    /// Creates a discoverer that queries `base_url` instead of the provider default.
    ///
    /// # Errors
    /// Returns [`ResolveError::Discovery`] if the HTTP client cannot be built.
    pub fn with_base_url(provider: CloudProvider, base_url: &str) -> Result<Self, ResolveError> {
        Ok(Self {
            http: http_client()?,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn query(&self, fact: NetworkFact) -> Result<String, ResolveError> {
        let path = self.provider.path(fact).ok_or_else(|| {
            ResolveError::Discovery(format!("{fact:?} is not available on {:?}", self.provider))
        })?;
        let url = format!("{}/{}", self.base_url, path);
        debug!("Querying instance metadata: {}", url);

        let mut request = self.http.get(&url);
        if let Some((name, value)) = self.provider.header() {
            request = request.header(name, value);
        }
        fetch_text(request, &url).await
    }
}

#[async_trait::async_trait]
impl Discoverer for MetadataDiscoverer {
    async fn hostname(&self) -> Result<String, ResolveError> {
        self.query(NetworkFact::Hostname).await
    }

    async fn private_ipv4(&self) -> Result<Ipv4Addr, ResolveError> {
        let raw = self.query(NetworkFact::PrivateIpv4).await?;
        parse_ip(&raw, "private IPv4")
    }

    async fn public_ipv4(&self) -> Result<Ipv4Addr, ResolveError> {
        let raw = self.query(NetworkFact::PublicIpv4).await?;
        parse_ip(&raw, "public IPv4")
    }

    async fn public_ipv6(&self) -> Result<Ipv6Addr, ResolveError> {
        let raw = self.query(NetworkFact::PublicIpv6).await?;
        parse_ip(&raw, "public IPv6")
    }
}

/// Discovery without a metadata service.
///
/// The hostname comes from `HOSTNAME` or `/etc/hostname`, the private address
/// from the interface that routes outbound traffic, and the public addresses
/// from an address echo service.
#[derive(Debug, Clone)]
pub struct LocalDiscoverer {
    http: Client,
    ipv4_echo_url: String,
    ipv6_echo_url: String,
}

impl LocalDiscoverer {
    /// Creates a local discoverer using the public ipify echo service.
    ///
    /// # Errors
    /// Returns [`ResolveError::Discovery`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_echo_urls("https://api.ipify.org", "https://api6.ipify.org")
    }

    /// Creates a local discoverer with custom echo services.
    ///
    /// # Errors
    /// Returns [`ResolveError::Discovery`] if the HTTP client cannot be built.
    pub fn with_echo_urls(ipv4_echo_url: &str, ipv6_echo_url: &str) -> Result<Self, ResolveError> {
        Ok(Self {
            http: http_client()?,
            ipv4_echo_url: ipv4_echo_url.to_string(),
            ipv6_echo_url: ipv6_echo_url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Discoverer for LocalDiscoverer {
    async fn hostname(&self) -> Result<String, ResolveError> {
        if let Ok(name) = std::env::var("HOSTNAME") {
            if !name.is_empty() {
                return Ok(name);
            }
        }
        let name = tokio::fs::read_to_string("/etc/hostname")
            .await
            .map_err(|e| ResolveError::Discovery(format!("failed to read /etc/hostname: {e}")))?;
        Ok(name.trim().to_string())
    }

    async fn private_ipv4(&self) -> Result<Ipv4Addr, ResolveError> {
        // Connecting a UDP socket sends nothing; it only selects the route
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ResolveError::Discovery(format!("failed to bind UDP socket: {e}")))?;
        socket
            .connect("8.8.8.8:80")
            .await
            .map_err(|e| ResolveError::Discovery(format!("no IPv4 route: {e}")))?;
        let local = socket
            .local_addr()
            .map_err(|e| ResolveError::Discovery(format!("failed to read local address: {e}")))?;
        match local.ip() {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(ip) => Err(ResolveError::Discovery(format!(
                "outbound address {ip} is not IPv4"
            ))),
        }
    }

    async fn public_ipv4(&self) -> Result<Ipv4Addr, ResolveError> {
        let raw = fetch_text(self.http.get(&self.ipv4_echo_url), &self.ipv4_echo_url).await?;
        parse_ip(&raw, "public IPv4")
    }

    async fn public_ipv6(&self) -> Result<Ipv6Addr, ResolveError> {
        let raw = fetch_text(self.http.get(&self.ipv6_echo_url), &self.ipv6_echo_url).await?;
        parse_ip(&raw, "public IPv6")
    }
}

/// Picks the discoverer for a `CLOUD` setting.
///
/// An empty setting selects local discovery; an unknown one does too, with a warning.
///
/// # Errors
/// Returns [`ResolveError::Discovery`] if the HTTP client cannot be built.
pub fn discoverer_for(cloud: &str) -> Result<Arc<dyn Discoverer>, ResolveError> {
    match CloudProvider::from_name(cloud) {
        Some(provider) => Ok(Arc::new(MetadataDiscoverer::new(provider)?)),
        None => {
            if !cloud.is_empty() {
                warn!("Unhandled cloud {}, using local network discovery", cloud);
            }
            Ok(Arc::new(LocalDiscoverer::new()?))
        }
    }
}
