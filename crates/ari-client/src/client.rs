//! ARI HTTP client
//!
//! Covers the two endpoints the config sidecar needs:
//! `PUT /asterisk/modules/{name}` and `GET /asterisk/variable`.

use crate::ari_trait::AriClientTrait;
use crate::error::AriError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// ARI user the sidecar authenticates as
pub const ARI_USERNAME: &str = "k8s-asterisk-config";

#[derive(Debug, Deserialize)]
struct VariableResponse {
    #[serde(default)]
    value: String,
}

/// Asterisk REST Interface client
#[derive(Clone)]
pub struct AriClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl std::fmt::Debug for AriClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AriClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AriClient {
    /// Create a new ARI client
    ///
    /// # Arguments
    /// * `base_url` - ARI base URL (e.g., "http://127.0.0.1:8088/ari")
    /// * `username` - ARI user
    /// * `password` - ARI password
    ///
    /// # Errors
    /// Returns [`AriError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, AriError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl AriClientTrait for AriClient {
    async fn get_variable(&self, name: &str) -> Result<String, AriError> {
        let url = format!("{}/asterisk/variable", self.base_url);
        debug!("Reading ARI variable {}", name);

        let response = self
            .client
            .get(&url)
            .query(&[("variable", name)])
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AriError::Variable {
                name: name.to_string(),
                status: status.to_string(),
            });
        }

        let body = response.text().await?;
        let variable: VariableResponse = serde_json::from_str(&body)?;
        Ok(variable.value)
    }

    async fn reload_module(&self, module: &str) -> Result<(), AriError> {
        let url = format!(
            "{}/asterisk/modules/{}",
            self.base_url,
            urlencoding::encode(module)
        );
        debug!("Reloading module {}", module);

        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(AriError::ModuleNotLoaded(module.to_string())),
            StatusCode::UNAUTHORIZED => Err(AriError::Unauthorized(module.to_string())),
            StatusCode::CONFLICT => Err(AriError::ModuleBusy(module.to_string())),
            status => Err(AriError::Unexpected {
                module: module.to_string(),
                status: status.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> AriClient {
        AriClient::new(&format!("{}/ari/", server.uri()), ARI_USERNAME, "s3cret").unwrap()
    }

    #[tokio::test]
    async fn test_reload_module_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/ari/asterisk/modules/res_pjsip.so"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).await.reload_module("res_pjsip.so").await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_status_mapping() {
        let server = MockServer::start().await;
        for (module, status) in [("a.so", 404), ("b.so", 401), ("c.so", 409), ("d.so", 500)] {
            Mock::given(method("PUT"))
                .and(path(format!("/ari/asterisk/modules/{module}")))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }
        let client = client(&server).await;

        let err = client.reload_module("a.so").await.unwrap_err();
        assert!(matches!(err, AriError::ModuleNotLoaded(ref m) if m == "a.so"));
        assert_eq!(err.to_string(), "module a.so not loaded");

        assert!(matches!(
            client.reload_module("b.so").await.unwrap_err(),
            AriError::Unauthorized(_)
        ));
        assert!(matches!(
            client.reload_module("c.so").await.unwrap_err(),
            AriError::ModuleBusy(_)
        ));
        let err = client.reload_module("d.so").await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert_eq!(err.module(), Some("d.so"));
    }

    #[tokio::test]
    async fn test_system_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ari/asterisk/variable"))
            .and(query_param("variable", "ASTERISK_CONFIG_SYSTEM_READY"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"value":"1"}"#))
            .mount(&server)
            .await;

        assert!(client(&server).await.system_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_system_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ari/asterisk/variable"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"value":"0"}"#))
            .mount(&server)
            .await;

        assert!(!client(&server).await.system_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_variable_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ari/asterisk/variable"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).await.system_ready().await.unwrap_err();
        assert!(matches!(err, AriError::Variable { .. }));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = AriClient::new("http://127.0.0.1:8088/ari/", ARI_USERNAME, "s3cret").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8088/ari");
        let client = AriClient::new("http://127.0.0.1:8088/ari", ARI_USERNAME, "s3cret").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8088/ari");
    }
}
