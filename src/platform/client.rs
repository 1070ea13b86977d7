//! HTTP client shared by metadata, bundle and segment requests

use crate::error::StreamError;
use crate::platform::persona::ClientPersona;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36";

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: Option<String>,
    /// Proxy URL
    pub proxy_url: Option<String>,
    /// Force HTTP/1.1 only (disable HTTP/2)
    pub http1_only: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            proxy_url: None,
            http1_only: false,
        }
    }
}

impl HttpClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn with_http1_only(mut self, http1_only: bool) -> Self {
        self.http1_only = http1_only;
        self
    }
}

/// Thin wrapper around a configured `reqwest::Client`
#[derive(Debug, Clone)]
pub struct VideoClient {
    client: Client,
    config: HttpClientConfig,
}

impl VideoClient {
    /// Create a client with default configuration
    pub fn new() -> Result<Self, StreamError> {
        Self::with_config(HttpClientConfig::default())
    }

    /// Create a client with custom configuration
    pub fn with_config(config: HttpClientConfig) -> Result<Self, StreamError> {
        let mut builder = ClientBuilder::new()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT));

        if config.http1_only {
            builder = builder.http1_only();
        }

        if let Some(proxy_url) = &config.proxy_url {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!("Ignoring invalid proxy {}: {}", proxy_url, e),
            }
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Create a request with common browser headers
    pub fn create_request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Accept", "*/*")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Connection", "keep-alive")
            .header("Cache-Control", "no-cache")
    }

    /// Minimal request for media hosts; extra browser headers provoke 403s
    pub fn create_simple_media_request(
        &self,
        method: reqwest::Method,
        url: &str,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(
                "User-Agent",
                self.config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
            )
            .header("Accept", "*/*")
            .header("Accept-Encoding", "identity")
            .header("Connection", "keep-alive")
            .header("Cache-Control", "no-cache")
    }

    /// POST request to a player endpoint, identifying as `persona`
    pub fn create_innertube_request(
        &self,
        url: &str,
        persona: &ClientPersona,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .create_request(reqwest::Method::POST, url)
            .header("Content-Type", "application/json")
            .header("X-YouTube-Client-Name", persona.client_id.to_string())
            .header("X-YouTube-Client-Version", persona.client_version.as_str());

        if let Some(user_agent) = &persona.user_agent {
            request = request.header("User-Agent", user_agent.as_str());
        }
        request
    }

    /// GET a text resource, mapping non-success statuses to errors
    pub async fn get_text(&self, url: &str) -> Result<String, StreamError> {
        debug!("GET {}", url);
        let response = self
            .create_request(reqwest::Method::GET, url)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::persona::PersonaRegistry;

    #[test]
    fn test_client_with_config() {
        let config = HttpClientConfig::default()
            .with_timeout(Duration::from_secs(60))
            .with_user_agent("Custom Agent")
            .with_http1_only(true);

        let client = VideoClient::with_config(config).unwrap();
        assert_eq!(client.config().timeout, Duration::from_secs(60));
        assert_eq!(client.config().user_agent.as_deref(), Some("Custom Agent"));
        assert!(client.config().http1_only);
    }

    #[test]
    fn test_innertube_request_carries_persona_headers() {
        let client = VideoClient::new().unwrap();
        let registry = PersonaRegistry::builtin();
        let persona = registry.get("ios").unwrap();

        let request = client
            .create_innertube_request("https://example.com/youtubei/v1/player", persona)
            .build()
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.headers()["X-YouTube-Client-Name"], "5");
        assert_eq!(request.headers()["X-YouTube-Client-Version"], "20.10.4");
        assert!(request.headers()["User-Agent"]
            .to_str()
            .unwrap()
            .starts_with("com.google.ios.youtube"));
    }

    #[test]
    fn test_simple_media_request_headers() {
        let client = VideoClient::new().unwrap();
        let request = client
            .create_simple_media_request(reqwest::Method::GET, "https://example.com/seg.ts")
            .build()
            .unwrap();
        assert_eq!(request.headers()["Accept-Encoding"], "identity");
        assert!(request.headers().get("Accept-Language").is_none());
    }

    #[tokio::test]
    async fn test_get_text_maps_status() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/base.js")
            .with_status(200)
            .with_body("var a=1;")
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/missing.js")
            .with_status(404)
            .create_async()
            .await;

        let client = VideoClient::new().unwrap();
        let body = client
            .get_text(&format!("{}/base.js", server.url()))
            .await
            .unwrap();
        assert_eq!(body, "var a=1;");

        let err = client
            .get_text(&format!("{}/missing.js", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::HttpStatus { status: 404, .. }));

        ok.assert_async().await;
        missing.assert_async().await;
    }
}
