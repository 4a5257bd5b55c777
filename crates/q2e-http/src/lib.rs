//! reqwest client construction + response helpers shared by the Quartzy and eLabFTW clients.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Response, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "q2e-http";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Skip TLS certificate verification (`--insecure`).
    pub accept_invalid_certs: bool,
    pub proxy: Option<String>,
    /// Extra PEM root certificate (private CA in front of a self-hosted eLabFTW).
    pub ca_cert_path: Option<PathBuf>,
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("quartzy2elabftw/{}", env!("CARGO_PKG_VERSION"))),
            accept_invalid_certs: false,
            proxy: None,
            ca_cert_path: None,
            default_headers: Vec::new(),
        }
    }
}

impl HttpClientConfig {
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.default_headers.push((name.to_string(), value.into()));
        self
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.default_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name {name:?}"))?;
        let mut value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header {name}"))?;
        value.set_sensitive(name == reqwest::header::AUTHORIZATION || name.as_str() == "access-token");
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .default_headers(headers);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    if config.accept_invalid_certs {
        warn!("TLS certificate verification disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(proxy) = &config.proxy {
        debug!(proxy, "routing requests through proxy");
        builder = builder.proxy(
            reqwest::Proxy::all(proxy.as_str()).with_context(|| format!("invalid proxy url {proxy}"))?,
        );
    }

    if let Some(path) = &config.ca_cert_path {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading CA certificate {}", path.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("parsing CA certificate {}", path.display()))?;
        builder = builder.add_root_certificate(cert);
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("no Location header in response from {url}")]
    MissingLocation { url: String },
    #[error("couldn't parse ID from Location header: {location}")]
    InvalidLocation { location: String },
    #[error("unexpected response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Passes the response through when its status is `expected`.
pub fn expect_status(response: Response, expected: StatusCode) -> Result<Response, HttpError> {
    if response.status() == expected {
        Ok(response)
    } else {
        Err(HttpError::Status {
            status: response.status().as_u16(),
            url: response.url().to_string(),
        })
    }
}

/// Passes the response through on any 2xx status.
pub fn expect_success(response: Response) -> Result<Response, HttpError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(HttpError::Status {
            status: response.status().as_u16(),
            url: response.url().to_string(),
        })
    }
}

pub async fn read_json(response: Response) -> Result<JsonValue, HttpError> {
    let url = response.url().to_string();
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|source| HttpError::Decode { url, source })
}

/// Last path segment of a `Location` header, e.g. `https://elab/api/v2/items/42` → 42.
pub fn id_from_location(location: &str) -> Option<u64> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
}

pub fn location_id(response: &Response) -> Result<u64, HttpError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HttpError::MissingLocation {
            url: response.url().to_string(),
        })?;
    id_from_location(location).ok_or_else(|| HttpError::InvalidLocation {
        location: location.to_string(),
    })
}
