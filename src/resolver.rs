//! Link resolution: premium-hoster link to direct download URL.
//!
//! The scheduler never resolves links. Resolution happens once, at submission,
//! and any failure there rejects the submission without creating a row.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::config::EngineConfig;

/// A resolved, directly downloadable link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLink {
    pub direct_url: String,
    pub filename: String,
    /// Size in bytes, 0 when the service does not know it.
    pub size: u64,
}

/// Errors from the link-resolution service.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No API key configured.
    #[error("no debrid API key configured")]
    MissingApiKey,

    #[error("network error contacting debrid service: {0}")]
    Network(#[source] reqwest::Error),

    #[error("debrid service returned HTTP {status}")]
    HttpStatus { status: u16 },

    /// The service answered with an error envelope.
    #[error("debrid service rejected request ({code}): {message}")]
    Api { code: String, message: String },

    #[error("invalid debrid API base URL: {0}")]
    InvalidBaseUrl(String),

    /// The body did not match the expected envelope.
    #[error("unexpected response from debrid service: {0}")]
    InvalidResponse(String),
}

/// Turns hoster links into direct URLs.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Resolves one link.
    async fn resolve(&self, link: &str) -> Result<ResolvedLink, ResolveError>;

    /// Checks that the configured credentials are accepted.
    async fn validate_credentials(&self) -> Result<(), ResolveError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct UnlockData {
    link: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    filesize: u64,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    username: String,
    #[serde(default, rename = "isPremium")]
    is_premium: bool,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ResolveError> {
        if self.status == "success" {
            return self
                .data
                .ok_or_else(|| ResolveError::InvalidResponse("missing data".to_string()));
        }
        match self.error {
            Some(error) => Err(ResolveError::Api {
                code: error.code,
                message: error.message,
            }),
            None => Err(ResolveError::InvalidResponse(format!(
                "status `{}` without error details",
                self.status
            ))),
        }
    }
}

/// AllDebrid v4 client.
#[derive(Debug, Clone)]
pub struct AllDebridClient {
    client: Client,
    base_url: String,
    agent: String,
    api_key: String,
}

impl AllDebridClient {
    /// Builds a client for `base_url` (for example `https://api.alldebrid.com/v4`).
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::MissingApiKey`] for an empty key and
    /// [`ResolveError::Network`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        agent: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ResolveError> {
        if api_key.trim().is_empty() {
            return Err(ResolveError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ResolveError::Network)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: agent.to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    /// Builds a client from the engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::MissingApiKey`] when no key is configured.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ResolveError> {
        let api_key = config
            .alldebrid_api_key
            .as_deref()
            .ok_or(ResolveError::MissingApiKey)?;
        Self::new(
            &config.alldebrid_base_url,
            &config.alldebrid_agent,
            api_key,
            config.connect_timeout(),
        )
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        extra: &[(&str, &str)],
    ) -> Result<T, ResolveError> {
        let mut url = Url::parse(&format!("{}/{endpoint}", self.base_url))
            .map_err(|_| ResolveError::InvalidBaseUrl(self.base_url.clone()))?;
        url.query_pairs_mut()
            .append_pair("agent", &self.agent)
            .append_pair("apikey", &self.api_key)
            .extend_pairs(extra);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(ResolveError::Network)?;

        let status = response.status();
        // Error envelopes may come with 4xx; try the body first.
        let body = response.text().await.map_err(ResolveError::Network)?;
        match serde_json::from_str::<Envelope<T>>(&body) {
            Ok(envelope) => envelope.into_data(),
            Err(_) if !status.is_success() => Err(ResolveError::HttpStatus {
                status: status.as_u16(),
            }),
            Err(error) => Err(ResolveError::InvalidResponse(error.to_string())),
        }
    }
}

#[async_trait]
impl LinkResolver for AllDebridClient {
    #[instrument(skip(self))]
    async fn resolve(&self, link: &str) -> Result<ResolvedLink, ResolveError> {
        let data: UnlockData = self.get("link/unlock", &[("link", link)]).await?;
        debug!(filename = %data.filename, size = data.filesize, "link unlocked");
        Ok(ResolvedLink {
            direct_url: data.link,
            filename: data.filename,
            size: data.filesize,
        })
    }

    #[instrument(skip(self))]
    async fn validate_credentials(&self) -> Result<(), ResolveError> {
        let data: UserData = self.get("user", &[]).await?;
        debug!(username = %data.user.username, premium = data.user.is_premium, "credentials accepted");
        Ok(())
    }
}
