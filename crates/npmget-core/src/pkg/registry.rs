//! npm registry access.
//!
//! The installer talks to the registry through the [`Registry`] trait so that
//! tests can substitute an in-memory registry. [`RegistryClient`] is the HTTP
//! implementation.

use super::error::PkgError;
use super::packument::Packument;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::trace;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override registry URL.
pub const REGISTRY_ENV: &str = "NPMGET_REGISTRY";

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Source of package metadata and tarballs.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Fetch the packument for `name`.
    async fn fetch_metadata(&self, name: &str) -> Result<Packument, PkgError>;

    /// Download the tarball at `url`.
    async fn fetch_tarball(&self, url: &str) -> Result<Bytes, PkgError>;
}

/// Network time limits for registry requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub metadata: Duration,
    pub tarball: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            metadata: Duration::from_secs(15),
            tarball: Duration::from_secs(30),
        }
    }
}

/// HTTP registry client.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: Url,
    http: Client,
    timeouts: HttpTimeouts,
    max_tarball_bytes: u64,
}

impl RegistryClient {
    /// Create a new registry client with the given base URL.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, PkgError> {
        Self::with_timeouts(base_url, HttpTimeouts::default())
    }

    /// Create a client with explicit network time limits.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn with_timeouts(base_url: &str, timeouts: HttpTimeouts) -> Result<Self, PkgError> {
        // Url::join replaces the last segment unless the base ends in '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).map_err(|e| {
            PkgError::registry_unavailable(format!("Invalid registry URL '{base_url}': {e}"))
        })?;

        let http = Client::builder()
            .connect_timeout(timeouts.connect)
            .user_agent(concat!("npmget/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                PkgError::registry_unavailable(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            base_url,
            http,
            timeouts,
            max_tarball_bytes: MAX_TARBALL_SIZE,
        })
    }

    /// Override the tarball size cap.
    #[must_use]
    pub fn with_max_tarball_bytes(mut self, max: u64) -> Self {
        self.max_tarball_bytes = max;
        self
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Metadata URL for a package name.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be built.
    pub fn packument_url(&self, name: &str) -> Result<Url, PkgError> {
        self.base_url.join(&encode_name(name)).map_err(|e| {
            PkgError::registry_unavailable(format!("Failed to build URL for '{name}': {e}"))
        })
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn fetch_metadata(&self, name: &str) -> Result<Packument, PkgError> {
        let url = self.packument_url(name)?;
        trace!(%url, "GET packument");

        let response = self
            .http
            .get(url.as_str())
            .timeout(self.timeouts.metadata)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name));
        }

        if !response.status().is_success() {
            return Err(PkgError::registry_unavailable(format!(
                "Registry returned status {} for '{name}'",
                response.status()
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            PkgError::registry_unavailable(format!("Failed to read metadata for '{name}': {e}"))
        })?;

        Packument::from_slice(&body)
    }

    async fn fetch_tarball(&self, url: &str) -> Result<Bytes, PkgError> {
        let max_bytes = self.max_tarball_bytes;
        trace!(%url, "GET tarball");

        let response = self
            .http
            .get(url)
            .timeout(self.timeouts.tarball)
            .send()
            .await
            .map_err(|e| {
                PkgError::registry_unavailable(format!("Failed to download '{url}': {e}"))
            })?;

        if !response.status().is_success() {
            return Err(PkgError::registry_unavailable(format!(
                "Download failed with status {} for '{url}'",
                response.status()
            )));
        }

        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(PkgError::registry_unavailable(format!(
                    "Tarball too large: {len} bytes (max: {max_bytes})"
                )));
            }
        }

        let bytes = response.bytes().await.map_err(|e| {
            PkgError::registry_unavailable(format!("Failed to read response body: {e}"))
        })?;

        if bytes.len() as u64 > max_bytes {
            return Err(PkgError::registry_unavailable(format!(
                "Tarball too large: {} bytes (max: {max_bytes})",
                bytes.len()
            )));
        }

        Ok(bytes)
    }
}

/// URL-encode the name for scoped packages (`@scope/name` -> `@scope%2Fname`).
fn encode_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}
