pub mod artifacts;
pub mod poller;

use std::{
    io::{Cursor, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::{Client, StatusCode, header, redirect};
use serde_json::Value;
use tokio::time::sleep;
use url::Url;

pub use fleet_hub_core::config::ApiConfig;

const ACCEPT_JSON: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("fleet-hub/", env!("CARGO_PKG_VERSION"));

/// Errors from the control plane, kept separate from one-shot parsing
/// failures so callers can decide what is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} returned {status}")]
    Status { status: StatusCode, url: Url },
    #[error("invalid URL {0:?}: {1}")]
    Url(String, #[source] url::ParseError),
}

/// Authenticated client for the control-plane REST API and its artifact
/// storage backend.
///
/// The two hosts sit behind different trust boundaries: the control plane
/// wants the bearer token, the storage backend rejects it. Redirects are
/// disabled on the underlying client so the hand-off between the two is
/// explicit in [`ApiClient::download_artifact`].
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: String,
    retries: u32,
    backoff: Duration,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            retries: 3,
            backoff: Duration::from_secs(2),
        })
    }

    pub fn with_retry_policy(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        };
        Url::parse(&raw).map_err(|e| ApiError::Url(raw, e))
    }

    /// GET a control-plane endpoint and decode the JSON body.
    ///
    /// Any failure (transport, non-2xx, decode) is retried with a linearly
    /// increasing delay before the last error is returned. GET is naturally
    /// idempotent, so no idempotency key is needed.
    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.endpoint(path)?;
        let mut attempt = 0;
        loop {
            match self.get_once(&url).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    let delay = self.backoff * attempt;
                    tracing::warn!(
                        "GET {} failed (attempt {}/{}), retrying in {:?}: {}",
                        url,
                        attempt,
                        self.retries,
                        delay,
                        e
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &Url) -> Result<Value, ApiError> {
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .header(header::ACCEPT, ACCEPT_JSON)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { status, url: url.clone() });
        }
        Ok(response.json().await?)
    }

    /// Hop 1 of the artifact download: ask the control plane where the
    /// archive lives, without following the redirect ourselves.
    ///
    /// Returns `None` when the API violates the redirect contract (non-302
    /// status, missing `Location`, transport error); those are logged and
    /// treated as "no artifact available".
    pub async fn resolve_redirect_location(&self, archive_url: &Url) -> Option<Url> {
        let response = match self
            .http
            .get(archive_url.clone())
            .bearer_auth(&self.token)
            .header(header::ACCEPT, ACCEPT_JSON)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Failed to request artifact archive {}: {}", archive_url, e);
                return None;
            }
        };
        let status = response.status();
        if status != StatusCode::FOUND {
            tracing::warn!("Expected 302 for artifact archive {}, got {}", archive_url, status);
            return None;
        }
        let Some(location) = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
        else {
            tracing::warn!("Artifact redirect for {} is missing a Location header", archive_url);
            return None;
        };
        match archive_url.join(location) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!("Invalid artifact redirect location {:?}: {}", location, e);
                None
            }
        }
    }

    /// Hop 2: fetch the archive bytes from the storage backend.
    ///
    /// Sent with no Authorization header; the backend 401s any request
    /// carrying the control-plane credential.
    async fn fetch_bytes(&self, url: &Url) -> Result<Bytes, ApiError> {
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { status, url: url.clone() });
        }
        Ok(response.bytes().await?)
    }

    /// Download an artifact archive and extract it into `target_dir`.
    ///
    /// Implements the two-hop, no-auth-leak protocol: resolve the storage
    /// location with the bearer token, then fetch the bytes without it.
    /// Every failure mode degrades to `None` with a warning.
    pub async fn download_artifact(
        &self,
        archive_url: &str,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let archive_url = match Url::parse(archive_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Invalid artifact archive URL {:?}: {}", archive_url, e);
                return Ok(None);
            }
        };
        let Some(location) = self.resolve_redirect_location(&archive_url).await else {
            return Ok(None);
        };
        let bytes = match self.fetch_bytes(&location).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to download artifact from storage backend: {}", e);
                return Ok(None);
            }
        };
        if let Err(e) = extract_zip(&bytes, target_dir) {
            tracing::warn!("Failed to extract artifact archive {}: {:?}", archive_url, e);
            return Ok(None);
        }
        Ok(Some(target_dir.to_path_buf()))
    }
}

/// Extract a zip archive into `target_dir`, skipping entries that would
/// escape it.
fn extract_zip(bytes: &[u8], target_dir: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to open archive")?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let Some(path) = file.enclosed_name() else {
            continue;
        };
        let out_path = target_dir.join(path);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        std::fs::write(&out_path, contents)
            .with_context(|| format!("Failed to write {}", out_path.display()))?;
    }
    Ok(())
}
