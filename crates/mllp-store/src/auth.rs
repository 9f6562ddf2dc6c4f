//! OAuth2 access-token sources for the Cloud APIs.
//!
//! Token *minting* from service-account keys is out of scope; the
//! adapter either runs on GCE/GKE and asks the metadata server, or is
//! handed a ready-made token through the credentials file.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use mllp_common::{AdapterError, Result, TokenProvider};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Fetches tokens for the default service account from the GCE metadata
/// server, caching them until shortly before expiry.
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataTokenProvider {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        Ok(Self {
            client,
            cached: Mutex::new(None),
        })
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > Instant::now() {
                return Ok(entry.token.clone());
            }
        }

        let resp = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| AdapterError::Auth(format!("metadata token request: {}", e)))?;
        if !resp.status().is_success() {
            return Err(AdapterError::Auth(format!(
                "metadata token request: status {}",
                resp.status()
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Auth(format!("parsing token response: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

/// Reads a token from the file named by the credentials flag. The file is
/// re-read on every request so an external refresher can rotate it.
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AdapterError::Auth(format!("reading {}: {}", self.path.display(), e)))?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(AdapterError::Auth(format!(
                "credentials file {} is empty",
                self.path.display()
            )));
        }
        Ok(token.to_string())
    }
}

/// Fixed token, for tests and fakes.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
