//! Transport seam for remote manifests and content.
//!
//! The lifecycle core never talks HTTP directly; it goes through
//! [`UpdateTransport`] so tests can substitute an in-memory fake.
//! Timeout policy lives here, not in the loader.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::UpdateError;
use crate::manifest::{ContentIndex, ContentManifest, CONTENT_INDEX_FILE};

/// Fetches remote release metadata and content files.
#[async_trait]
pub trait UpdateTransport: Send + Sync {
    /// Fetch and parse the remote release manifest.
    async fn fetch_manifest(&self, url: &str) -> Result<ContentManifest, UpdateError>;

    /// Fetch and parse the content index published at the release's
    /// content URL.
    async fn fetch_content_index(&self, content_url: &str) -> Result<ContentIndex, UpdateError>;

    /// Fetch one content file, addressed relative to the content URL.
    async fn fetch_content_file(
        &self,
        content_url: &str,
        file: &str,
    ) -> Result<Vec<u8>, UpdateError>;
}

/// reqwest-backed transport used in production.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hotpush/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn content_file_url(content_url: &str, file: &str) -> String {
        format!("{}/{}", content_url.trim_end_matches('/'), file)
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateTransport for HttpTransport {
    async fn fetch_manifest(&self, url: &str) -> Result<ContentManifest, UpdateError> {
        let bytes =
            self.get_bytes(url)
                .await
                .map_err(|e| UpdateError::RemoteManifestUnreachable {
                    reason: e.to_string(),
                })?;
        serde_json::from_slice(&bytes).map_err(|e| UpdateError::ManifestCorrupt {
            reason: e.to_string(),
        })
    }

    async fn fetch_content_index(&self, content_url: &str) -> Result<ContentIndex, UpdateError> {
        let url = Self::content_file_url(content_url, CONTENT_INDEX_FILE);
        let bytes = self
            .get_bytes(&url)
            .await
            .map_err(|e| UpdateError::ContentUnreachable {
                reason: e.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| UpdateError::ManifestCorrupt {
            reason: e.to_string(),
        })
    }

    async fn fetch_content_file(
        &self,
        content_url: &str,
        file: &str,
    ) -> Result<Vec<u8>, UpdateError> {
        let url = Self::content_file_url(content_url, file);
        self.get_bytes(&url)
            .await
            .map_err(|e| UpdateError::ContentUnreachable {
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_file_urls_join_without_double_slashes() {
        assert_eq!(
            HttpTransport::content_file_url("https://cdn.example.com/r/2.0/", "js/app.js"),
            "https://cdn.example.com/r/2.0/js/app.js"
        );
        assert_eq!(
            HttpTransport::content_file_url("https://cdn.example.com/r/2.0", "index.html"),
            "https://cdn.example.com/r/2.0/index.html"
        );
    }
}
