pub mod memory;

#[cfg(feature = "fs")]
pub mod file;

#[cfg(feature = "reqwest")]
pub mod reqwest;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Transport options forwarded with every request of a layer.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub headers: BTreeMap<String, String>,
}

impl NetworkOptions {
    pub fn headers(&self) -> Option<BTreeMap<String, String>> {
        if self.headers.is_empty() {
            None
        } else {
            Some(self.headers.clone())
        }
    }
}

/// Byte source behind every decoder. Implementations only have to provide `get`; ranged and
/// json reads are derived from it.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError>;

    /// Reads `length` bytes starting at `offset`, through an HTTP `Range` header by default.
    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let Some(range) = range_header(offset, length)? else {
            return Ok(Vec::new());
        };
        let mut headers = headers.unwrap_or_default();
        headers.insert("Range".to_string(), range);
        self.get(url, Some(headers)).await
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<T, ResourceError> {
        let bytes = self.get(url, headers).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Inclusive `bytes=first-last` value, `None` for an empty range.
pub(crate) fn range_header(offset: u64, length: usize) -> Result<Option<String>, ResourceError> {
    if length == 0 {
        return Ok(None);
    }
    let last = offset
        .checked_add(length as u64 - 1)
        .ok_or(ResourceError::InvalidRange { offset, length })?;
    Ok(Some(format!("bytes={}-{}", offset, last)))
}

#[async_trait]
impl<C: ResourceClient> ResourceClient for Arc<C> {
    async fn get(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        (**self).get(url, headers).await
    }

    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        (**self).get_range(url, offset, length, headers).await
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<T, ResourceError> {
        (**self).get_json(url, headers).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Request failed: {0}")]
    Network(String),

    #[error("Undecodable json document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server answered with status {0}")]
    Status(u16),

    #[error("No resource at {0}")]
    NotFound(String),

    #[error("Local read failed: {0}")]
    File(#[from] std::io::Error),

    #[error("Byte range {offset}+{length} cannot be served")]
    InvalidRange { offset: u64, length: usize },

    #[error("{0}")]
    Other(String),

    #[error("No client for url {0}")]
    Unsupported(String),
}

/// Directory part of a url, without the trailing slash.
pub(crate) fn parent_url(url: &str) -> &str {
    match url.rfind('/') {
        Some(index) => &url[..index],
        None => "",
    }
}

/// Resolves `href` against the directory `base`; absolute urls are returned untouched.
pub(crate) fn resolve_url(base: &str, href: &str) -> String {
    if href.contains("://") || href.starts_with('/') || base.is_empty() {
        return href.to_string();
    }
    let href = href.strip_prefix("./").unwrap_or(href);
    format!("{}/{}", base.trim_end_matches('/'), href)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(range_header(10, 4).unwrap().as_deref(), Some("bytes=10-13"));
        assert_eq!(range_header(10, 0).unwrap(), None);
        assert!(matches!(
            range_header(u64::MAX, 2),
            Err(ResourceError::InvalidRange { length: 2, .. })
        ));
    }

    #[test]
    fn parent_url_strips_file_name() {
        assert_eq!(parent_url("https://host/data/ept.json"), "https://host/data");
        assert_eq!(parent_url("ept.json"), "");
    }

    #[test]
    fn resolve_url_joins_relative_hrefs() {
        assert_eq!(
            resolve_url("https://host/index", "./tiles/a.copc.laz"),
            "https://host/index/tiles/a.copc.laz"
        );
        assert_eq!(
            resolve_url("https://host/index", "https://other/b.copc.laz"),
            "https://other/b.copc.laz"
        );
    }
}
