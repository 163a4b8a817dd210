use super::{ResourceClient, ResourceError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Serves resources from an in-memory map. Every request is recorded, which makes it handy to
/// assert on fetch patterns.
#[derive(Clone, Debug, Default)]
pub struct MemoryClient {
    inner: Arc<Mutex<MemoryStore>>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
    requests: Vec<String>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.store().entries.insert(url.into(), bytes.into());
    }

    pub fn insert_json(&self, url: impl Into<String>, value: &serde_json::Value) {
        self.insert(url, value.to_string());
    }

    pub fn remove(&self, url: &str) -> Option<Vec<u8>> {
        self.store().entries.remove(url)
    }

    /// Urls requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.store().requests.clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.store().requests.iter().filter(|r| *r == url).count()
    }

    fn store(&self) -> std::sync::MutexGuard<'_, MemoryStore> {
        // a poisoned store only means a test panicked mid-request
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn get(
        &self,
        url: &str,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let mut store = self.store();
        store.requests.push(url.to_string());
        store
            .entries
            .get(url)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(url.to_string()))
    }

    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let mut store = self.store();
        store.requests.push(url.to_string());
        let bytes = store
            .entries
            .get(url)
            .ok_or_else(|| ResourceError::NotFound(url.to_string()))?;

        let start = offset as usize;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or(ResourceError::InvalidRange { offset, length })?;

        Ok(bytes[start..end].to_vec())
    }
}
