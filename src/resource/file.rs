use super::{ResourceClient, ResourceError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Reads `file://` urls from the local file system. Headers are ignored.
#[derive(Clone, Debug, Default)]
pub struct FileClient;

impl FileClient {
    fn path<'a>(&self, url: &'a str) -> Result<&'a str, ResourceError> {
        url.strip_prefix("file://").ok_or_else(|| {
            ResourceError::Unsupported(format!("{} (this client supports only file:// urls)", url))
        })
    }
}

fn map_io(url: &str, error: std::io::Error) -> ResourceError {
    if error.kind() == ErrorKind::NotFound {
        ResourceError::NotFound(url.to_string())
    } else {
        ResourceError::File(error)
    }
}

#[async_trait]
impl ResourceClient for FileClient {
    async fn get(
        &self,
        url: &str,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let path = self.path(url)?;
        tokio::fs::read(path).await.map_err(|e| map_io(url, e))
    }

    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let path = self.path(url)?;
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| map_io(url, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut bytes = vec![0; length];
        file.read_exact(&mut bytes).await?;
        Ok(bytes)
    }
}
