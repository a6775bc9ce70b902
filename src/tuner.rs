use std::io::SeekFrom;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio_util::io::StreamReader;
use tracing::info;

use crate::session::ChannelId;

pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boundary to the broadcast tuner: "give me the raw byte stream for channel
/// X at priority P". Everything behind it is opaque to the stream core.
#[async_trait]
pub trait TunerClient: Send + Sync {
    async fn service_stream(
        &self,
        channel_id: ChannelId,
        priority: i32,
    ) -> anyhow::Result<SourceReader>;
}

/// Tuner reached over HTTP, e.g. a Mirakurun-compatible backend.
pub struct HttpTuner {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTuner {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl TunerClient for HttpTuner {
    async fn service_stream(
        &self,
        channel_id: ChannelId,
        priority: i32,
    ) -> anyhow::Result<SourceReader> {
        let url = format!(
            "{}/api/services/{}/stream?priority={}",
            self.base_url.trim_end_matches('/'),
            channel_id,
            priority
        );
        info!("acquiring tuner stream: channel={} priority={}", channel_id, priority);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("tuner request failed: {url}"))?;

        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));

        Ok(Box::new(StreamReader::new(stream)))
    }
}

/// Opens a recorded file positioned at `offset` bytes.
pub async fn open_recorded(path: &Path, offset: u64) -> anyhow::Result<SourceReader> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("recorded file not readable: {}", path.display()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(Box::new(file))
}

/// Tuner stub handing out empty streams while counting acquisitions, so
/// tests can observe whether a request actually reached the tuner.
#[cfg(test)]
pub struct StubTuner {
    pub acquisitions: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl StubTuner {
    pub fn new() -> Self {
        Self {
            acquisitions: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl TunerClient for StubTuner {
    async fn service_stream(
        &self,
        _channel_id: ChannelId,
        _priority: i32,
    ) -> anyhow::Result<SourceReader> {
        self.acquisitions
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(Box::new(tokio::io::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn open_recorded_honours_byte_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10.m2ts");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut reader = open_recorded(&path, 4).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"456789");
    }

    #[tokio::test]
    async fn open_recorded_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.m2ts");
        assert!(open_recorded(&missing, 0).await.is_err());
    }
}
