//! Recorded-file session variants: the source is a byte range of a file on
//! disk instead of a tuner stream.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::StreamError;
use crate::process::{self, EncoderProcess};
use crate::readiness;
use crate::session::{
    Container, EncodedId, RecordedId, SessionContext, SessionInfo, StreamSession, ViewerCounter,
};
use crate::settings::StreamingSettings;
use crate::tuner;

const OUTPUT_CHANNEL_CAPACITY: usize = 8192;

/// Source file for a recording, optionally one of its re-encoded renditions.
fn recorded_path(ctx: &SessionContext, recorded_id: RecordedId, encoded_id: Option<EncodedId>) -> PathBuf {
    let dir = &ctx.settings.recorded_dir;
    match encoded_id {
        Some(encoded_id) => dir.join(format!("{recorded_id}.enc{encoded_id}.mp4")),
        None => dir.join(format!("{recorded_id}.m2ts")),
    }
}

/// Segmented delivery of a recorded file; readiness-gated like its live
/// counterpart.
pub struct RecordedHlsSession {
    ctx: Arc<SessionContext>,
    recorded_id: RecordedId,
    encoded_id: Option<EncodedId>,
    mode: usize,
    slot: Option<usize>,
    process: Option<EncoderProcess>,
    viewers: ViewerCounter,
}

impl RecordedHlsSession {
    pub fn new(
        ctx: Arc<SessionContext>,
        recorded_id: RecordedId,
        mode: usize,
        encoded_id: Option<EncodedId>,
    ) -> Self {
        Self {
            ctx,
            recorded_id,
            encoded_id,
            mode,
            slot: None,
            process: None,
            viewers: ViewerCounter::new(),
        }
    }
}

#[async_trait]
impl StreamSession for RecordedHlsSession {
    async fn start(&mut self, slot: usize) -> Result<(), StreamError> {
        let settings = &self.ctx.settings;
        let profile = StreamingSettings::pick("recorded_hls", &settings.recorded_hls, self.mode)?;

        let path = recorded_path(&self.ctx, self.recorded_id, self.encoded_id);
        let source = tuner::open_recorded(&path, 0)
            .await
            .map_err(StreamError::SourceAcquisition)?;

        let manifest = readiness::manifest_path(&settings.stream_dir, slot);
        let cmd = process::substitute(&profile.cmd, &settings.ffmpeg_path)
            .replace("%INPUT%", &path.to_string_lossy())
            .replace("%OUTPUT%", &manifest.to_string_lossy());

        self.slot = Some(slot);
        match EncoderProcess::spawn(&cmd, slot, Some(self.ctx.slot_tx.clone())) {
            Ok(mut proc) => {
                proc.pipe_input(source);
                self.process = Some(proc);
                Ok(())
            }
            Err(err) => {
                let _ = self.stop().await;
                Err(err)
            }
        }
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(proc) = self.process.take() {
            proc.kill();
        }
        if let Some(slot) = self.slot.take() {
            readiness::remove_output(&self.ctx.settings.stream_dir, slot).await?;
        }
        Ok(())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo::RecordedHls {
            recorded_id: self.recorded_id,
            mode: self.mode,
            encoded_id: self.encoded_id,
        }
    }

    fn viewers(&self) -> ViewerCounter {
        self.viewers.clone()
    }
}

/// Recorded-file streaming with a byte-offset cursor: raw passthrough or
/// WebM/MP4 transcode depending on the container tag. Cursor-bearing, so
/// never deduplicated.
pub struct RecordedStreamSession {
    ctx: Arc<SessionContext>,
    recorded_id: RecordedId,
    mode: usize,
    container: Container,
    offset: u64,
    process: Option<EncoderProcess>,
    viewers: ViewerCounter,
    output: broadcast::Sender<Bytes>,
}

impl RecordedStreamSession {
    pub fn new(
        ctx: Arc<SessionContext>,
        recorded_id: RecordedId,
        mode: usize,
        container: Container,
        offset: u64,
    ) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            ctx,
            recorded_id,
            mode,
            container,
            offset,
            process: None,
            viewers: ViewerCounter::new(),
            output,
        }
    }
}

#[async_trait]
impl StreamSession for RecordedStreamSession {
    async fn start(&mut self, slot: usize) -> Result<(), StreamError> {
        let settings = &self.ctx.settings;
        let table = match self.container {
            Container::WebM => "recorded_webm",
            Container::Mp4 => "recorded_mp4",
            Container::MpegTs => "recorded_mpegts",
        };
        let profile =
            StreamingSettings::pick(table, settings.recorded_stream(self.container), self.mode)?;

        let path = recorded_path(&self.ctx, self.recorded_id, None);
        let source = tuner::open_recorded(&path, self.offset)
            .await
            .map_err(StreamError::SourceAcquisition)?;

        let cmd = process::substitute(&profile.cmd, &settings.ffmpeg_path);
        let mut proc = EncoderProcess::spawn(&cmd, slot, Some(self.ctx.slot_tx.clone()))?;
        proc.pipe_input(source);
        proc.broadcast_stdout(self.output.clone());
        self.process = Some(proc);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(proc) = self.process.take() {
            proc.kill();
        }
        Ok(())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo::RecordedStream {
            recorded_id: self.recorded_id,
            mode: self.mode,
            container: self.container,
        }
    }

    fn viewers(&self) -> ViewerCounter {
        self.viewers.clone()
    }

    fn subscribe_output(&self) -> Option<broadcast::Receiver<Bytes>> {
        Some(self.output.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::stub_settings;
    use crate::tuner::StubTuner;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn stub_ctx(dir: &std::path::Path) -> Arc<SessionContext> {
        let (slot_tx, _) = mpsc::unbounded_channel();
        Arc::new(SessionContext {
            settings: Arc::new(stub_settings(2, dir)),
            tuner: Arc::new(StubTuner::new()),
            slot_tx,
        })
    }

    #[tokio::test]
    async fn streams_recorded_bytes_from_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("7.m2ts"), b"skipthisdata").unwrap();
        let ctx = stub_ctx(dir.path());

        let mut session = RecordedStreamSession::new(ctx, 7, 0, Container::MpegTs, 8);
        let mut rx = session.subscribe_output().unwrap();
        session.start(0).await.unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("output before timeout")
            .expect("one chunk");
        assert_eq!(&chunk[..], b"data");
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_recording_fails_source_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stub_ctx(dir.path());

        let mut session = RecordedHlsSession::new(ctx, 404, 0, None);
        let err = session.start(0).await.unwrap_err();
        assert!(matches!(err, StreamError::SourceAcquisition(_)));
    }

    #[tokio::test]
    async fn encoded_rendition_resolves_to_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stub_ctx(dir.path());
        let path = recorded_path(&ctx, 12, Some(3));
        assert!(path.ends_with("12.enc3.mp4"));
        let path = recorded_path(&ctx, 12, None);
        assert!(path.ends_with("12.m2ts"));
    }
}
