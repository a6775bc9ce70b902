//! Live (broadcast) session variants. Each owns a supervised encoder
//! process fed from the tuner byte stream.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::StreamError;
use crate::process::{self, EncoderProcess};
use crate::readiness;
use crate::session::{
    ChannelId, Container, SessionContext, SessionInfo, StreamSession, ViewerCounter,
};
use crate::settings::StreamingSettings;

const OUTPUT_CHANNEL_CAPACITY: usize = 8192;

/// Push-session key: a random u32 as unpadded lowercase hex, so 1 to 8
/// characters. Callers must not assume a fixed width.
pub fn generate_stream_key() -> String {
    format!("{:x}", rand::random::<u32>())
}

/// Segmented live delivery: the encoder writes `stream{N}.m3u8` plus
/// numbered segments to the stream directory; watchability is gated by the
/// readiness detector, not by this session.
pub struct LiveHlsSession {
    ctx: Arc<SessionContext>,
    channel_id: ChannelId,
    mode: usize,
    slot: Option<usize>,
    process: Option<EncoderProcess>,
    viewers: ViewerCounter,
}

impl LiveHlsSession {
    pub fn new(ctx: Arc<SessionContext>, channel_id: ChannelId, mode: usize) -> Self {
        Self {
            ctx,
            channel_id,
            mode,
            slot: None,
            process: None,
            viewers: ViewerCounter::new(),
        }
    }
}

#[async_trait]
impl StreamSession for LiveHlsSession {
    async fn start(&mut self, slot: usize) -> Result<(), StreamError> {
        let settings = &self.ctx.settings;
        let profile = StreamingSettings::pick("live_hls", &settings.live_hls, self.mode)?;

        let source = self
            .ctx
            .tuner
            .service_stream(self.channel_id, settings.priority)
            .await
            .map_err(StreamError::SourceAcquisition)?;

        let manifest = readiness::manifest_path(&settings.stream_dir, slot);
        let cmd = process::substitute(&profile.cmd, &settings.ffmpeg_path)
            .replace("%OUTPUT%", &manifest.to_string_lossy());

        self.slot = Some(slot);
        match EncoderProcess::spawn(&cmd, slot, Some(self.ctx.slot_tx.clone())) {
            Ok(mut proc) => {
                proc.pipe_input(source);
                self.process = Some(proc);
                Ok(())
            }
            Err(err) => {
                // Undo partial work: the acquired source drops here and any
                // stale output files are removed.
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
        SessionInfo::LiveHls {
            channel_id: self.channel_id,
            mode: self.mode,
        }
    }

    fn viewers(&self) -> ViewerCounter {
        self.viewers.clone()
    }
}

/// Raw container passthrough: tuner bytes through the encoder, stdout fanned
/// out to every attached viewer.
pub struct LiveMpegTsSession {
    ctx: Arc<SessionContext>,
    channel_id: ChannelId,
    mode: usize,
    process: Option<EncoderProcess>,
    viewers: ViewerCounter,
    output: broadcast::Sender<Bytes>,
}

impl LiveMpegTsSession {
    pub fn new(ctx: Arc<SessionContext>, channel_id: ChannelId, mode: usize) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            ctx,
            channel_id,
            mode,
            process: None,
            viewers: ViewerCounter::new(),
            output,
        }
    }
}

#[async_trait]
impl StreamSession for LiveMpegTsSession {
    async fn start(&mut self, slot: usize) -> Result<(), StreamError> {
        let settings = &self.ctx.settings;
        let profile = StreamingSettings::pick("live_mpegts", &settings.live_mpegts, self.mode)?;

        let source = self
            .ctx
            .tuner
            .service_stream(self.channel_id, settings.priority)
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
        SessionInfo::LiveMpegTs {
            channel_id: self.channel_id,
            mode: self.mode,
        }
    }

    fn viewers(&self) -> ViewerCounter {
        self.viewers.clone()
    }

    fn subscribe_output(&self) -> Option<broadcast::Receiver<Bytes>> {
        Some(self.output.subscribe())
    }
}

/// Live WebM/MP4 transcode; same shape as the passthrough session but with
/// a per-container profile table.
pub struct LiveTranscodeSession {
    ctx: Arc<SessionContext>,
    channel_id: ChannelId,
    mode: usize,
    container: Container,
    process: Option<EncoderProcess>,
    viewers: ViewerCounter,
    output: broadcast::Sender<Bytes>,
}

impl LiveTranscodeSession {
    pub fn new(
        ctx: Arc<SessionContext>,
        channel_id: ChannelId,
        mode: usize,
        container: Container,
    ) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            ctx,
            channel_id,
            mode,
            container,
            process: None,
            viewers: ViewerCounter::new(),
            output,
        }
    }
}

#[async_trait]
impl StreamSession for LiveTranscodeSession {
    async fn start(&mut self, slot: usize) -> Result<(), StreamError> {
        let settings = &self.ctx.settings;
        let table = match self.container {
            Container::WebM => "live_webm",
            Container::Mp4 => "live_mp4",
            Container::MpegTs => "live_mpegts",
        };
        let profile =
            StreamingSettings::pick(table, settings.live_transcode(self.container), self.mode)?;

        let source = self
            .ctx
            .tuner
            .service_stream(self.channel_id, settings.priority)
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
        SessionInfo::LiveTranscode {
            channel_id: self.channel_id,
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

/// Push delivery: the encoder sends outward to an RTMP ingest URL derived
/// from the generated stream key; there is no local output to consume.
pub struct RtmpLiveSession {
    ctx: Arc<SessionContext>,
    channel_id: ChannelId,
    mode: usize,
    stream_key: String,
    process: Option<EncoderProcess>,
    viewers: ViewerCounter,
}

impl RtmpLiveSession {
    pub fn new(ctx: Arc<SessionContext>, channel_id: ChannelId, mode: usize) -> Self {
        Self {
            ctx,
            channel_id,
            mode,
            stream_key: generate_stream_key(),
            process: None,
            viewers: ViewerCounter::new(),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

#[async_trait]
impl StreamSession for RtmpLiveSession {
    async fn start(&mut self, slot: usize) -> Result<(), StreamError> {
        let settings = &self.ctx.settings;
        let profile = StreamingSettings::pick("live_rtmp", &settings.live_rtmp, self.mode)?;

        let source = self
            .ctx
            .tuner
            .service_stream(self.channel_id, settings.priority)
            .await
            .map_err(StreamError::SourceAcquisition)?;

        let rtmp_url = profile.url.replace("%STREAM_KEY%", &self.stream_key);
        let cmd = process::substitute(&profile.cmd, &settings.ffmpeg_path)
            .replace("%RTMP_URL%", &rtmp_url);

        let mut proc = EncoderProcess::spawn(&cmd, slot, Some(self.ctx.slot_tx.clone()))?;
        proc.pipe_input(source);
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
        SessionInfo::RtmpLive {
            channel_id: self.channel_id,
            mode: self.mode,
            stream_key: self.stream_key.clone(),
        }
    }

    fn viewers(&self) -> ViewerCounter {
        self.viewers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::stub_settings;
    use crate::tuner::StubTuner;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn stub_ctx(dir: &std::path::Path) -> (Arc<SessionContext>, Arc<StubTuner>) {
        // The receiver is dropped; death/release signals are ignored here.
        let (slot_tx, _) = mpsc::unbounded_channel();
        let tuner = Arc::new(StubTuner::new());
        let ctx = Arc::new(SessionContext {
            settings: Arc::new(stub_settings(2, dir)),
            tuner: Arc::clone(&tuner) as Arc<dyn crate::tuner::TunerClient>,
            slot_tx,
        });
        (ctx, tuner)
    }

    #[test]
    fn stream_key_is_short_unpadded_hex() {
        for _ in 0..64 {
            let key = generate_stream_key();
            assert!((1..=8).contains(&key.len()), "unexpected key {key:?}");
            assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[tokio::test]
    async fn mpegts_session_starts_and_exposes_output() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, tuner) = stub_ctx(dir.path());

        let mut session = LiveMpegTsSession::new(ctx, 10, 0);
        session.start(0).await.unwrap();
        assert!(session.subscribe_output().is_some());
        assert_eq!(tuner.acquisitions.load(Ordering::SeqCst), 1);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bad_mode_fails_before_touching_the_tuner() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, tuner) = stub_ctx(dir.path());

        let mut session = LiveHlsSession::new(ctx, 10, 9);
        let err = session.start(0).await.unwrap_err();
        assert!(matches!(err, StreamError::Config { table: "live_hls", mode: 9 }));
        assert_eq!(tuner.acquisitions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hls_stop_removes_slot_output_files() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tuner) = stub_ctx(dir.path());

        let mut session = LiveHlsSession::new(ctx, 10, 0);
        session.start(1).await.unwrap();

        std::fs::write(dir.path().join("stream1.m3u8"), "#EXTM3U").unwrap();
        std::fs::write(dir.path().join("stream1-000.ts"), "x").unwrap();
        std::fs::write(dir.path().join("stream0.m3u8"), "#EXTM3U").unwrap();

        session.stop().await.unwrap();
        // A second stop must be a harmless no-op.
        session.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!dir.path().join("stream1.m3u8").exists());
        assert!(!dir.path().join("stream1-000.ts").exists());
        assert!(dir.path().join("stream0.m3u8").exists(), "other slots untouched");
    }

    #[tokio::test]
    async fn rtmp_info_carries_the_generated_key() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tuner) = stub_ctx(dir.path());

        let session = RtmpLiveSession::new(ctx, 27, 0);
        let key = session.stream_key().to_string();
        match session.info() {
            SessionInfo::RtmpLive { channel_id, mode, stream_key } => {
                assert_eq!(channel_id, 27);
                assert_eq!(mode, 0);
                assert_eq!(stream_key, key);
            }
            other => panic!("unexpected info {other:?}"),
        }
    }
}
