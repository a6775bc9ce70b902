//! Request-level facade over the slot registry: reuses an equivalent running
//! session where one exists, otherwise starts a fresh one.

use std::sync::Arc;

use tracing::info;

use crate::error::StreamError;
use crate::live::{LiveHlsSession, LiveMpegTsSession, LiveTranscodeSession, RtmpLiveSession};
use crate::recorded::{RecordedHlsSession, RecordedStreamSession};
use crate::registry::StreamRegistry;
use crate::session::{ChannelId, Container, EncodedId, RecordedId, SessionInfo, SlotSnapshot};

/// Slot plus the publish key a source must use to feed it.
#[derive(Debug, Clone)]
pub struct RtmpHandle {
    pub slot: usize,
    pub stream_key: String,
}

pub struct StreamsApi {
    registry: Arc<StreamRegistry>,
}

impl StreamsApi {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Slot already serving the same channel and profile, if any. Only
    /// cursor-free session kinds are eligible for reuse.
    async fn find_existing<F>(&self, matches: F) -> Option<SlotSnapshot>
    where
        F: Fn(&SessionInfo) -> bool,
    {
        self.registry
            .infos()
            .await
            .into_iter()
            .find(|snapshot| snapshot.info.as_ref().is_some_and(&matches))
    }

    pub async fn live_hls(&self, channel_id: ChannelId, mode: usize) -> Result<usize, StreamError> {
        if let Some(existing) = self
            .find_existing(|info| {
                matches!(info, SessionInfo::LiveHls { channel_id: c, mode: m }
                    if *c == channel_id && *m == mode)
            })
            .await
        {
            info!(
                "reusing hls stream: slot={} channel={}",
                existing.slot_number, channel_id
            );
            return Ok(existing.slot_number);
        }

        let session = LiveHlsSession::new(self.registry.context(), channel_id, mode);
        self.registry.start(Box::new(session)).await
    }

    pub async fn live_mpegts(
        &self,
        channel_id: ChannelId,
        mode: usize,
    ) -> Result<usize, StreamError> {
        if let Some(existing) = self
            .find_existing(|info| {
                matches!(info, SessionInfo::LiveMpegTs { channel_id: c, mode: m }
                    if *c == channel_id && *m == mode)
            })
            .await
        {
            info!(
                "reusing mpegts stream: slot={} channel={}",
                existing.slot_number, channel_id
            );
            return Ok(existing.slot_number);
        }

        let session = LiveMpegTsSession::new(self.registry.context(), channel_id, mode);
        self.registry.start(Box::new(session)).await
    }

    /// Transcoded live delivery carries a per-client container choice, so each
    /// request gets its own session.
    pub async fn live_transcode(
        &self,
        channel_id: ChannelId,
        mode: usize,
        container: Container,
    ) -> Result<usize, StreamError> {
        let session = LiveTranscodeSession::new(self.registry.context(), channel_id, mode, container);
        self.registry.start(Box::new(session)).await
    }

    pub async fn rtmp_live(
        &self,
        channel_id: ChannelId,
        mode: usize,
    ) -> Result<RtmpHandle, StreamError> {
        if let Some(existing) = self
            .find_existing(|info| {
                matches!(info, SessionInfo::RtmpLive { channel_id: c, mode: m, .. }
                    if *c == channel_id && *m == mode)
            })
            .await
        {
            if let Some(SessionInfo::RtmpLive { stream_key, .. }) = existing.info {
                info!(
                    "reusing rtmp stream: slot={} channel={}",
                    existing.slot_number, channel_id
                );
                return Ok(RtmpHandle {
                    slot: existing.slot_number,
                    stream_key,
                });
            }
        }

        let session = RtmpLiveSession::new(self.registry.context(), channel_id, mode);
        let stream_key = session.stream_key().to_owned();
        let slot = self.registry.start(Box::new(session)).await?;
        Ok(RtmpHandle { slot, stream_key })
    }

    pub async fn recorded_hls(
        &self,
        recorded_id: RecordedId,
        mode: usize,
        encoded_id: Option<EncodedId>,
    ) -> Result<usize, StreamError> {
        let session = RecordedHlsSession::new(self.registry.context(), recorded_id, mode, encoded_id);
        self.registry.start(Box::new(session)).await
    }

    /// Offset is a byte position into the recording, so sessions are never
    /// shared between clients.
    pub async fn recorded_stream(
        &self,
        recorded_id: RecordedId,
        mode: usize,
        container: Container,
        offset: u64,
    ) -> Result<usize, StreamError> {
        let session =
            RecordedStreamSession::new(self.registry.context(), recorded_id, mode, container, offset);
        self.registry.start(Box::new(session)).await
    }

    pub async fn stop(&self, slot: usize) -> anyhow::Result<()> {
        self.registry.stop(slot).await
    }

    pub async fn forced_stop_all(&self) {
        self.registry.forced_stop_all().await;
    }

    pub async fn infos(&self) -> Vec<SlotSnapshot> {
        self.registry.infos().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::stub_settings;
    use crate::tuner::StubTuner;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_api(max_streams: usize, dir: &std::path::Path) -> (StreamsApi, Arc<StubTuner>) {
        let tuner = Arc::new(StubTuner::new());
        let registry = StreamRegistry::new(
            Arc::new(stub_settings(max_streams, dir)),
            tuner.clone() as Arc<dyn crate::tuner::TunerClient>,
        );
        (StreamsApi::new(registry), tuner)
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn same_channel_and_mode_reuses_the_running_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (api, tuner) = test_api(2, dir.path());

        let first = api.live_mpegts(10, 0).await.unwrap();
        assert_eq!(tuner.acquisitions(), 1);

        let second = api.live_mpegts(10, 0).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(tuner.acquisitions(), 1, "reuse must not touch the tuner");
    }

    #[tokio::test]
    async fn different_mode_or_channel_gets_its_own_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (api, _) = test_api(3, dir.path());

        let a = api.live_mpegts(10, 0).await.unwrap();
        let b = api.live_mpegts(10, 1).await.unwrap();
        let c = api.live_mpegts(20, 0).await.unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[tokio::test]
    async fn exhaustion_recovers_once_viewers_release_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (api, tuner) = test_api(2, dir.path());

        let a = api.live_mpegts(10, 0).await.unwrap();
        assert_eq!(a, 0);
        let guard_a = api.registry().guard(a).await.unwrap();

        let b = api.live_mpegts(10, 0).await.unwrap();
        assert_eq!(b, 0);
        assert_eq!(tuner.acquisitions(), 1);

        let c = api.live_mpegts(20, 0).await.unwrap();
        assert_eq!(c, 1);
        let guard_c = api.registry().guard(c).await.unwrap();

        let err = api.live_mpegts(30, 0).await.unwrap_err();
        assert!(matches!(err, StreamError::SlotExhausted(2)));

        drop(guard_a);
        drop(guard_c);
        let registry = Arc::clone(api.registry());
        wait_until(move || {
            let registry = Arc::clone(&registry);
            async move { registry.occupied_count().await == 0 }
        })
        .await;

        let d = api.live_mpegts(30, 0).await.unwrap();
        assert_eq!(d, 0);
    }

    #[tokio::test]
    async fn rtmp_reuse_hands_back_the_original_key() {
        let dir = tempfile::tempdir().unwrap();
        let (api, _) = test_api(2, dir.path());

        let first = api.rtmp_live(5, 0).await.unwrap();
        let second = api.rtmp_live(5, 0).await.unwrap();
        assert_eq!(second.slot, first.slot);
        assert_eq!(second.stream_key, first.stream_key);
    }

    #[tokio::test]
    async fn transcode_requests_are_never_shared() {
        let dir = tempfile::tempdir().unwrap();
        let (api, _) = test_api(2, dir.path());

        let a = api.live_transcode(10, 0, Container::WebM).await.unwrap();
        let b = api.live_transcode(10, 0, Container::WebM).await.unwrap();
        assert_ne!(a, b);
    }
}
