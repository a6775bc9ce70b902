use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::error::StreamError;
use crate::settings::StreamingSettings;
use crate::tuner::TunerClient;

pub type ChannelId = u64;
pub type RecordedId = u64;
pub type EncodedId = u64;

/// Output container for the multi-container delivery types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    WebM,
    Mp4,
    MpegTs,
}

/// Immutable session descriptor used for deduplication and status reports.
///
/// One variant per delivery type, carrying only the fields valid for it.
/// Mutable runtime state (viewer count, enable flag) deliberately lives
/// elsewhere so descriptors can be compared directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionInfo {
    LiveHls {
        channel_id: ChannelId,
        mode: usize,
    },
    LiveMpegTs {
        channel_id: ChannelId,
        mode: usize,
    },
    LiveTranscode {
        channel_id: ChannelId,
        mode: usize,
        container: Container,
    },
    RtmpLive {
        channel_id: ChannelId,
        mode: usize,
        stream_key: String,
    },
    RecordedHls {
        recorded_id: RecordedId,
        mode: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        encoded_id: Option<EncodedId>,
    },
    RecordedStream {
        recorded_id: RecordedId,
        mode: usize,
        container: Container,
    },
}

impl SessionInfo {
    /// Segmented sessions produce a manifest plus numbered segment files and
    /// only become watchable once the readiness detector enables them.
    pub fn is_segmented(&self) -> bool {
        matches!(self, SessionInfo::LiveHls { .. } | SessionInfo::RecordedHls { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionInfo::LiveHls { .. } => "live_hls",
            SessionInfo::LiveMpegTs { .. } => "live_mpegts",
            SessionInfo::LiveTranscode { .. } => "live_transcode",
            SessionInfo::RtmpLive { .. } => "rtmp_live",
            SessionInfo::RecordedHls { .. } => "recorded_hls",
            SessionInfo::RecordedStream { .. } => "recorded_stream",
        }
    }
}

/// Shared, never-negative viewer reference counter.
#[derive(Clone, Default)]
pub struct ViewerCounter(Arc<AtomicU32>);

impl ViewerCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    /// Saturating decrement; a stray double-release must not underflow.
    pub fn decrement(&self) -> u32 {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Used only by forced stop to bypass the deferred-stop guard.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Signal from a session (or a viewer handle) back to the registry. Sessions
/// never reach into the slot table themselves; the registry owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMessage {
    /// The external process died while the session was active; the slot must
    /// be reconciled with a forced stop.
    Died(usize),
    /// A viewer detached; the registry should attempt a regular (deferrable)
    /// stop of the slot.
    Release(usize),
}

/// Everything a session needs to acquire its source and spawn its encoder.
pub struct SessionContext {
    pub settings: Arc<StreamingSettings>,
    pub tuner: Arc<dyn TunerClient>,
    pub slot_tx: mpsc::UnboundedSender<SlotMessage>,
}

/// One unit of stream delivery occupying a registry slot.
///
/// Lifecycle: constructed idle, `start(slot)` acquires the source and spawns
/// the encoder (undoing partial work on failure), `stop` is idempotent and
/// releases everything. The process handle is held iff the session is active.
#[async_trait]
pub trait StreamSession: Send {
    async fn start(&mut self, slot: usize) -> Result<(), StreamError>;

    async fn stop(&mut self) -> anyhow::Result<()>;

    fn info(&self) -> SessionInfo;

    fn viewers(&self) -> ViewerCounter;

    /// Encoder stdout fan-out for pull-delivery types; `None` for sessions
    /// that write to disk or push outward.
    fn subscribe_output(&self) -> Option<broadcast::Receiver<Bytes>> {
        None
    }
}

/// Point-in-time view of one slot. Empty slots are reported as a disabled,
/// zero-viewer placeholder so slot numbering stays stable for callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub slot_number: usize,
    pub is_enabled: bool,
    pub viewer_count: u32,
    #[serde(flatten)]
    pub info: Option<SessionInfo>,
}

impl SlotSnapshot {
    pub fn empty(slot_number: usize) -> Self {
        Self {
            slot_number,
            is_enabled: false,
            viewer_count: 0,
            info: None,
        }
    }
}
