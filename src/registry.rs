use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::StreamError;
use crate::metrics;
use crate::readiness;
use crate::session::{
    SessionContext, SlotMessage, SlotSnapshot, StreamSession, ViewerCounter,
};
use crate::settings::StreamingSettings;
use crate::tuner::TunerClient;

/// Pushes "stream state changed" notifications to subscribers (the socket
/// layer in front of us). Fire-and-forget; nobody listening is fine.
#[derive(Clone)]
pub struct StreamNotifier {
    tx: broadcast::Sender<()>,
}

impl StreamNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn notify(&self) {
        let _ = self.tx.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for StreamNotifier {
    fn default() -> Self {
        Self::new()
    }
}

struct SlotStatus {
    enabled: bool,
    /// Set when a stop request (process death, shutdown) arrives while the
    /// slot still holds the start placeholder. The in-flight start observes
    /// the flag at install time and tears the session down instead.
    doomed: bool,
    /// `None` while a start is in flight: the placeholder keeps the slot
    /// reserved across the session's own (suspending) startup work.
    session: Option<Box<dyn StreamSession>>,
}

/// Fixed-capacity table of concurrent streaming sessions.
///
/// The table is the only shared mutable state of the stream core and is
/// guarded by a single mutex covering every read-modify-write sequence. Slot
/// selection and placeholder installation happen under one lock acquisition,
/// so two concurrent starts can never pick the same free slot. Sessions never
/// touch the table; they signal over the slot channel instead.
pub struct StreamRegistry {
    slots: Mutex<Vec<Option<SlotStatus>>>,
    max_streams: usize,
    notifier: StreamNotifier,
    ctx: Arc<SessionContext>,
    weak: Weak<StreamRegistry>,
}

impl StreamRegistry {
    pub fn new(settings: Arc<StreamingSettings>, tuner: Arc<dyn TunerClient>) -> Arc<Self> {
        let (slot_tx, mut slot_rx) = mpsc::unbounded_channel();
        let max_streams = settings.max_streams;

        Arc::new_cyclic(|weak: &Weak<Self>| {
            // Reconciliation task: sessions (and viewer guards) send one-way
            // signals here rather than reaching into the slot table.
            let drain = weak.clone();
            tokio::spawn(async move {
                while let Some(msg) = slot_rx.recv().await {
                    let Some(registry) = drain.upgrade() else {
                        break;
                    };
                    match msg {
                        SlotMessage::Died(slot) => {
                            warn!("stream process died: slot={}", slot);
                            registry.force_stop(slot).await;
                        }
                        SlotMessage::Release(slot) => {
                            if let Err(err) = registry.stop(slot).await {
                                warn!("stop after release failed: slot={} err={:#}", slot, err);
                            }
                        }
                    }
                }
            });

            let ctx = Arc::new(SessionContext {
                settings,
                tuner,
                slot_tx,
            });

            Self {
                slots: Mutex::new((0..max_streams).map(|_| None).collect()),
                max_streams,
                notifier: StreamNotifier::new(),
                ctx,
                weak: weak.clone(),
            }
        })
    }

    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    pub fn notifier(&self) -> StreamNotifier {
        self.notifier.clone()
    }

    pub fn capacity(&self) -> usize {
        self.max_streams
    }

    /// Starts `session` in the lowest free slot and returns its number.
    ///
    /// The placeholder is installed before the first await, and a failed
    /// `session.start` removes it again: a failed start never leaks a slot
    /// or an orphaned process (the session undoes its own partial work).
    /// A forced stop arriving while the start is in flight dooms the
    /// placeholder; the install path then fails with [`StreamError::Aborted`]
    /// instead of keeping a session whose process is already gone.
    pub async fn start(&self, mut session: Box<dyn StreamSession>) -> Result<usize, StreamError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .iter()
                .position(|status| status.is_none())
                .ok_or(StreamError::SlotExhausted(self.max_streams))?;
            slots[slot] = Some(SlotStatus {
                enabled: false,
                doomed: false,
                session: None,
            });
            slot
        };

        if let Err(err) = session.start(slot).await {
            error!("start stream failed: slot={} err={}", slot, err);
            let mut slots = self.slots.lock().await;
            slots[slot] = None;
            return Err(err);
        }

        let info = session.info();
        let segmented = info.is_segmented();
        let mut session = Some(session);
        let doomed = {
            let mut slots = self.slots.lock().await;
            if slots[slot].as_ref().is_some_and(|status| status.doomed) {
                slots[slot] = None;
                true
            } else {
                slots[slot] = Some(SlotStatus {
                    enabled: !segmented,
                    doomed: false,
                    session: session.take(),
                });
                false
            }
        };

        // The process died (or shutdown began) while this start was in
        // flight; the one-shot death signal already hit the placeholder, so
        // reconcile here instead of installing a dead session.
        if doomed {
            warn!("stream aborted during startup: slot={}", slot);
            if let Some(mut session) = session {
                if let Err(err) = session.stop().await {
                    warn!("teardown after aborted start failed: slot={} err={:#}", slot, err);
                }
            }
            return Err(StreamError::Aborted);
        }

        if segmented {
            // Watchable only once enough segment output exists on disk.
            readiness::watch(
                self.weak.clone(),
                slot,
                self.ctx.settings.stream_dir.clone(),
            );
        }

        info!("start stream: slot={} info={:?}", slot, info);
        metrics::record_stream_start(info.kind());
        self.update_metrics().await;
        self.notifier.notify();
        Ok(slot)
    }

    /// Stops the session in `slot` and frees it.
    ///
    /// A no-op when the slot is empty, still starting, or has viewers
    /// attached; in the last case the actual stop is deferred to whoever
    /// releases the final viewer.
    pub async fn stop(&self, slot: usize) -> anyhow::Result<()> {
        let mut session = {
            let mut slots = self.slots.lock().await;
            let Some(entry) = slots.get_mut(slot) else {
                return Ok(());
            };
            {
                let Some(status) = entry.as_ref() else {
                    return Ok(());
                };
                let Some(session) = status.session.as_ref() else {
                    return Ok(());
                };
                if session.viewers().get() > 0 {
                    return Ok(());
                }
            }
            match entry.take() {
                Some(SlotStatus {
                    session: Some(session),
                    ..
                }) => session,
                _ => return Ok(()),
            }
        };

        let result = session.stop().await;
        info!("stop stream: slot={}", slot);
        self.update_metrics().await;
        self.notifier.notify();
        result
    }

    /// Overrides the viewer count and stops the slot; used when a session's
    /// process has died underneath it and by shutdown.
    ///
    /// A slot still holding the start placeholder is marked doomed instead:
    /// the in-flight start observes the flag at install time and tears the
    /// session down itself.
    pub async fn force_stop(&self, slot: usize) {
        {
            let mut slots = self.slots.lock().await;
            if let Some(status) = slots.get_mut(slot).and_then(|s| s.as_mut()) {
                match &status.session {
                    Some(session) => session.viewers().reset(),
                    None => {
                        status.doomed = true;
                        return;
                    }
                }
            }
        }
        if let Err(err) = self.stop(slot).await {
            error!("forced stop failed: slot={} err={:#}", slot, err);
        }
    }

    /// Best-effort shutdown of every occupied slot. Per-slot failures are
    /// logged and never abort the sweep. Placeholder-only slots belong to an
    /// in-flight start; they are marked doomed so that start's install path
    /// stops the session immediately.
    pub async fn forced_stop_all(&self) {
        info!("force stop all streams");
        for slot in 0..self.max_streams {
            let has_session = {
                let mut slots = self.slots.lock().await;
                match slots.get_mut(slot).and_then(|s| s.as_mut()) {
                    Some(status) => match &status.session {
                        Some(session) => {
                            session.viewers().reset();
                            true
                        }
                        None => {
                            status.doomed = true;
                            false
                        }
                    },
                    None => false,
                }
            };
            if !has_session {
                continue;
            }
            if let Err(err) = self.stop(slot).await {
                error!("forced stop failed: slot={} err={:#}", slot, err);
            }
        }
    }

    /// Readiness callback: marks a segmented slot watchable. The flag never
    /// reverts while the session is active.
    pub async fn enable(&self, slot: usize) {
        {
            let mut slots = self.slots.lock().await;
            let Some(status) = slots.get_mut(slot).and_then(|s| s.as_mut()) else {
                return;
            };
            if status.session.is_none() || status.enabled {
                return;
            }
            status.enabled = true;
        }
        info!("enable stream: slot={}", slot);
        self.notifier.notify();
    }

    /// Whether the slot is occupied at all (placeholder included).
    pub async fn contains(&self, slot: usize) -> bool {
        let slots = self.slots.lock().await;
        slots.get(slot).map(|s| s.is_some()).unwrap_or(false)
    }

    pub async fn occupied_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.iter().filter(|s| s.is_some()).count()
    }

    /// Snapshot of one slot, or `None` when it holds no running session.
    pub async fn info(&self, slot: usize) -> Option<SlotSnapshot> {
        let slots = self.slots.lock().await;
        let status = slots.get(slot)?.as_ref()?;
        let session = status.session.as_ref()?;
        Some(SlotSnapshot {
            slot_number: slot,
            is_enabled: status.enabled,
            viewer_count: session.viewers().get(),
            info: Some(session.info()),
        })
    }

    /// Snapshot of the full table. Empty and still-starting slots are
    /// reported as disabled placeholders so numbering stays contiguous.
    pub async fn infos(&self) -> Vec<SlotSnapshot> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .enumerate()
            .map(|(slot, status)| {
                match status.as_ref().and_then(|s| s.session.as_ref().map(|sess| (s, sess))) {
                    Some((status, session)) => SlotSnapshot {
                        slot_number: slot,
                        is_enabled: status.enabled,
                        viewer_count: session.viewers().get(),
                        info: Some(session.info()),
                    },
                    None => SlotSnapshot::empty(slot),
                }
            })
            .collect()
    }

    /// Clone of the slot's viewer counter for the caller layer; counting the
    /// reused-session case is its responsibility, not the registry's.
    pub async fn viewer_handle(&self, slot: usize) -> Option<ViewerCounter> {
        let slots = self.slots.lock().await;
        let status = slots.get(slot)?.as_ref()?;
        Some(status.session.as_ref()?.viewers())
    }

    /// Attaches a counted viewer to the slot. Dropping the guard releases the
    /// viewer and asks the registry for a (deferrable) stop.
    pub async fn guard(&self, slot: usize) -> Option<ViewerGuard> {
        let counter = self.viewer_handle(slot).await?;
        counter.increment();
        Some(ViewerGuard {
            slot,
            counter,
            release_tx: self.ctx.slot_tx.clone(),
        })
    }

    /// Encoder output fan-out for pull-delivery slots.
    pub async fn subscribe_output(&self, slot: usize) -> Option<broadcast::Receiver<Bytes>> {
        let slots = self.slots.lock().await;
        let status = slots.get(slot)?.as_ref()?;
        status.session.as_ref()?.subscribe_output()
    }

    async fn update_metrics(&self) {
        metrics::set_active_streams(self.occupied_count().await as i64);
    }
}

/// Live viewer attachment. Dropping it decrements the counter and signals the
/// registry to attempt a stop, which is a no-op while other viewers remain.
pub struct ViewerGuard {
    slot: usize,
    counter: ViewerCounter,
    release_tx: mpsc::UnboundedSender<SlotMessage>,
}

impl ViewerGuard {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let remaining = self.counter.decrement();
        info!("viewer detached: slot={} viewer_count={}", self.slot, remaining);
        let _ = self.release_tx.send(SlotMessage::Release(self.slot));
    }
}
