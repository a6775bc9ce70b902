use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;

use tracing::{debug, warn};

use crate::registry::StreamRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_SEGMENTS: usize = 3;

/// Polls the segment output directory until the slot's manifest plus at
/// least three segment files exist, then enables the slot.
///
/// The poller holds only a weak registry reference and checks slot occupancy
/// on every tick, so it terminates itself when the session is stopped (or the
/// registry torn down) before readiness was ever reached.
pub fn watch(registry: Weak<StreamRegistry>, slot: usize, dir: PathBuf) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        // The first tick fires immediately; skip it so the encoder gets one
        // interval of head start before the first scan.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(registry) = registry.upgrade() else {
                return;
            };
            if !registry.contains(slot).await {
                debug!("readiness poller: slot {} gone, stopping", slot);
                return;
            }

            match scan(&dir, slot).await {
                Ok(true) => {
                    registry.enable(slot).await;
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    // An unreadable output directory means the session can
                    // never become watchable; reconcile by force-stopping.
                    warn!("readiness scan failed: slot={} err={}", slot, err);
                    registry.force_stop(slot).await;
                    return;
                }
            }
        }
    });
}

/// Manifest location for a slot; the slot number is embedded in the filename
/// so the scan (and clients) can tell concurrent sessions apart.
pub fn manifest_path(dir: &Path, slot: usize) -> PathBuf {
    dir.join(format!("stream{slot}.m3u8"))
}

/// Removes every output file the slot's encoder produced. Matching is
/// boundary-exact: `stream1` must never delete `stream10`'s live output.
pub async fn remove_output(dir: &Path, slot: usize) -> std::io::Result<()> {
    let manifest = format!("stream{slot}.m3u8");
    let segment_prefix = format!("stream{slot}-");
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let matches = entry
            .file_name()
            .to_str()
            .map(|name| name == manifest || name.starts_with(&segment_prefix))
            .unwrap_or(false);
        if matches {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

/// One directory scan: true when `stream{slot}`'s manifest and at least
/// [`MIN_SEGMENTS`] of its segment files are present. Only presence and
/// count are inspected, never segment content.
async fn scan(dir: &Path, slot: usize) -> std::io::Result<bool> {
    let prefix = format!("stream{slot}");
    let mut manifest = false;
    let mut segments = 0;

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        if name.ends_with(".m3u8") {
            manifest = true;
        } else {
            segments += 1;
        }
    }

    Ok(manifest && segments >= MIN_SEGMENTS)
}
