use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::session::SlotMessage;

const STDERR_RING_LINES: usize = 50;

/// Supervised external encoder process.
///
/// The child itself is owned by a background supervisor task; the handle only
/// carries the pipes and a stop signal. `kill` is therefore safe to call any
/// number of times and safe on a process that already exited on its own.
pub struct EncoderProcess {
    stop_tx: watch::Sender<bool>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    slot: usize,
}

impl EncoderProcess {
    /// Spawns `command` (already template-substituted) with all three stdio
    /// pipes attached. When the child exits without a stop having been
    /// requested, `exit_tx` receives `SlotMessage::Died(slot)` exactly once.
    pub fn spawn(
        command: &str,
        slot: usize,
        exit_tx: Option<mpsc::UnboundedSender<SlotMessage>>,
    ) -> Result<Self, StreamError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            StreamError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty encoder command",
            ))
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(StreamError::Spawn)?;

        if let Some(pid) = child.id() {
            info!("encoder spawned: slot={} pid={} cmd={}", slot, pid, program);
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        // Rolling buffer of stderr lines so an unexpected exit can be logged
        // with context, without spamming the log while the encoder runs.
        let stderr_ring: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let ring = Arc::clone(&stderr_ring);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buffer = String::new();
                while let Ok(n) = reader.read_line(&mut buffer).await {
                    if n == 0 {
                        break;
                    }
                    let line = buffer.trim().to_string();
                    {
                        let mut ring = ring.lock().await;
                        if ring.len() >= STDERR_RING_LINES {
                            ring.pop_front();
                        }
                        ring.push_back(line.clone());
                    }
                    // Run with `RUST_LOG=tvgate::process=debug` to see it.
                    debug!("encoder: {}", line);
                    buffer.clear();
                }
            });
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            let status = tokio::select! {
                _ = stop_rx.changed() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
                status = child.wait() => status,
            };
            let stop_requested = *stop_rx.borrow();

            match status {
                Ok(status) if stop_requested => {
                    info!("encoder stopped (requested): slot={} status={}", slot, status);
                }
                Ok(status) => {
                    let ring = stderr_ring.lock().await;
                    if ring.is_empty() {
                        warn!("encoder exited unexpectedly: slot={} status={}", slot, status);
                    } else {
                        warn!(
                            "encoder exited unexpectedly: slot={} status={} last_stderr_lines=\n{}",
                            slot,
                            status,
                            ring.iter().cloned().collect::<Vec<_>>().join("\n")
                        );
                    }
                    if let Some(tx) = &exit_tx {
                        let _ = tx.send(SlotMessage::Died(slot));
                    }
                }
                Err(err) => {
                    warn!("encoder wait() failed: slot={} err={}", slot, err);
                    if let Some(tx) = &exit_tx {
                        let _ = tx.send(SlotMessage::Died(slot));
                    }
                }
            }
        });

        Ok(Self {
            stop_tx,
            stdin,
            stdout,
            slot,
        })
    }

    /// Cooperatively copies an upstream byte source into the child's stdin.
    /// The copy task ends on source EOF or when the child closes its pipe;
    /// dropping the source releases it.
    pub fn pipe_input<R>(&mut self, mut source: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(mut stdin) = self.stdin.take() else {
            return;
        };
        let slot = self.slot;
        tokio::spawn(async move {
            match tokio::io::copy(&mut source, &mut stdin).await {
                Ok(bytes) => debug!("input pipe finished: slot={} bytes={}", slot, bytes),
                Err(err) => debug!("input pipe closed: slot={} err={}", slot, err),
            }
        });
    }

    /// Fans the child's stdout out to broadcast subscribers in 64 KiB reads.
    pub fn broadcast_stdout(&mut self, tx: broadcast::Sender<Bytes>) {
        let Some(mut stdout) = self.stdout.take() else {
            return;
        };
        let slot = self.slot;
        tokio::spawn(async move {
            let mut buffer = [0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buffer).await {
                    Ok(0) => {
                        debug!("encoder output ended: slot={}", slot);
                        break;
                    }
                    Ok(n) => {
                        // No receivers is fine; the fan-out keeps draining.
                        let _ = tx.send(Bytes::copy_from_slice(&buffer[..n]));
                    }
                    Err(err) => {
                        warn!("error reading encoder output: slot={} err={}", slot, err);
                        break;
                    }
                }
            }
        });
    }

    /// Requests termination. Idempotent; a no-op if the child already exited.
    pub fn kill(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Applies the pure string substitutions every command template supports.
pub fn substitute(template: &str, ffmpeg_path: &str) -> String {
    template.replace("%FFMPEG%", ffmpeg_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pipes_input_through_to_broadcast_output() {
        let mut process = EncoderProcess::spawn("cat", 0, None).unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        process.broadcast_stdout(tx);
        process.pipe_input(std::io::Cursor::new(b"slot data".to_vec()));

        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("output before timeout")
            .expect("one chunk");
        assert_eq!(&chunk[..], b"slot data");
        process.kill();
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_safe_after_exit() {
        let process = EncoderProcess::spawn("true", 1, None).unwrap();
        // Give the child time to exit on its own.
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.kill();
        process.kill();
    }

    #[tokio::test]
    async fn unexpected_exit_signals_the_slot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _process = EncoderProcess::spawn("true", 3, Some(tx)).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("exit signal before timeout")
            .expect("channel open");
        assert_eq!(msg, SlotMessage::Died(3));
    }

    #[tokio::test]
    async fn requested_stop_does_not_signal_death() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Keep `tx` alive so the channel only yields an actual death message,
        // not a close when the supervisor task finishes.
        let process = EncoderProcess::spawn("cat", 4, Some(tx.clone())).unwrap();
        process.kill();
        let signal = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(signal.is_err(), "requested stop must not report a death");
    }

    #[test]
    fn spawn_rejects_empty_command() {
        assert!(matches!(
            EncoderProcess::spawn("", 0, None),
            Err(StreamError::Spawn(_))
        ));
    }
}
