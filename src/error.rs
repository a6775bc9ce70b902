use thiserror::Error;

/// Failures surfaced by the stream lifecycle core.
///
/// A deferred stop (viewers still attached) is deliberately *not* an error:
/// `StreamRegistry::stop` returns `Ok(())` and leaves the slot occupied.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Every one of the configured stream slots is occupied.
    #[error("all {0} stream slots are in use")]
    SlotExhausted(usize),

    /// The requested mode has no matching profile in the configuration.
    /// Checked before a slot placeholder is installed, so a start that fails
    /// this way never touches the slot table.
    #[error("no profile at index {mode} in streaming.{table}")]
    Config { table: &'static str, mode: usize },

    /// The encoder died, or shutdown began, while the session was still
    /// starting; the slot was rolled back and the session torn down.
    #[error("stream aborted during startup")]
    Aborted,

    /// The tuner or recorded file could not be opened.
    #[error("failed to acquire source stream")]
    SourceAcquisition(#[source] anyhow::Error),

    /// The external encoder process could not be spawned.
    #[error("failed to spawn encoder process")]
    Spawn(#[source] std::io::Error),
}
