//! Error types shared between every stage of the task pipeline.

/// Result type alias used throughout this crate and the client binary.
pub type Result<T> = anyhow::Result<T>;

/// Failure categories surfaced by the bounded local queues, the remote queue
/// endpoint, and task execution.
///
/// FSMs match on this enum to decide whether to self-loop, halt, or record a
/// failed task and carry on; `main` only ever sees it wrapped in an
/// [`anyhow::Error`] via the [`Result`] alias above.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A `get` on a bounded local queue timed out with nothing available.
    #[error("queue empty after waiting {0:?}")]
    Empty(std::time::Duration),

    /// A `put` on a bounded local queue timed out because it stayed at capacity.
    #[error("queue full after waiting {0:?}")]
    Full(std::time::Duration),

    /// The remote queue endpoint closed the connection or sent the disconnect sentinel.
    #[error("remote queue disconnected")]
    Disconnected,

    /// The shared secret was rejected, or the server refused the connection outright.
    #[error("authentication with remote queue failed: {0}")]
    Auth(String),

    /// The child process for a task could not be spawned at all.
    #[error("failed to spawn task {task_id}: {source}")]
    Spawn {
        task_id: String,
        #[source]
        source: std::io::Error,
    },

    /// A bundle arrived on the wire in a shape the codec does not accept.
    #[error("malformed bundle on wire: {0}")]
    Protocol(String),
}
