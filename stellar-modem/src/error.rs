use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by [`ResilientStream`](crate::stream::ResilientStream).
#[derive(Debug, Error)]
pub enum StreamError {
    /// The endpoint could not be dialed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// The service rejected or aborted the call.
    #[error("stream rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The handshake could not be written to a freshly opened stream.
    #[error("failed to send stream handshake")]
    Handshake,

    /// The server ended the stream without an error status.
    #[error("stream ended by server")]
    EndOfStream,

    /// Reconnecting kept failing until the retry budget ran out. Terminal
    /// for the stream that reports it.
    #[error("gave up reconnecting after {attempts} attempts over {elapsed:?}: {last_error}")]
    RetryBudgetExhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    /// No connection is currently usable for sending (a reconnect is in
    /// progress or the stream has terminated).
    #[error("stream is not connected")]
    Disconnected,

    /// The receive loop died unexpectedly (it panicked or was aborted).
    #[error("stream receive loop aborted: {0}")]
    Aborted(String),

    /// The stream was closed by its owner.
    #[error("stream is closed")]
    Closed,

    /// Request metadata could not be built from the credentials.
    #[error("invalid credentials: {0}")]
    Credentials(String),
}
