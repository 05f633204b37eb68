//! Error types for aircast
//!
//! Centralized error handling using thiserror. One variant per failure
//! kind the engine can report; each carries a human-readable reason.

use thiserror::Error;

/// Main error type for the aircast engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("network connection failed: {0}")]
    NetworkConnectionFailed(String),

    #[error("file stream get property failed: {0}")]
    FileStreamGetPropertyFailed(String),

    #[error("file stream set property failed: {0}")]
    FileStreamSetPropertyFailed(String),

    #[error("file stream parse bytes failed: {0}")]
    FileStreamParseBytesFailed(String),

    #[error("file stream open failed: {0}")]
    FileStreamOpenFailed(String),

    #[error("no audio data found: {0}")]
    AudioDataNotFound(String),

    #[error("audio queue creation failed: {0}")]
    AudioQueueCreationFailed(String),

    #[error("audio queue buffer allocation failed: {0}")]
    AudioQueueBufferAllocationFailed(String),

    #[error("audio queue enqueue failed: {0}")]
    AudioQueueEnqueueFailed(String),

    #[error("audio queue add listener failed: {0}")]
    AudioQueueAddListenerFailed(String),

    #[error("audio queue start failed: {0}")]
    AudioQueueStartFailed(String),

    #[error("audio queue pause failed: {0}")]
    AudioQueuePauseFailed(String),

    #[error("audio queue stop failed: {0}")]
    AudioQueueStopFailed(String),

    #[error("audio queue flush failed: {0}")]
    AudioQueueFlushFailed(String),

    #[error("audio buffer too small: {0}")]
    AudioBufferTooSmall(String),

    #[error("timed out: {0}")]
    TimedOut(String),
}

impl StreamError {
    /// The human-readable reason carried by this error, without the kind
    /// prefix. Used when re-labelling a collaborator failure under the
    /// kind the failing operation demands.
    pub fn reason(&self) -> &str {
        match self {
            StreamError::NetworkConnectionFailed(s)
            | StreamError::FileStreamGetPropertyFailed(s)
            | StreamError::FileStreamSetPropertyFailed(s)
            | StreamError::FileStreamParseBytesFailed(s)
            | StreamError::FileStreamOpenFailed(s)
            | StreamError::AudioDataNotFound(s)
            | StreamError::AudioQueueCreationFailed(s)
            | StreamError::AudioQueueBufferAllocationFailed(s)
            | StreamError::AudioQueueEnqueueFailed(s)
            | StreamError::AudioQueueAddListenerFailed(s)
            | StreamError::AudioQueueStartFailed(s)
            | StreamError::AudioQueuePauseFailed(s)
            | StreamError::AudioQueueStopFailed(s)
            | StreamError::AudioQueueFlushFailed(s)
            | StreamError::AudioBufferTooSmall(s)
            | StreamError::TimedOut(s) => s,
        }
    }
}

/// Result type alias for aircast
pub type Result<T> = std::result::Result<T, StreamError>;
