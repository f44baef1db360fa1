use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while running and supervising an ffmpeg attempt
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("ffmpeg not found: {}: {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: which::Error,
    },

    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to capture ffmpeg stderr")]
    MissingStderr,

    #[error("failed to wait for ffmpeg: {0}")]
    Wait(#[source] std::io::Error),

    #[error("stderr capture failed: {0}")]
    Capture(#[source] std::io::Error),

    #[error("{0} task ended unexpectedly")]
    TaskFailed(&'static str),

    #[error("ffmpeg was cancelled")]
    Cancelled,

    #[error("stalled on frame {frame} after {updates} updates")]
    Stalled { frame: u64, updates: u64 },

    #[error("freeze detected: {frames} duplicate frames (limit {limit})")]
    Frozen { frames: u64, limit: u64 },

    #[error("ffmpeg exited with status {code}")]
    ExitStatus { code: i32 },
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
