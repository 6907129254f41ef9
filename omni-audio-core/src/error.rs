use thiserror::Error;

use crate::ipc::events::PipelineState;

/// All errors produced by omni-audio-core.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("invalid ring buffer capacity {capacity}: at least 2 bytes are required")]
    InvalidCapacity { capacity: usize },

    #[error("failed to allocate a {capacity}-byte ring buffer")]
    AllocationFailed { capacity: usize },

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("audio pipeline is not initialized")]
    NotInitialized,

    #[error("cannot {operation} while pipeline is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PipelineState,
    },

    #[error("timed out after {timeout_ms} ms waiting for the pipeline to become ready")]
    Timeout { timeout_ms: u64 },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;
