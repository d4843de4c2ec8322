use thiserror::Error;

/// All errors produced by sonoscope-core.
#[derive(Debug, Error)]
pub enum SonoscopeError {
    #[error("invalid bar count: {0}")]
    InvalidBarCount(usize),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no capture device found")]
    NoCaptureDevice,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SonoscopeError>;
