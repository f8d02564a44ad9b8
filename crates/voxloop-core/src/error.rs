use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoxloopError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxloopError>;
