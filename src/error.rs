//! Error types for voicepipe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoicepipeError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Missing or rejected collaborator credentials. Raised before any stage starts.
    #[error("Fatal configuration for {collaborator}: {message}")]
    FatalConfiguration {
        collaborator: String,
        message: String,
    },

    // Runtime errors
    #[error("Pipeline is closed: {message}")]
    PipelineClosed { message: String },

    #[error("No async runtime available to run the pipeline")]
    NoRuntime,

    #[error("Audio sink {sink} failed: {message}")]
    Sink { sink: String, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl VoicepipeError {
    /// True for errors that must stop the session before any stage is started.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            VoicepipeError::FatalConfiguration { .. } | VoicepipeError::ConfigInvalidValue { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VoicepipeError>;
