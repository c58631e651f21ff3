//! Streaming contracts of the external recognition, generation and synthesis services.
//!
//! Each stage binds to one connection for its lifetime. Wire protocols live behind
//! these traits; the [`scripted`] module provides in-process implementations.

pub mod scripted;

use crate::defaults;
use crate::pipeline::types::{AudioChunk, TranscriptEvent, Turn};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Failures reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Transport failure; worth one reconnect attempt.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The connection was closed underneath the caller.
    #[error("connection closed")]
    Closed,
    /// Credentials missing or rejected.
    #[error("credentials rejected: {0}")]
    Credentials(String),
    /// The collaborator sent something that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CollaboratorError {
    /// Errors that a reconnect may fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Connection(_) | CollaboratorError::Closed
        )
    }
}

/// Connect parameters for the recognition service.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOptions {
    pub api_key: Option<String>,
    pub model: String,
    pub language: String,
    /// Report partial transcripts while the user is still speaking.
    pub interim_results: bool,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            model: defaults::RECOGNITION_MODEL.to_string(),
            language: defaults::RECOGNITION_LANGUAGE.to_string(),
            interim_results: true,
        }
    }
}

/// Speech recognition service.
#[async_trait]
pub trait RecognitionService: Send + Sync {
    /// Checks credentials without opening a connection.
    fn check_credentials(&self, _options: &RecognitionOptions) -> Result<(), CollaboratorError> {
        Ok(())
    }

    /// Opens a duplex stream: audio in, transcripts out.
    async fn connect(
        &self,
        options: &RecognitionOptions,
    ) -> Result<Box<dyn RecognitionConnection>, CollaboratorError>;
}

/// Open recognition stream.
#[async_trait]
pub trait RecognitionConnection: Send {
    /// Sends the next chunk of audio, in order.
    async fn send_audio(&mut self, chunk: &AudioChunk) -> Result<(), CollaboratorError>;

    /// Waits for the next transcript. `None` once the stream has ended.
    ///
    /// Must be cancel-safe: the stage races it against its input queue.
    async fn next_transcript(&mut self) -> Option<Result<TranscriptEvent, CollaboratorError>>;

    /// Signals end of input; trailing transcripts are still delivered.
    async fn finish(&mut self) -> Result<(), CollaboratorError>;

    /// Releases the connection. Further calls are no-ops.
    async fn close(&mut self);
}

/// Parameters of one generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// The full ordered conversation history, system prompt first.
    pub messages: Vec<Turn>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Text fragments of one response. Dropping the stream cancels the request.
pub type TokenStream = BoxStream<'static, Result<String, CollaboratorError>>;

/// Connect parameters for the generation service. Per-request parameters travel
/// in [`GenerationRequest`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub api_key: Option<String>,
}

/// Text generation service.
#[async_trait]
pub trait GenerationService: Send + Sync {
    fn check_credentials(&self, _options: &GenerationOptions) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn connect(
        &self,
        options: &GenerationOptions,
    ) -> Result<Box<dyn GenerationConnection>, CollaboratorError>;
}

/// Open generation session. Each request restarts the token stream.
#[async_trait]
pub trait GenerationConnection: Send {
    async fn stream(&mut self, request: GenerationRequest)
    -> Result<TokenStream, CollaboratorError>;

    async fn close(&mut self);
}

/// What the synthesis service streams back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisOutput {
    /// Synthesized audio bytes.
    Audio(Vec<u8>),
    /// All audio for the text sent before the last flush has been delivered.
    Done,
}

/// Connect parameters for the synthesis service: the voice and its settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    pub api_key: Option<String>,
    pub voice_id: String,
    pub model_id: String,
    /// 0.0 to 1.0
    pub stability: f32,
    /// 0.0 to 1.0
    pub similarity_boost: f32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: defaults::SYNTHESIS_VOICE_ID.to_string(),
            model_id: defaults::SYNTHESIS_MODEL_ID.to_string(),
            stability: defaults::SYNTHESIS_STABILITY,
            similarity_boost: defaults::SYNTHESIS_SIMILARITY_BOOST,
        }
    }
}

/// Speech synthesis service.
#[async_trait]
pub trait SynthesisService: Send + Sync {
    fn check_credentials(&self, _options: &SynthesisOptions) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn connect(
        &self,
        options: &SynthesisOptions,
    ) -> Result<Box<dyn SynthesisConnection>, CollaboratorError>;
}

/// Open synthesis stream: text fragments in, audio out.
#[async_trait]
pub trait SynthesisConnection: Send {
    /// Sends a text fragment for synthesis.
    async fn send_text(&mut self, text: &str) -> Result<(), CollaboratorError>;

    /// End-of-stream control message: synthesize whatever is buffered, then report `Done`.
    async fn flush(&mut self) -> Result<(), CollaboratorError>;

    /// Waits for the next output. `None` once the stream has ended.
    ///
    /// Must be cancel-safe.
    async fn next_output(&mut self) -> Option<Result<SynthesisOutput, CollaboratorError>>;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CollaboratorError::Connection("reset".into()).is_transient());
        assert!(CollaboratorError::Closed.is_transient());
        assert!(!CollaboratorError::Credentials("bad key".into()).is_transient());
        assert!(!CollaboratorError::Protocol("garbage".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            CollaboratorError::Credentials("missing api key".into()).to_string(),
            "credentials rejected: missing api key"
        );
        assert_eq!(CollaboratorError::Closed.to_string(), "connection closed");
    }
}
