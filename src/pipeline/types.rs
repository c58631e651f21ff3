//! Data types flowing between pipeline stages.

use serde::{Deserialize, Serialize};

/// A slice of captured audio, opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioChunk {
    /// Raw bytes as delivered by the transport.
    pub data: Vec<u8>,
}

impl AudioChunk {
    /// Creates a chunk from raw bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the chunk carries no audio.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl From<&[u8]> for AudioChunk {
    fn from(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

/// A transcript produced by the recognition stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    /// Interim results are advisory; only final ones reach generation.
    pub is_final: bool,
    /// Recognition confidence in [0, 1].
    pub confidence: f32,
}

impl TranscriptEvent {
    /// Creates a transcript, clamping confidence into [0, 1].
    pub fn new(text: impl Into<String>, is_final: bool, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            text: text.into(),
            is_final,
            confidence,
        }
    }

    /// A final transcript.
    pub fn final_text(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(text, true, confidence)
    }

    /// An interim transcript.
    pub fn interim(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(text, false, confidence)
    }
}

/// An incremental fragment of a generated response.
///
/// Fragments of one response share an interruption signal and are concatenated in
/// arrival order. The last item of a completed response is an end marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationChunkEvent {
    pub token: String,
    /// Marks the end of the response; carries no text.
    pub end_of_response: bool,
}

impl GenerationChunkEvent {
    /// A text fragment.
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            end_of_response: false,
        }
    }

    /// The end-of-response marker.
    pub fn end_of_response() -> Self {
        Self {
            token: String::new(),
            end_of_response: true,
        }
    }
}

/// Synthesized audio ready for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOutputEvent {
    pub chunk: Vec<u8>,
}

impl AudioOutputEvent {
    pub fn new(chunk: impl Into<Vec<u8>>) -> Self {
        Self {
            chunk: chunk.into(),
        }
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
