//! Default configuration constants for voicepipe.
//!
//! Shared by the TOML configuration and the runtime pipeline configuration so both
//! agree on what "unset" means.

/// Capacity of the raw audio queue in front of the recognition stage.
///
/// Live transports deliver roughly 50 chunks per second; 256 chunks is about five
/// seconds of audio before the session adapter is pushed back.
pub const RECOGNITION_QUEUE: usize = 256;

/// Capacity of the transcript queue in front of the generation stage.
pub const GENERATION_QUEUE: usize = 32;

/// Capacity of the token queue in front of the synthesis stage.
pub const SYNTHESIS_QUEUE: usize = 128;

/// Capacity of the synthesized audio queue drained by the session adapter.
pub const OUTPUT_QUEUE: usize = 256;

/// How long `terminate()` lets an in-flight item finish before cancelling it.
pub const DRAIN_TIMEOUT_MS: u64 = 2000;

/// Upper bound for releasing a collaborator connection once the stage loop exits.
pub const CLOSE_TIMEOUT_MS: u64 = 1000;

/// How long recognition keeps reading trailing transcripts after end-of-input.
pub const END_OF_INPUT_GRACE_MS: u64 = 1500;

/// Recognition model requested from the collaborator.
pub const RECOGNITION_MODEL: &str = "nova-2";

/// Recognition language.
pub const RECOGNITION_LANGUAGE: &str = "en-US";

/// Generation model requested from the collaborator.
pub const GENERATION_MODEL: &str = "llama3-70b-8192";

/// Sampling temperature for generation.
pub const GENERATION_TEMPERATURE: f32 = 0.7;

/// Token ceiling per generated response. Responses are spoken, so they stay short.
pub const GENERATION_MAX_TOKENS: u32 = 256;

/// First entry of every conversation history.
pub const SYSTEM_PROMPT: &str = "You are a helpful receptionist. Keep answers brief and \
conversational. Do not use emojis.";

/// Spoken when generation is unavailable.
pub const FALLBACK_MESSAGE: &str = "I am having trouble connecting right now.";

/// Synthesis voice.
pub const SYNTHESIS_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

/// Synthesis model.
pub const SYNTHESIS_MODEL_ID: &str = "eleven_turbo_v2_5";

/// Voice stability (0.0 to 1.0).
pub const SYNTHESIS_STABILITY: f32 = 0.5;

/// Voice similarity boost (0.0 to 1.0).
pub const SYNTHESIS_SIMILARITY_BOOST: f32 = 0.8;

/// Default log level when `RUST_LOG` is unset.
pub const LOG_LEVEL: &str = "info";
