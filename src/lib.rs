//! voicepipe - interruptible streaming pipeline for spoken conversations
//!
//! Audio in, speech recognition, response generation, speech synthesis,
//! audio out. Stages run concurrently and a caller talking over the
//! response cancels it mid-flight.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod collaborator;
pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod session;

// Collaborator seams
pub use collaborator::{
    CollaboratorError, GenerationOptions, GenerationService, RecognitionOptions,
    RecognitionService, SynthesisOptions, SynthesisService,
};

// Pipeline
pub use pipeline::{
    Collaborators, Envelope, InterruptHandle, Pipeline, PipelineConfig, PipelineHandle,
    PipelineHealth,
};

// Session
pub use session::{AudioSink, CollectorSink, SessionSummary, run_session};

// Error handling
pub use error::{Result, VoicepipeError};

// Config
pub use config::Config;

// Stage framework (for advanced users)
pub use pipeline::error::{ErrorReporter, StageError};
pub use pipeline::stage::Stage;
