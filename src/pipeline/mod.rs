//! Streaming conversation pipeline.
//!
//! Three stages run as independent tasks connected by bounded queues:
//!
//! ```text
//! audio ─▶ [recognition] ─▶ [generation] ─▶ [synthesis] ─▶ audio out
//!               │                                 ▲
//!               └──────── per-turn interrupt ─────┘
//! ```
//!
//! Every item between stages travels in an [`Envelope`] carrying the
//! interrupt signal of the turn it belongs to, so barge-in cancels work
//! in flight downstream without flushing queues.

pub mod envelope;
pub mod error;
pub mod generation;
pub(crate) mod link;
pub mod orchestrator;
pub mod queue;
pub mod recognition;
pub mod stage;
pub mod synthesis;
pub mod types;

pub use envelope::{Envelope, InterruptHandle};
pub use error::{ErrorReporter, LogReporter, StageError};
pub use generation::{GenerationSettings, GenerationStage};
pub use orchestrator::{
    AudioOutputStream, Collaborators, Pipeline, PipelineConfig, PipelineHandle, PipelineHealth,
    StageReport,
};
pub use queue::{QueueReceiver, QueueSender, StageMessage, queue};
pub use recognition::RecognitionStage;
pub use stage::{Outbox, Stage, StageControl, StageHealth, StageState, StageWorker};
pub use synthesis::SynthesisStage;
pub use types::{AudioChunk, AudioOutputEvent, GenerationChunkEvent, Role, TranscriptEvent, Turn};
