//! Streaming conversation pipeline: AudioChunk → Recognition → Generation → Synthesis → output.

use crate::collaborator::{
    GenerationOptions, GenerationService, RecognitionOptions, RecognitionService,
    SynthesisOptions, SynthesisService,
};
use crate::config::Config;
use crate::error::{Result, VoicepipeError};
use crate::pipeline::envelope::InterruptHandle;
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::generation::{GenerationSettings, GenerationStage};
use crate::pipeline::queue::{QueueReceiver, QueueSender, StageMessage, TryPushError, queue};
use crate::pipeline::recognition::RecognitionStage;
use crate::pipeline::stage::{StageControl, StageHealth, StageState, StageWorker};
use crate::pipeline::synthesis::SynthesisStage;
use crate::pipeline::types::{AudioChunk, AudioOutputEvent};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Configuration for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Queue buffer sizes
    pub recognition_queue: usize,
    pub generation_queue: usize,
    pub synthesis_queue: usize,
    pub output_queue: usize,
    /// How long `terminate` waits for in-flight work before cancelling it
    pub drain_timeout: Duration,
    /// Upper bound for releasing a collaborator connection
    pub close_timeout: Duration,
    /// How long a graceful finish waits for trailing transcripts and audio
    pub end_of_input_grace: Duration,
    /// Interrupt the active response when the user speaks again
    pub barge_in: bool,
    pub recognition: RecognitionOptions,
    pub generation: GenerationSettings,
    pub synthesis: SynthesisOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        use crate::defaults;
        Self {
            recognition_queue: defaults::RECOGNITION_QUEUE,
            generation_queue: defaults::GENERATION_QUEUE,
            synthesis_queue: defaults::SYNTHESIS_QUEUE,
            output_queue: defaults::OUTPUT_QUEUE,
            drain_timeout: Duration::from_millis(defaults::DRAIN_TIMEOUT_MS),
            close_timeout: Duration::from_millis(defaults::CLOSE_TIMEOUT_MS),
            end_of_input_grace: Duration::from_millis(defaults::END_OF_INPUT_GRACE_MS),
            barge_in: true,
            recognition: RecognitionOptions::default(),
            generation: GenerationSettings::default(),
            synthesis: SynthesisOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Derives the runtime settings from the file configuration.
    pub fn from_config(config: &Config) -> Self {
        let p = &config.pipeline;
        let r = &config.recognition;
        let g = &config.generation;
        let s = &config.synthesis;
        Self {
            recognition_queue: p.recognition_queue,
            generation_queue: p.generation_queue,
            synthesis_queue: p.synthesis_queue,
            output_queue: p.output_queue,
            drain_timeout: Duration::from_millis(p.drain_timeout_ms),
            close_timeout: Duration::from_millis(p.close_timeout_ms),
            end_of_input_grace: Duration::from_millis(p.end_of_input_grace_ms),
            barge_in: p.barge_in,
            recognition: RecognitionOptions {
                api_key: r.api_key.clone(),
                model: r.model.clone(),
                language: r.language.clone(),
                interim_results: r.interim_results,
            },
            generation: GenerationSettings {
                options: GenerationOptions {
                    api_key: g.api_key.clone(),
                },
                model: g.model.clone(),
                temperature: g.temperature,
                max_tokens: g.max_tokens,
                system_prompt: g.system_prompt.clone(),
                fallback_message: g.fallback_message.clone(),
            },
            synthesis: SynthesisOptions {
                api_key: s.api_key.clone(),
                voice_id: s.voice_id.clone(),
                model_id: s.model_id.clone(),
                stability: s.stability,
                similarity_boost: s.similarity_boost,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (key, capacity) in [
            ("recognition_queue", self.recognition_queue),
            ("generation_queue", self.generation_queue),
            ("synthesis_queue", self.synthesis_queue),
            ("output_queue", self.output_queue),
        ] {
            if capacity == 0 {
                return Err(VoicepipeError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// The external services the stages bind to.
#[derive(Clone)]
pub struct Collaborators {
    pub recognition: Arc<dyn RecognitionService>,
    pub generation: Arc<dyn GenerationService>,
    pub synthesis: Arc<dyn SynthesisService>,
}

impl Collaborators {
    /// Fails fast on missing or rejected credentials.
    fn check_credentials(&self, config: &PipelineConfig) -> Result<()> {
        let checks = [
            ("recognition", self.recognition.check_credentials(&config.recognition)),
            ("generation", self.generation.check_credentials(&config.generation.options)),
            ("synthesis", self.synthesis.check_credentials(&config.synthesis)),
        ];
        for (collaborator, check) in checks {
            if let Err(e) = check {
                return Err(VoicepipeError::FatalConfiguration {
                    collaborator: collaborator.to_string(),
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Status of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: &'static str,
    pub state: StageState,
    pub health: StageHealth,
}

/// Aggregated stage status, upstream first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineHealth {
    pub stages: Vec<StageReport>,
}

impl PipelineHealth {
    /// True if no stage has lost its collaborator.
    pub fn is_healthy(&self) -> bool {
        self.stages.iter().all(|s| s.health.is_healthy())
    }

    /// Names of degraded stages.
    pub fn degraded(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .filter(|s| !s.health.is_healthy())
            .map(|s| s.name)
            .collect()
    }

    pub fn all_terminated(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.state == StageState::Terminated)
    }
}

/// Synthesized audio, in order, until the pipeline finishes or terminates.
pub type AudioOutputStream = BoxStream<'static, AudioOutputEvent>;

/// Handle to a running pipeline.
pub struct PipelineHandle {
    input: QueueSender<AudioChunk>,
    outputs: Option<QueueReceiver<AudioOutputEvent>>,
    turns: watch::Receiver<Option<InterruptHandle>>,
    stages: Vec<Box<dyn StageControl>>,
}

impl PipelineHandle {
    /// Enqueues raw audio, suspending while the recognition queue is full.
    pub async fn feed(&self, chunk: AudioChunk) -> Result<()> {
        self.input
            .push(chunk)
            .await
            .map_err(|_| VoicepipeError::PipelineClosed {
                message: "recognition stage no longer accepts audio".to_string(),
            })
    }

    /// Enqueues raw audio without suspending.
    pub fn try_feed(&self, chunk: AudioChunk) -> std::result::Result<(), TryPushError<AudioChunk>> {
        self.input.try_push(chunk)
    }

    /// Signals end of input. Queued audio is processed, then every stage drains
    /// and stops, and the output stream ends.
    pub async fn finish(&self) -> Result<()> {
        self.input
            .shutdown()
            .await
            .map_err(|_| VoicepipeError::PipelineClosed {
                message: "pipeline already stopped".to_string(),
            })
    }

    /// Takes the output stream. Returns `None` if it was already taken.
    pub fn outputs(&mut self) -> Option<AudioOutputStream> {
        let rx = self.outputs.take()?;
        let events = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Some(StageMessage::Item(event)) => Some((event, rx)),
                Some(StageMessage::Shutdown) | None => None,
            }
        });
        Some(events.boxed())
    }

    /// Waits for the next synthesized chunk, unless the output stream was taken.
    pub async fn next_output(&mut self) -> Option<AudioOutputEvent> {
        let rx = self.outputs.as_mut()?;
        match rx.recv().await {
            Some(StageMessage::Item(event)) => Some(event),
            Some(StageMessage::Shutdown) | None => None,
        }
    }

    /// Interrupts the response to the latest turn.
    ///
    /// Returns `true` only if this call performed the interruption.
    pub fn interrupt(&self) -> bool {
        let turn = self.turns.borrow().clone();
        match turn {
            Some(turn) => {
                let interrupted = turn.interrupt();
                if interrupted {
                    tracing::debug!(turn = turn.id(), "turn interrupted by session");
                }
                interrupted
            }
            None => false,
        }
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth {
            stages: self
                .stages
                .iter()
                .map(|stage| StageReport {
                    name: stage.name(),
                    state: stage.state(),
                    health: stage.health(),
                })
                .collect(),
        }
    }

    /// Stops every stage and waits until all of them are terminated and have
    /// released their connections. Safe to call more than once.
    pub async fn terminate(&mut self) {
        futures_util::future::join_all(self.stages.iter_mut().map(|stage| stage.terminate())).await;
        tracing::info!("pipeline terminated");
    }
}

/// Streaming conversation pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
    error_reporter: Arc<dyn ErrorReporter>,
    runtime: Option<Handle>,
}

impl Pipeline {
    /// Creates a pipeline, checking configuration and collaborator credentials.
    ///
    /// Nothing is started and no connection is opened if this fails.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        collaborators.check_credentials(&config)?;
        Ok(Self {
            config,
            collaborators,
            error_reporter: Arc::new(LogReporter),
            runtime: None,
        })
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Runs the stages on the given runtime instead of the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Starts all stages.
    pub fn start(self) -> Result<PipelineHandle> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| VoicepipeError::NoRuntime)?,
        };
        let cfg = self.config;
        let timeouts = (cfg.drain_timeout, cfg.close_timeout);

        let (output_tx, output_rx) = queue(cfg.output_queue);

        let synthesis = SynthesisStage::new(self.collaborators.synthesis)
            .with_options(cfg.synthesis)
            .with_drain_grace(cfg.end_of_input_grace);
        let synthesis = StageWorker::new(synthesis, cfg.synthesis_queue, output_tx)
            .with_error_reporter(Arc::clone(&self.error_reporter))
            .with_timeouts(timeouts.0, timeouts.1);

        let generation = GenerationStage::new(self.collaborators.generation, cfg.generation);
        let generation = StageWorker::new(generation, cfg.generation_queue, synthesis.input())
            .with_error_reporter(Arc::clone(&self.error_reporter))
            .with_timeouts(timeouts.0, timeouts.1);

        let recognition = RecognitionStage::new(self.collaborators.recognition, cfg.barge_in)
            .with_options(cfg.recognition)
            .with_end_of_input_grace(cfg.end_of_input_grace);
        let turns = recognition.turns();
        let recognition = StageWorker::new(recognition, cfg.recognition_queue, generation.input())
            .with_error_reporter(Arc::clone(&self.error_reporter))
            .with_timeouts(timeouts.0, timeouts.1);
        let input = recognition.input();

        let mut stages: Vec<Box<dyn StageControl>> = vec![
            Box::new(recognition),
            Box::new(generation),
            Box::new(synthesis),
        ];
        for stage in &mut stages {
            stage.start(&runtime);
        }
        tracing::info!(barge_in = cfg.barge_in, "pipeline started");

        Ok(PipelineHandle {
            input,
            outputs: Some(output_rx),
            turns,
            stages,
        })
    }
}
