//! Session side of the pipeline: feed audio in, play synthesized audio out.

use crate::error::{Result, VoicepipeError};
use crate::pipeline::orchestrator::{PipelineHandle, PipelineHealth};
use crate::pipeline::types::{AudioChunk, AudioOutputEvent};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};

/// Pluggable audio output for a session, e.g. a live transport.
#[async_trait]
pub trait AudioSink: Send {
    /// Plays one chunk of synthesized audio. Called in output order.
    async fn play(&mut self, event: AudioOutputEvent) -> Result<()>;

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct CollectorSink {
    collected: Vec<AudioOutputEvent>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[AudioOutputEvent] {
        &self.collected
    }

    /// All played audio, concatenated.
    pub fn bytes(&self) -> Vec<u8> {
        self.collected
            .iter()
            .flat_map(|e| e.chunk.iter().copied())
            .collect()
    }
}

#[async_trait]
impl AudioSink for CollectorSink {
    async fn play(&mut self, event: AudioOutputEvent) -> Result<()> {
        self.collected.push(event);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

/// What happened during one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub chunks_fed: usize,
    pub chunks_played: usize,
    pub bytes_played: usize,
    /// Stage status after termination.
    pub health: PipelineHealth,
}

/// Drives one session to completion.
///
/// Feeds every chunk from `source`, then signals end of input and plays output
/// into `sink` until the pipeline has drained. The pipeline is terminated on
/// every exit path, including errors.
pub async fn run_session<S>(
    mut handle: PipelineHandle,
    source: S,
    sink: &mut dyn AudioSink,
) -> Result<SessionSummary>
where
    S: Stream<Item = AudioChunk> + Send,
{
    let Some(mut outputs) = handle.outputs() else {
        handle.terminate().await;
        return Err(VoicepipeError::PipelineClosed {
            message: "output stream already taken".to_string(),
        });
    };

    let handle_ref = &handle;
    let feeding = async move {
        let mut source = std::pin::pin!(source);
        let mut fed = 0;
        while let Some(chunk) = source.next().await {
            handle_ref.feed(chunk).await?;
            fed += 1;
        }
        handle_ref.finish().await?;
        tracing::debug!(chunks = fed, "end of input");
        Ok::<_, VoicepipeError>(fed)
    };

    let sink_name = sink.name();
    let playing = async {
        let mut played = 0;
        let mut bytes = 0;
        while let Some(event) = outputs.next().await {
            bytes += event.chunk.len();
            played += 1;
            sink.play(event).await.map_err(|e| VoicepipeError::Sink {
                sink: sink_name.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok::<_, VoicepipeError>((played, bytes))
    };

    let result = tokio::try_join!(feeding, playing);
    handle.terminate().await;
    let health = handle.health();
    if !health.is_healthy() {
        tracing::warn!(degraded = ?health.degraded(), "session ended with degraded stages");
    }

    let (chunks_fed, (chunks_played, bytes_played)) = result?;
    tracing::info!(chunks_fed, chunks_played, bytes_played, "session finished");
    Ok(SessionSummary {
        chunks_fed,
        chunks_played,
        bytes_played,
        health,
    })
}
