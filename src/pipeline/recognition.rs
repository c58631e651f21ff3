//! Recognition stage: raw audio in, transcript envelopes out.
//!
//! Every final transcript opens a new turn with its own interruptible signal. The
//! signal travels with the transcript through generation and synthesis, so when
//! the user speaks again the whole response to the previous turn can be cut short.

use crate::collaborator::{RecognitionConnection, RecognitionOptions, RecognitionService};
use crate::pipeline::envelope::{Envelope, InterruptHandle};
use crate::pipeline::error::StageError;
use crate::pipeline::link::Link;
use crate::pipeline::stage::{Outbox, Stage, StageHealth};
use crate::pipeline::types::{AudioChunk, TranscriptEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub struct RecognitionStage {
    service: Arc<dyn RecognitionService>,
    options: RecognitionOptions,
    link: Link<Box<dyn RecognitionConnection>>,
    barge_in: bool,
    end_of_input_grace: Duration,
    turn: Option<InterruptHandle>,
    turns: watch::Sender<Option<InterruptHandle>>,
}

impl RecognitionStage {
    pub fn new(service: Arc<dyn RecognitionService>, barge_in: bool) -> Self {
        let (turns, _) = watch::channel(None);
        Self {
            service,
            options: RecognitionOptions::default(),
            link: Link::new("recognition"),
            barge_in,
            end_of_input_grace: Duration::from_millis(crate::defaults::END_OF_INPUT_GRACE_MS),
            turn: None,
            turns,
        }
    }

    /// Parameters for every connect, including reconnects.
    pub fn with_options(mut self, options: RecognitionOptions) -> Self {
        self.options = options;
        self
    }

    /// How long to wait for trailing transcripts after end of input.
    pub fn with_end_of_input_grace(mut self, grace: Duration) -> Self {
        self.end_of_input_grace = grace;
        self
    }

    /// Follows the signal of the most recent turn.
    pub fn turns(&self) -> watch::Receiver<Option<InterruptHandle>> {
        self.turns.subscribe()
    }

    async fn connect(&mut self, initial: bool) -> Result<(), StageError> {
        let service = Arc::clone(&self.service);
        let options = self.options.clone();
        let connect = move || {
            let service = Arc::clone(&service);
            let options = options.clone();
            async move { service.connect(&options).await }
        };
        if initial {
            self.link.open(connect).await
        } else {
            self.link.reconnect(connect).await
        }
    }

    async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.link.take() {
            conn.close().await;
        }
    }

    async fn send(&mut self, chunk: &AudioChunk) -> Result<(), StageError> {
        if !self.link.is_connected() {
            self.connect(false).await?;
        }
        let sent = match self.link.get() {
            Some(conn) => conn.send_audio(chunk).await,
            None => return Err(self.link.degraded_error()),
        };
        match sent {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!(stage = "recognition", error = %e, "audio stream failed");
                self.drop_connection().await;
                self.connect(false).await?;
                let resent = match self.link.get() {
                    Some(conn) => conn.send_audio(chunk).await,
                    None => return Err(self.link.degraded_error()),
                };
                resent.map_err(|e| self.link.degrade(format!("stream failed after reconnect: {e}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Applies barge-in and wraps the transcript for the next stage.
    fn on_transcript(&mut self, event: TranscriptEvent) -> Option<Envelope<TranscriptEvent>> {
        if event.text.trim().is_empty() {
            return None;
        }
        if self.barge_in
            && let Some(turn) = &self.turn
            && turn.interrupt()
        {
            tracing::debug!(turn = turn.id(), "barge-in, interrupting active turn");
        }
        if !event.is_final {
            return Some(Envelope::uninterruptible(event));
        }

        let turn = InterruptHandle::new();
        self.turn = Some(turn.clone());
        self.turns.send_replace(Some(turn.clone()));
        tracing::debug!(turn = turn.id(), confidence = event.confidence, "final transcript");
        Some(Envelope::with_signal(event, turn))
    }
}

#[async_trait]
impl Stage for RecognitionStage {
    type Input = AudioChunk;
    type Output = Envelope<TranscriptEvent>;

    fn name(&self) -> &'static str {
        "recognition"
    }

    async fn open(&mut self) -> Result<(), StageError> {
        self.connect(true).await
    }

    async fn process(
        &mut self,
        chunk: AudioChunk,
        _output: &Outbox<Self::Output>,
    ) -> Result<(), StageError> {
        if chunk.is_empty() {
            return Err(StageError::Malformed("empty audio chunk".into()));
        }
        if self.link.is_degraded() {
            return Err(self.link.degraded_error());
        }
        self.send(&chunk).await
    }

    async fn next_inbound(&mut self) -> Result<Self::Output, StageError> {
        loop {
            let Some(conn) = self.link.get() else {
                return std::future::pending().await;
            };
            match conn.next_transcript().await {
                Some(Ok(event)) => {
                    if let Some(envelope) = self.on_transcript(event) {
                        return Ok(envelope);
                    }
                }
                Some(Err(e)) => {
                    if e.is_transient() {
                        self.drop_connection().await;
                    }
                    return Err(e.into());
                }
                None => {
                    tracing::debug!(stage = "recognition", "transcript stream ended");
                    self.drop_connection().await;
                }
            }
        }
    }

    async fn drain(&mut self, output: &Outbox<Self::Output>) -> Result<(), StageError> {
        let Some(conn) = self.link.get() else {
            return Ok(());
        };
        conn.finish().await?;

        let deadline = Instant::now() + self.end_of_input_grace;
        loop {
            let Some(conn) = self.link.get() else {
                return Ok(());
            };
            match tokio::time::timeout_at(deadline, conn.next_transcript()).await {
                Err(_) => {
                    tracing::debug!(stage = "recognition", "end-of-input grace elapsed");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(event))) => {
                    if let Some(envelope) = self.on_transcript(event) {
                        output.emit(envelope).await?;
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.drop_connection().await;
    }

    fn health(&self) -> StageHealth {
        self.link.health()
    }
}
