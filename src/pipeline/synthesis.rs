//! Synthesis stage: response fragments in, audio out.
//!
//! Fragments of one turn are streamed to the collaborator as they arrive and
//! flushed at the end of the response. An interrupted turn is flushed at once and
//! the audio still in flight for it is discarded.

use crate::collaborator::{
    SynthesisConnection, SynthesisOptions, SynthesisOutput, SynthesisService,
};
use crate::pipeline::envelope::{Envelope, InterruptHandle};
use crate::pipeline::error::StageError;
use crate::pipeline::link::Link;
use crate::pipeline::stage::{Outbox, Stage, StageHealth};
use crate::pipeline::types::{AudioOutputEvent, GenerationChunkEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct SynthesisStage {
    service: Arc<dyn SynthesisService>,
    options: SynthesisOptions,
    link: Link<Box<dyn SynthesisConnection>>,
    drain_grace: Duration,
    turn: Option<InterruptHandle>,
    turn_abandoned: bool,
    /// Text sent since the last flush.
    unflushed: bool,
    flushes_sent: u64,
    dones_received: u64,
    /// Flushes sent before the current turn started.
    turn_start_flush: u64,
    /// Acknowledgement windows `[from, to)` whose audio belongs to abandoned turns.
    discard: VecDeque<(u64, u64)>,
}

impl SynthesisStage {
    pub fn new(service: Arc<dyn SynthesisService>) -> Self {
        Self {
            service,
            options: SynthesisOptions::default(),
            link: Link::new("synthesis"),
            drain_grace: Duration::from_millis(crate::defaults::END_OF_INPUT_GRACE_MS),
            turn: None,
            turn_abandoned: false,
            unflushed: false,
            flushes_sent: 0,
            dones_received: 0,
            turn_start_flush: 0,
            discard: VecDeque::new(),
        }
    }

    /// Voice and model for every connect, including reconnects.
    pub fn with_options(mut self, options: SynthesisOptions) -> Self {
        self.options = options;
        self
    }

    /// How long a graceful finish waits for the last audio.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    async fn connect(&mut self, initial: bool) -> Result<(), StageError> {
        let service = Arc::clone(&self.service);
        let options = self.options.clone();
        let connect = move || {
            let service = Arc::clone(&service);
            let options = options.clone();
            async move { service.connect(&options).await }
        };
        let connected = if initial {
            self.link.open(connect).await
        } else {
            self.link.reconnect(connect).await
        };
        self.flushes_sent = 0;
        self.dones_received = 0;
        self.turn_start_flush = 0;
        self.discard.clear();
        self.unflushed = false;
        connected
    }

    async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.link.take() {
            conn.close().await;
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<(), StageError> {
        if !self.link.is_connected() {
            self.connect(false).await?;
        }
        let sent = match self.link.get() {
            Some(conn) => conn.send_text(text).await,
            None => return Err(self.link.degraded_error()),
        };
        match sent {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(stage = "synthesis", error = %e, "text stream failed");
                self.drop_connection().await;
                self.connect(false).await?;
                let resent = match self.link.get() {
                    Some(conn) => conn.send_text(text).await,
                    None => return Err(self.link.degraded_error()),
                };
                resent.map_err(|e| {
                    self.link
                        .degrade(format!("text stream failed after reconnect: {e}"))
                })?;
            }
            Err(e) => return Err(e.into()),
        }
        self.unflushed = true;
        Ok(())
    }

    /// Sends the end-of-stream control message for the buffered text.
    async fn flush(&mut self) -> Result<(), StageError> {
        self.unflushed = false;
        let Some(conn) = self.link.get() else {
            return Ok(());
        };
        if let Err(e) = conn.flush().await {
            if e.is_transient() {
                self.drop_connection().await;
            }
            return Err(e.into());
        }
        self.flushes_sent += 1;
        Ok(())
    }

    /// Stops speaking the current turn. Audio of earlier turns is still relayed.
    async fn abandon_turn(&mut self) -> Result<(), StageError> {
        if self.turn_abandoned {
            return Ok(());
        }
        tracing::debug!(
            turn = self.turn.as_ref().map(InterruptHandle::id),
            "barge-in, synthesis abandoned"
        );
        self.turn_abandoned = true;
        if self.unflushed {
            self.flush().await?;
        }
        if self.flushes_sent > self.turn_start_flush {
            self.discard.push_back((self.turn_start_flush, self.flushes_sent));
        }
        Ok(())
    }

    fn is_current_turn(&self, signal: &InterruptHandle) -> bool {
        self.turn.as_ref().is_some_and(|t| t.same_signal(signal))
    }

    /// Audio for an abandoned turn is still arriving.
    fn discarding(&self) -> bool {
        self.discard
            .iter()
            .any(|&(from, to)| (from..to).contains(&self.dones_received))
    }

    fn on_done(&mut self) {
        self.dones_received += 1;
        let acknowledged = self.dones_received;
        self.discard.retain(|&(_, to)| to > acknowledged);
    }
}

#[async_trait]
impl Stage for SynthesisStage {
    type Input = Envelope<GenerationChunkEvent>;
    type Output = AudioOutputEvent;

    fn name(&self) -> &'static str {
        "synthesis"
    }

    async fn open(&mut self) -> Result<(), StageError> {
        self.connect(true).await
    }

    async fn process(
        &mut self,
        envelope: Envelope<GenerationChunkEvent>,
        _output: &Outbox<AudioOutputEvent>,
    ) -> Result<(), StageError> {
        if self.link.is_degraded() {
            return Err(self.link.degraded_error());
        }
        let (chunk, signal) = envelope.into_parts();
        if !self.is_current_turn(&signal) {
            if self.unflushed {
                self.flush().await?;
            }
            self.turn = Some(signal.clone());
            self.turn_abandoned = false;
            self.turn_start_flush = self.flushes_sent;
        }
        if signal.is_set() {
            return self.abandon_turn().await;
        }
        if chunk.end_of_response {
            return if self.unflushed {
                self.flush().await
            } else {
                Ok(())
            };
        }
        if chunk.token.is_empty() {
            return Ok(());
        }

        self.send_text(&chunk.token).await?;
        if signal.is_set() {
            return self.abandon_turn().await;
        }
        Ok(())
    }

    async fn next_inbound(&mut self) -> Result<AudioOutputEvent, StageError> {
        loop {
            let watched = self.turn.clone().filter(|_| !self.turn_abandoned);
            let Some(conn) = self.link.get() else {
                return std::future::pending().await;
            };
            let next = tokio::select! {
                biased;
                _ = async {
                    match &watched {
                        Some(turn) => turn.interrupted().await,
                        None => std::future::pending().await,
                    }
                } => None,
                out = conn.next_output() => Some(out),
            };

            match next {
                None => self.abandon_turn().await?,
                Some(Some(Ok(SynthesisOutput::Audio(bytes)))) => {
                    if !self.discarding() {
                        return Ok(AudioOutputEvent::new(bytes));
                    }
                }
                Some(Some(Ok(SynthesisOutput::Done))) => self.on_done(),
                Some(Some(Err(e))) => {
                    if e.is_transient() {
                        self.drop_connection().await;
                    }
                    return Err(e.into());
                }
                Some(None) => {
                    tracing::debug!(stage = "synthesis", "audio stream ended");
                    self.drop_connection().await;
                }
            }
        }
    }

    async fn drain(&mut self, output: &Outbox<AudioOutputEvent>) -> Result<(), StageError> {
        if self.unflushed {
            self.flush().await?;
        }
        let deadline = Instant::now() + self.drain_grace;
        while self.dones_received < self.flushes_sent {
            let Some(conn) = self.link.get() else {
                return Ok(());
            };
            match tokio::time::timeout_at(deadline, conn.next_output()).await {
                Err(_) => {
                    tracing::debug!(stage = "synthesis", "timed out waiting for trailing audio");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(SynthesisOutput::Done))) => self.on_done(),
                Ok(Some(Ok(SynthesisOutput::Audio(bytes)))) => {
                    if !self.discarding() {
                        output.emit(AudioOutputEvent::new(bytes)).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.drop_connection().await;
    }

    fn health(&self) -> StageHealth {
        self.link.health()
    }
}
