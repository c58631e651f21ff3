//! Generation stage: final transcripts in, response fragments out.
//!
//! Owns the conversation history. Each final transcript becomes a user turn and
//! one streamed request; every fragment of the response is forwarded with the
//! transcript's signal so a barge-in reaches synthesis too.

use crate::collaborator::{
    GenerationConnection, GenerationOptions, GenerationRequest, GenerationService, TokenStream,
};
use crate::pipeline::envelope::{Envelope, InterruptHandle};
use crate::pipeline::error::StageError;
use crate::pipeline::link::Link;
use crate::pipeline::stage::{Outbox, Stage, StageHealth};
use crate::pipeline::types::{GenerationChunkEvent, TranscriptEvent, Turn};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;

/// Request parameters and canned texts for the generation stage.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    /// Connect parameters.
    pub options: GenerationOptions,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// First entry of the history.
    pub system_prompt: String,
    /// Spoken when no response can be generated.
    pub fallback_message: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        use crate::defaults;
        Self {
            options: GenerationOptions::default(),
            model: defaults::GENERATION_MODEL.to_string(),
            temperature: defaults::GENERATION_TEMPERATURE,
            max_tokens: defaults::GENERATION_MAX_TOKENS,
            system_prompt: defaults::SYSTEM_PROMPT.to_string(),
            fallback_message: defaults::FALLBACK_MESSAGE.to_string(),
        }
    }
}

type ChunkEnvelope = Envelope<GenerationChunkEvent>;

pub struct GenerationStage {
    service: Arc<dyn GenerationService>,
    link: Link<Box<dyn GenerationConnection>>,
    settings: GenerationSettings,
    history: Vec<Turn>,
}

impl GenerationStage {
    pub fn new(service: Arc<dyn GenerationService>, settings: GenerationSettings) -> Self {
        let history = vec![Turn::system(settings.system_prompt.clone())];
        Self {
            service,
            link: Link::new("generation"),
            settings,
            history,
        }
    }

    /// Conversation so far, system prompt first.
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    fn request(&self) -> GenerationRequest {
        GenerationRequest {
            messages: self.history.clone(),
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    async fn connect(&mut self, initial: bool) -> Result<(), StageError> {
        let service = Arc::clone(&self.service);
        let options = self.settings.options.clone();
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

    /// Starts a request, reconnecting once if the connection has failed.
    async fn start_stream(&mut self) -> Result<TokenStream, StageError> {
        if self.link.is_degraded() {
            return Err(self.link.degraded_error());
        }
        if !self.link.is_connected() {
            self.connect(false).await?;
        }
        let request = self.request();
        let started = match self.link.get() {
            Some(conn) => conn.stream(request.clone()).await,
            None => return Err(self.link.degraded_error()),
        };
        match started {
            Ok(tokens) => Ok(tokens),
            Err(e) if e.is_transient() => {
                tracing::warn!(stage = "generation", error = %e, "request failed");
                self.drop_connection().await;
                self.connect(false).await?;
                let retried = match self.link.get() {
                    Some(conn) => conn.stream(request).await,
                    None => return Err(self.link.degraded_error()),
                };
                retried
                    .map_err(|e| self.link.degrade(format!("request failed after reconnect: {e}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Speaks the fallback message as a complete response.
    async fn respond_with_fallback(
        &mut self,
        signal: &InterruptHandle,
        output: &Outbox<ChunkEnvelope>,
    ) -> Result<(), StageError> {
        let message = self.settings.fallback_message.clone();
        self.history.push(Turn::assistant(message.clone()));
        output
            .emit(Envelope::with_signal(
                GenerationChunkEvent::token(message),
                signal.clone(),
            ))
            .await?;
        output
            .emit(Envelope::with_signal(
                GenerationChunkEvent::end_of_response(),
                signal.clone(),
            ))
            .await
    }
}

#[async_trait]
impl Stage for GenerationStage {
    type Input = Envelope<TranscriptEvent>;
    type Output = ChunkEnvelope;

    fn name(&self) -> &'static str {
        "generation"
    }

    async fn open(&mut self) -> Result<(), StageError> {
        self.connect(true).await
    }

    async fn process(
        &mut self,
        envelope: Envelope<TranscriptEvent>,
        output: &Outbox<ChunkEnvelope>,
    ) -> Result<(), StageError> {
        let (event, signal) = envelope.into_parts();
        if !event.is_final {
            return Ok(());
        }
        if signal.is_set() {
            tracing::debug!(turn = signal.id(), "turn interrupted before generation");
            return Ok(());
        }
        let text = event.text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.history.push(Turn::user(text));

        let mut tokens = match self.start_stream().await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.respond_with_fallback(&signal, output).await?;
                return Err(e);
            }
        };

        let mut response = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = signal.interrupted() => None,
                token = tokens.next() => Some(token),
            };
            match next {
                None => {
                    drop(tokens);
                    tracing::debug!(turn = signal.id(), "barge-in, generation cancelled");
                    if !response.is_empty() {
                        self.history.push(Turn::assistant(response));
                    }
                    return Ok(());
                }
                Some(None) => break,
                Some(Some(Ok(token))) => {
                    if token.is_empty() {
                        continue;
                    }
                    response.push_str(&token);
                    output
                        .emit(Envelope::with_signal(
                            GenerationChunkEvent::token(token),
                            signal.clone(),
                        ))
                        .await?;
                }
                Some(Some(Err(e))) => {
                    drop(tokens);
                    if e.is_transient() {
                        self.drop_connection().await;
                    }
                    if !response.is_empty() {
                        self.history.push(Turn::assistant(response));
                    }
                    output
                        .emit(Envelope::with_signal(
                            GenerationChunkEvent::end_of_response(),
                            signal.clone(),
                        ))
                        .await?;
                    return Err(e.into());
                }
            }
        }

        self.history.push(Turn::assistant(response));
        output
            .emit(Envelope::with_signal(
                GenerationChunkEvent::end_of_response(),
                signal,
            ))
            .await
    }

    async fn close(&mut self) {
        self.drop_connection().await;
        self.history.clear();
    }

    fn health(&self) -> StageHealth {
        self.link.health()
    }
}
