//! In-process collaborators driven by scripts instead of network services.
//!
//! The recognizer treats each audio chunk as UTF-8 text and "recognizes" it verbatim,
//! the generator streams a canned or echoed reply word by word, and the synthesizer
//! returns the bytes of the text it was asked to speak. Each service exposes
//! [`ConnectionStats`], the options of its last connect, and knobs for injecting
//! failures and stalls.

use super::{
    CollaboratorError, GenerationConnection, GenerationOptions, GenerationRequest,
    GenerationService, RecognitionConnection, RecognitionOptions, RecognitionService,
    SynthesisConnection, SynthesisOptions, SynthesisOutput, SynthesisService, TokenStream,
};
use crate::pipeline::types::{AudioChunk, Role, TranscriptEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Confidence reported for final transcripts.
pub const FINAL_CONFIDENCE: f32 = 0.95;
const INTERIM_CONFIDENCE: f32 = 0.5;

/// Counters shared by a scripted service and every connection it opened.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connect_attempts: AtomicU32,
    connects: AtomicU32,
    closes: AtomicU32,
    requests: AtomicU32,
    cancelled_requests: AtomicU32,
    flushes: AtomicU32,
}

impl ConnectionStats {
    /// Every call to `connect`, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections released, counted once per connection.
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> u32 {
        self.connects().saturating_sub(self.closes())
    }

    /// Generation requests started.
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Generation streams dropped before they completed.
    pub fn cancelled_requests(&self) -> u32 {
        self.cancelled_requests.load(Ordering::SeqCst)
    }

    /// End-of-stream messages received by the synthesizer.
    pub fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn begin_connect(&self, fail_after: Option<u32>) -> Result<(), CollaboratorError> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if fail_after.is_some_and(|n| attempt >= n) {
            return Err(CollaboratorError::Connection("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts a connection as closed exactly once, on `close` or on drop.
struct CloseGuard {
    stats: Arc<ConnectionStats>,
    closed: bool,
}

impl CloseGuard {
    fn new(stats: Arc<ConnectionStats>) -> Self {
        Self {
            stats,
            closed: false,
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scripted services run without a key, but a blank one is rejected.
fn check_key(valid: bool, api_key: Option<&str>) -> Result<(), CollaboratorError> {
    if !valid {
        return Err(CollaboratorError::Credentials("missing api key".into()));
    }
    if api_key.is_some_and(|key| key.trim().is_empty()) {
        return Err(CollaboratorError::Credentials("empty api key".into()));
    }
    Ok(())
}

/// Options passed to the most recent `connect`.
type LastOptions<T> = Arc<Mutex<Option<T>>>;

fn remember<T: Clone>(slot: &LastOptions<T>, options: &T) {
    if let Ok(mut last) = slot.lock() {
        *last = Some(options.clone());
    }
}

fn recall<T: Clone>(slot: &LastOptions<T>) -> Option<T> {
    slot.lock().ok().and_then(|last| last.clone())
}

// ----------------------------------------------------------------------------
// Recognition
// ----------------------------------------------------------------------------

/// Recognizer that transcribes UTF-8 "audio" verbatim.
#[derive(Debug, Clone)]
pub struct ScriptedRecognizer {
    stats: Arc<ConnectionStats>,
    fail_connects_after: Option<u32>,
    drop_after_chunks: Option<u32>,
    credentials_valid: bool,
    options: LastOptions<RecognitionOptions>,
}

impl Default for ScriptedRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(ConnectionStats::default()),
            fail_connects_after: None,
            drop_after_chunks: None,
            credentials_valid: true,
            options: Arc::default(),
        }
    }

    /// Connection attempts after the first `n` are refused.
    pub fn fail_connects_after(mut self, n: u32) -> Self {
        self.fail_connects_after = Some(n);
        self
    }

    /// Each connection resets after accepting `n` chunks.
    pub fn drop_after_chunks(mut self, n: u32) -> Self {
        self.drop_after_chunks = Some(n);
        self
    }

    pub fn with_invalid_credentials(mut self) -> Self {
        self.credentials_valid = false;
        self
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub fn connect_options(&self) -> Option<RecognitionOptions> {
        recall(&self.options)
    }
}

#[async_trait]
impl RecognitionService for ScriptedRecognizer {
    fn check_credentials(&self, options: &RecognitionOptions) -> Result<(), CollaboratorError> {
        check_key(self.credentials_valid, options.api_key.as_deref())
    }

    async fn connect(
        &self,
        options: &RecognitionOptions,
    ) -> Result<Box<dyn RecognitionConnection>, CollaboratorError> {
        remember(&self.options, options);
        self.stats.begin_connect(self.fail_connects_after)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(ScriptedRecognition {
            tx: Some(tx),
            rx,
            sent: 0,
            drop_after: self.drop_after_chunks,
            interim_results: options.interim_results,
            guard: CloseGuard::new(Arc::clone(&self.stats)),
        }))
    }
}

struct ScriptedRecognition {
    tx: Option<mpsc::UnboundedSender<TranscriptEvent>>,
    rx: mpsc::UnboundedReceiver<TranscriptEvent>,
    sent: u32,
    drop_after: Option<u32>,
    interim_results: bool,
    guard: CloseGuard,
}

#[async_trait]
impl RecognitionConnection for ScriptedRecognition {
    async fn send_audio(&mut self, chunk: &AudioChunk) -> Result<(), CollaboratorError> {
        if self.guard.closed {
            return Err(CollaboratorError::Closed);
        }
        if self.drop_after.is_some_and(|n| self.sent >= n) {
            return Err(CollaboratorError::Connection("stream reset by peer".into()));
        }
        let Some(tx) = &self.tx else {
            return Err(CollaboratorError::Closed);
        };
        self.sent += 1;

        let text = std::str::from_utf8(&chunk.data)
            .map_err(|_| CollaboratorError::Protocol("audio frame is not decodable".into()))?
            .trim();
        if text.is_empty() {
            return Ok(());
        }
        if self.interim_results {
            let partial = text.split_whitespace().next().unwrap_or(text);
            tx.send(TranscriptEvent::interim(partial, INTERIM_CONFIDENCE)).ok();
        }
        tx.send(TranscriptEvent::final_text(text, FINAL_CONFIDENCE)).ok();
        Ok(())
    }

    async fn next_transcript(&mut self) -> Option<Result<TranscriptEvent, CollaboratorError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn finish(&mut self) -> Result<(), CollaboratorError> {
        self.tx = None;
        Ok(())
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
        self.guard.close();
    }
}

// ----------------------------------------------------------------------------
// Generation
// ----------------------------------------------------------------------------

/// What the scripted generator answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The same text for every request.
    Fixed(String),
    /// "You said: <last user turn>".
    Echo,
}

/// Generator that streams its reply one word at a time.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    stats: Arc<ConnectionStats>,
    reply: Reply,
    token_delay: Option<Duration>,
    fail_connects_after: Option<u32>,
    fail_requests: bool,
    stall: bool,
    fail_after_tokens: Option<usize>,
    credentials_valid: bool,
    seen: Arc<Mutex<Vec<GenerationRequest>>>,
    options: LastOptions<GenerationOptions>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new(Reply::Echo)
    }
}

impl ScriptedGenerator {
    pub fn new(reply: Reply) -> Self {
        Self {
            stats: Arc::new(ConnectionStats::default()),
            reply,
            token_delay: None,
            fail_connects_after: None,
            fail_requests: false,
            stall: false,
            fail_after_tokens: None,
            credentials_valid: true,
            seen: Arc::new(Mutex::new(Vec::new())),
            options: Arc::default(),
        }
    }

    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(Reply::Fixed(text.into()))
    }

    /// Sleep before each token.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    pub fn fail_connects_after(mut self, n: u32) -> Self {
        self.fail_connects_after = Some(n);
        self
    }

    /// Every request fails with a connection error.
    pub fn fail_requests(mut self) -> Self {
        self.fail_requests = true;
        self
    }

    /// After the last token the stream hangs instead of ending.
    pub fn stall_after_reply(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Each stream is reset after yielding `n` tokens.
    pub fn fail_after_tokens(mut self, n: usize) -> Self {
        self.fail_after_tokens = Some(n);
        self
    }

    pub fn with_invalid_credentials(mut self) -> Self {
        self.credentials_valid = false;
        self
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.seen.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn connect_options(&self) -> Option<GenerationOptions> {
        recall(&self.options)
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    fn check_credentials(&self, options: &GenerationOptions) -> Result<(), CollaboratorError> {
        check_key(self.credentials_valid, options.api_key.as_deref())
    }

    async fn connect(
        &self,
        options: &GenerationOptions,
    ) -> Result<Box<dyn GenerationConnection>, CollaboratorError> {
        remember(&self.options, options);
        self.stats.begin_connect(self.fail_connects_after)?;
        Ok(Box::new(ScriptedGeneration {
            config: self.clone(),
            guard: CloseGuard::new(Arc::clone(&self.stats)),
        }))
    }
}

struct ScriptedGeneration {
    config: ScriptedGenerator,
    guard: CloseGuard,
}

/// Counts the request as cancelled unless the stream ran to completion.
struct RequestGuard {
    stats: Arc<ConnectionStats>,
    completed: bool,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.stats.cancelled_requests.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ReplyState {
    tokens: VecDeque<String>,
    delay: Option<Duration>,
    stall: bool,
    /// Tokens left before the stream is reset.
    reset_in: Option<usize>,
    guard: RequestGuard,
}

#[async_trait]
impl GenerationConnection for ScriptedGeneration {
    async fn stream(
        &mut self,
        request: GenerationRequest,
    ) -> Result<TokenStream, CollaboratorError> {
        if self.guard.closed {
            return Err(CollaboratorError::Closed);
        }
        let config = &self.config;
        config.stats.requests.fetch_add(1, Ordering::SeqCst);
        let text = match &config.reply {
            Reply::Fixed(text) => text.clone(),
            Reply::Echo => {
                let last = request
                    .messages
                    .iter()
                    .rev()
                    .find(|turn| turn.role == Role::User)
                    .map(|turn| turn.content.as_str())
                    .unwrap_or_default();
                format!("You said: {last}")
            }
        };
        if let Ok(mut seen) = config.seen.lock() {
            seen.push(request);
        }
        if config.fail_requests {
            return Err(CollaboratorError::Connection("upstream unavailable".into()));
        }

        let state = ReplyState {
            tokens: text.split_inclusive(' ').map(str::to_string).collect(),
            delay: config.token_delay,
            stall: config.stall,
            reset_in: config.fail_after_tokens,
            guard: RequestGuard {
                stats: Arc::clone(&config.stats),
                completed: false,
            },
        };
        let tokens = stream::unfold(state, |mut state| async move {
            if let Some(left) = state.reset_in {
                if left == 0 {
                    // The stream ends after the error.
                    state.reset_in = None;
                    state.tokens.clear();
                    state.stall = false;
                    let reset = CollaboratorError::Connection("stream reset".into());
                    return Some((Err(reset), state));
                }
                state.reset_in = Some(left - 1);
            }
            match state.tokens.pop_front() {
                Some(token) => {
                    if let Some(delay) = state.delay {
                        tokio::time::sleep(delay).await;
                    }
                    Some((Ok(token), state))
                }
                None => {
                    if state.stall {
                        std::future::pending::<()>().await;
                    }
                    state.guard.completed = true;
                    None
                }
            }
        });
        Ok(tokens.boxed())
    }

    async fn close(&mut self) {
        self.guard.close();
    }
}

// ----------------------------------------------------------------------------
// Synthesis
// ----------------------------------------------------------------------------

/// Synthesizer whose "audio" is the bytes of the text it receives.
#[derive(Debug, Clone)]
pub struct ScriptedSynthesizer {
    stats: Arc<ConnectionStats>,
    fail_connects_after: Option<u32>,
    stall_sends: bool,
    credentials_valid: bool,
    options: LastOptions<SynthesisOptions>,
}

impl Default for ScriptedSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(ConnectionStats::default()),
            fail_connects_after: None,
            stall_sends: false,
            credentials_valid: true,
            options: Arc::default(),
        }
    }

    pub fn fail_connects_after(mut self, n: u32) -> Self {
        self.fail_connects_after = Some(n);
        self
    }

    /// `send_text` never completes, as if the service stopped reading.
    pub fn stall_sends(mut self) -> Self {
        self.stall_sends = true;
        self
    }

    pub fn with_invalid_credentials(mut self) -> Self {
        self.credentials_valid = false;
        self
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub fn connect_options(&self) -> Option<SynthesisOptions> {
        recall(&self.options)
    }
}

#[async_trait]
impl SynthesisService for ScriptedSynthesizer {
    fn check_credentials(&self, options: &SynthesisOptions) -> Result<(), CollaboratorError> {
        check_key(self.credentials_valid, options.api_key.as_deref())
    }

    async fn connect(
        &self,
        options: &SynthesisOptions,
    ) -> Result<Box<dyn SynthesisConnection>, CollaboratorError> {
        remember(&self.options, options);
        self.stats.begin_connect(self.fail_connects_after)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(ScriptedSynthesis {
            tx,
            rx,
            stall_sends: self.stall_sends,
            guard: CloseGuard::new(Arc::clone(&self.stats)),
        }))
    }
}

struct ScriptedSynthesis {
    tx: mpsc::UnboundedSender<SynthesisOutput>,
    rx: mpsc::UnboundedReceiver<SynthesisOutput>,
    stall_sends: bool,
    guard: CloseGuard,
}

#[async_trait]
impl SynthesisConnection for ScriptedSynthesis {
    async fn send_text(&mut self, text: &str) -> Result<(), CollaboratorError> {
        if self.guard.closed {
            return Err(CollaboratorError::Closed);
        }
        if self.stall_sends {
            std::future::pending::<()>().await;
        }
        if !text.is_empty() {
            self.tx
                .send(SynthesisOutput::Audio(text.as_bytes().to_vec()))
                .map_err(|_| CollaboratorError::Closed)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), CollaboratorError> {
        if self.guard.closed {
            return Err(CollaboratorError::Closed);
        }
        self.guard.stats.flushes.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(SynthesisOutput::Done)
            .map_err(|_| CollaboratorError::Closed)
    }

    async fn next_output(&mut self) -> Option<Result<SynthesisOutput, CollaboratorError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
        self.guard.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Turn;

    fn request(user: &str) -> GenerationRequest {
        GenerationRequest {
            messages: vec![Turn::system("be brief"), Turn::user(user)],
            model: "test".into(),
            temperature: 0.0,
            max_tokens: 16,
        }
    }

    #[tokio::test]
    async fn test_recognizer_emits_interim_then_final() {
        let recognizer = ScriptedRecognizer::new();
        let mut conn = recognizer.connect(&RecognitionOptions::default()).await.unwrap();
        conn.send_audio(&AudioChunk::from(&b"hello there"[..]))
            .await
            .unwrap();
        conn.finish().await.unwrap();

        let interim = conn.next_transcript().await.unwrap().unwrap();
        assert!(!interim.is_final);
        assert_eq!(interim.text, "hello");
        let final_event = conn.next_transcript().await.unwrap().unwrap();
        assert!(final_event.is_final);
        assert_eq!(final_event.text, "hello there");
        assert_eq!(final_event.confidence, FINAL_CONFIDENCE);
        assert!(conn.next_transcript().await.is_none());
    }

    #[tokio::test]
    async fn test_recognizer_rejects_undecodable_audio() {
        let recognizer = ScriptedRecognizer::new();
        let mut conn = recognizer.connect(&RecognitionOptions::default()).await.unwrap();
        let err = conn
            .send_audio(&AudioChunk::new(vec![0xff, 0xfe]))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_recognizer_failure_knobs() {
        let recognizer = ScriptedRecognizer::new()
            .fail_connects_after(1)
            .drop_after_chunks(1);
        let mut conn = recognizer.connect(&RecognitionOptions::default()).await.unwrap();
        conn.send_audio(&AudioChunk::from(&b"one"[..])).await.unwrap();
        let err = conn
            .send_audio(&AudioChunk::from(&b"two"[..]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(recognizer.connect(&RecognitionOptions::default()).await.is_err());
        assert_eq!(recognizer.stats().connect_attempts(), 2);
        assert_eq!(recognizer.stats().connects(), 1);
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let recognizer = ScriptedRecognizer::new();
        let mut conn = recognizer.connect(&RecognitionOptions::default()).await.unwrap();
        conn.close().await;
        conn.close().await;
        drop(conn);
        assert_eq!(recognizer.stats().closes(), 1);
        assert_eq!(recognizer.stats().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_generator_echoes_last_user_turn() {
        let generator = ScriptedGenerator::default();
        let mut conn = generator.connect(&GenerationOptions::default()).await.unwrap();
        let tokens: Vec<String> = conn
            .stream(request("hi"))
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens.concat(), "You said: hi");
        assert!(tokens.len() > 1);
        assert_eq!(generator.requests().len(), 1);
        assert_eq!(generator.stats().cancelled_requests(), 0);
    }

    #[tokio::test]
    async fn test_dropping_generation_stream_counts_as_cancelled() {
        let generator = ScriptedGenerator::fixed("one two three");
        let mut conn = generator.connect(&GenerationOptions::default()).await.unwrap();
        let mut tokens = conn.stream(request("hi")).await.unwrap();
        assert_eq!(tokens.next().await.unwrap().unwrap(), "one ");
        drop(tokens);
        assert_eq!(generator.stats().cancelled_requests(), 1);
    }

    #[tokio::test]
    async fn test_synthesizer_returns_text_bytes_then_done() {
        let synthesizer = ScriptedSynthesizer::new();
        let mut conn = synthesizer.connect(&SynthesisOptions::default()).await.unwrap();
        conn.send_text("hi ").await.unwrap();
        conn.flush().await.unwrap();
        assert_eq!(
            conn.next_output().await.unwrap().unwrap(),
            SynthesisOutput::Audio(b"hi ".to_vec())
        );
        assert_eq!(
            conn.next_output().await.unwrap().unwrap(),
            SynthesisOutput::Done
        );
        assert_eq!(synthesizer.stats().flushes(), 1);
    }

    #[tokio::test]
    async fn test_recognizer_honors_connect_options() {
        let recognizer = ScriptedRecognizer::new();
        let options = RecognitionOptions {
            language: "de-DE".into(),
            interim_results: false,
            ..RecognitionOptions::default()
        };
        let mut conn = recognizer.connect(&options).await.unwrap();
        conn.send_audio(&AudioChunk::from(&b"guten tag"[..]))
            .await
            .unwrap();
        conn.finish().await.unwrap();

        let event = conn.next_transcript().await.unwrap().unwrap();
        assert!(event.is_final);
        assert_eq!(event.text, "guten tag");
        assert!(conn.next_transcript().await.is_none());
        assert_eq!(recognizer.connect_options(), Some(options));
    }

    #[tokio::test]
    async fn test_generation_stream_reset_after_tokens() {
        let generator = ScriptedGenerator::fixed("one two three").fail_after_tokens(2);
        let mut conn = generator.connect(&GenerationOptions::default()).await.unwrap();
        let items: Vec<_> = conn.stream(request("hi")).await.unwrap().collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Ok("one ".to_string()));
        assert_eq!(items[1], Ok("two ".to_string()));
        assert!(items[2].as_ref().unwrap_err().is_transient());
    }

    #[test]
    fn test_invalid_credentials() {
        assert!(
            ScriptedSynthesizer::new()
                .with_invalid_credentials()
                .check_credentials(&SynthesisOptions::default())
                .is_err()
        );
        assert!(
            ScriptedGenerator::default()
                .check_credentials(&GenerationOptions::default())
                .is_ok()
        );
    }

    #[test]
    fn test_blank_api_key_is_rejected() {
        let options = RecognitionOptions {
            api_key: Some("  ".into()),
            ..RecognitionOptions::default()
        };
        let err = ScriptedRecognizer::new()
            .check_credentials(&options)
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Credentials(_)));
    }
}
