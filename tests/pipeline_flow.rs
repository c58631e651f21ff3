//! End-to-end tests driving the public pipeline API with the scripted collaborators.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use voicepipe::collaborator::RecognitionOptions;
use voicepipe::collaborator::scripted::{ScriptedGenerator, ScriptedRecognizer, ScriptedSynthesizer};
use voicepipe::pipeline::stage::StageState;
use voicepipe::pipeline::types::{AudioChunk, AudioOutputEvent};
use voicepipe::{
    Collaborators, ErrorReporter, Pipeline, PipelineConfig, PipelineHandle, StageError,
};

/// Reporter that keeps every reported error.
#[derive(Default, Clone)]
struct Recorded {
    errors: Arc<Mutex<Vec<(String, StageError)>>>,
}

impl Recorded {
    fn for_stage(&self, stage: &str) -> Vec<StageError> {
        self.errors
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == stage)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl ErrorReporter for Recorded {
    fn report(&self, stage: &str, error: &StageError) {
        self.errors
            .lock()
            .unwrap()
            .push((stage.to_string(), error.clone()));
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        drain_timeout: Duration::from_millis(150),
        close_timeout: Duration::from_millis(150),
        end_of_input_grace: Duration::from_millis(200),
        ..PipelineConfig::default()
    }
}

fn chunk(text: &str) -> AudioChunk {
    AudioChunk::from(text.as_bytes())
}

fn text_of(events: &[AudioOutputEvent]) -> String {
    let bytes: Vec<u8> = events.iter().flat_map(|e| e.chunk.clone()).collect();
    String::from_utf8(bytes).unwrap()
}

/// Reads outputs until the stream ends.
async fn collect_outputs(handle: &mut PipelineHandle) -> Vec<AudioOutputEvent> {
    let mut events = Vec::new();
    while let Some(event) =
        tokio::time::timeout(Duration::from_secs(5), handle.next_output())
            .await
            .expect("output stream did not end")
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_utterance_is_answered_with_audio() {
    let mut handle = Pipeline::new(
        fast_config(),
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(ScriptedGenerator::default()),
            synthesis: Arc::new(ScriptedSynthesizer::new()),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    handle.feed(chunk("what time is it")).await.unwrap();
    handle.finish().await.unwrap();

    let events = collect_outputs(&mut handle).await;
    assert_eq!(text_of(&events), "You said: what time is it");
    handle.terminate().await;
}

#[tokio::test]
async fn test_finish_answers_every_queued_utterance_in_order() {
    let generator = ScriptedGenerator::default();
    let mut handle = Pipeline::new(
        PipelineConfig {
            barge_in: false,
            ..fast_config()
        },
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(generator.clone()),
            synthesis: Arc::new(ScriptedSynthesizer::new()),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    handle.feed(chunk("hello")).await.unwrap();
    handle.feed(chunk("goodbye")).await.unwrap();
    handle.finish().await.unwrap();

    let events = collect_outputs(&mut handle).await;
    assert_eq!(text_of(&events), "You said: helloYou said: goodbye");
    assert_eq!(generator.requests().len(), 2);

    // Stages stop on their own after a graceful finish.
    handle.terminate().await;
    assert!(handle.health().all_terminated());
}

#[tokio::test]
async fn test_terminate_releases_every_connection() {
    let recognizer = ScriptedRecognizer::new();
    let generator = ScriptedGenerator::fixed("one moment please");
    let synthesizer = ScriptedSynthesizer::new();
    let stats = [recognizer.stats(), generator.stats(), synthesizer.stats()];

    let mut handle = Pipeline::new(
        fast_config(),
        Collaborators {
            recognition: Arc::new(recognizer),
            generation: Arc::new(generator),
            synthesis: Arc::new(synthesizer),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    handle.feed(chunk("hi")).await.unwrap();
    handle.next_output().await.unwrap();
    handle.terminate().await;

    for report in handle.health().stages {
        assert_eq!(report.state, StageState::Terminated, "{}", report.name);
    }
    for stats in &stats {
        assert_eq!(stats.connects(), 1);
        assert_eq!(stats.closes(), 1);
        assert_eq!(stats.open_connections(), 0);
    }

    // A terminated pipeline refuses input.
    assert!(handle.feed(chunk("anyone there")).await.is_err());
}

#[tokio::test]
async fn test_interrupt_cuts_off_response_in_flight() {
    let long_reply = "let me walk you through every single option we have on the menu today";
    let generator =
        ScriptedGenerator::fixed(long_reply).with_token_delay(Duration::from_millis(30));
    let generator_stats = generator.stats();

    let mut handle = Pipeline::new(
        fast_config(),
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(generator),
            synthesis: Arc::new(ScriptedSynthesizer::new()),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    handle.feed(chunk("what is on the menu")).await.unwrap();
    let first = handle.next_output().await.unwrap();
    assert!(handle.interrupt());
    assert!(!handle.interrupt());

    handle.finish().await.unwrap();
    let mut events = vec![first];
    events.extend(collect_outputs(&mut handle).await);

    let spoken = text_of(&events);
    assert!(long_reply.starts_with(&spoken), "unexpected audio: {spoken}");
    assert!(spoken.len() < long_reply.len());
    assert_eq!(generator_stats.cancelled_requests(), 1);
    handle.terminate().await;
}

#[tokio::test]
async fn test_new_speech_replaces_response_in_flight() {
    let generator = ScriptedGenerator::default().with_token_delay(Duration::from_millis(30));
    let generator_stats = generator.stats();

    let mut handle = Pipeline::new(
        fast_config(),
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(generator),
            synthesis: Arc::new(ScriptedSynthesizer::new()),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    handle
        .feed(chunk("tell me a very long story about the sea and the ships"))
        .await
        .unwrap();
    handle.next_output().await.unwrap();
    handle.feed(chunk("stop")).await.unwrap();
    handle.finish().await.unwrap();

    let spoken = text_of(&collect_outputs(&mut handle).await);
    assert!(spoken.ends_with("You said: stop"), "unexpected audio: {spoken}");
    assert!(!spoken.contains("ships"));
    assert_eq!(generator_stats.cancelled_requests(), 1);
    handle.terminate().await;
}

#[tokio::test]
async fn test_stalled_synthesis_terminates_within_bound() {
    let synthesizer = ScriptedSynthesizer::new().stall_sends();
    let stats = synthesizer.stats();
    let config = fast_config();
    let bound = config.drain_timeout + config.close_timeout * 3 + Duration::from_millis(500);

    let mut handle = Pipeline::new(
        config,
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(ScriptedGenerator::fixed("this never gets spoken")),
            synthesis: Arc::new(synthesizer),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    handle.feed(chunk("hello")).await.unwrap();
    // Let the response reach the stuck synthesizer.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    handle.terminate().await;
    assert!(started.elapsed() < bound, "terminate took {:?}", started.elapsed());
    assert!(handle.health().all_terminated());
    assert_eq!(stats.closes(), 1);
    assert_eq!(stats.open_connections(), 0);
}

#[tokio::test]
async fn test_recognition_degrades_after_failed_reconnect() {
    let recognizer = ScriptedRecognizer::new()
        .drop_after_chunks(0)
        .fail_connects_after(1);
    let stats = recognizer.stats();
    let reporter = Recorded::default();

    let mut handle = Pipeline::new(
        fast_config(),
        Collaborators {
            recognition: Arc::new(recognizer),
            generation: Arc::new(ScriptedGenerator::default()),
            synthesis: Arc::new(ScriptedSynthesizer::new()),
        },
    )
    .unwrap()
    .with_error_reporter(Arc::new(reporter.clone()))
    .start()
    .unwrap();

    handle.feed(chunk("hello")).await.unwrap();
    handle.feed(chunk("still there")).await.unwrap();
    handle.finish().await.unwrap();

    // No transcripts, so no audio; the stream still ends.
    assert!(collect_outputs(&mut handle).await.is_empty());
    handle.terminate().await;

    let health = handle.health();
    assert_eq!(health.degraded(), vec!["recognition"]);
    assert!(health.all_terminated());
    assert_eq!(stats.connect_attempts(), 2);
    assert_eq!(stats.open_connections(), 0);

    let errors = reporter.for_stage("recognition");
    assert!(errors.iter().any(|e| matches!(e, StageError::Degraded(_))));
}

#[tokio::test]
async fn test_generation_failure_speaks_fallback() {
    let mut handle = Pipeline::new(
        fast_config(),
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(ScriptedGenerator::default().fail_requests()),
            synthesis: Arc::new(ScriptedSynthesizer::new()),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    handle.feed(chunk("are you open")).await.unwrap();
    handle.finish().await.unwrap();

    let spoken = text_of(&collect_outputs(&mut handle).await);
    assert_eq!(spoken, voicepipe::defaults::FALLBACK_MESSAGE);
    handle.terminate().await;
    assert_eq!(handle.health().degraded(), vec!["generation"]);
}

#[tokio::test]
async fn test_feed_suspends_when_downstream_is_stuck() {
    let config = PipelineConfig {
        recognition_queue: 1,
        generation_queue: 1,
        synthesis_queue: 1,
        output_queue: 1,
        recognition: RecognitionOptions {
            interim_results: false,
            ..RecognitionOptions::default()
        },
        ..fast_config()
    };
    let mut handle = Pipeline::new(
        config,
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(ScriptedGenerator::fixed("a b c d e f g h")),
            synthesis: Arc::new(ScriptedSynthesizer::new().stall_sends()),
        },
    )
    .unwrap()
    .start()
    .unwrap();

    let mut accepted = 0;
    let mut suspended = false;
    for i in 0..50 {
        let feed = handle.feed(chunk(&format!("utterance {i}")));
        match tokio::time::timeout(Duration::from_millis(100), feed).await {
            Ok(result) => {
                result.unwrap();
                accepted += 1;
            }
            Err(_) => {
                suspended = true;
                break;
            }
        }
    }
    assert!(suspended, "accepted all {accepted} chunks without suspending");
    assert!(handle.try_feed(chunk("one more")).is_err());

    handle.terminate().await;
    assert!(handle.health().all_terminated());
}

#[test]
fn test_runs_on_injected_current_thread_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut handle = Pipeline::new(
        fast_config(),
        Collaborators {
            recognition: Arc::new(ScriptedRecognizer::new()),
            generation: Arc::new(ScriptedGenerator::fixed("done")),
            synthesis: Arc::new(ScriptedSynthesizer::new()),
        },
    )
    .unwrap()
    .with_runtime(runtime.handle().clone())
    .start()
    .unwrap();

    let spoken = runtime.block_on(async {
        handle.feed(chunk("ping")).await.unwrap();
        handle.finish().await.unwrap();
        let events = collect_outputs(&mut handle).await;
        handle.terminate().await;
        text_of(&events)
    });

    assert_eq!(spoken, "done");
    assert!(handle.health().all_terminated());
}
