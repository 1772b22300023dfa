//! Turn pipeline integration tests
//!
//! Provider latency is simulated on a paused clock, so ordering and
//! cancellation scenarios run deterministically and instantly.

use std::sync::Arc;
use std::time::Duration;

use voiceclaw::config::PipelineConfig;
use voiceclaw::{AudioChunk, Error, Message, PipelineEvent, TurnController, TurnId, TurnState};

mod common;
use common::{
    ScriptedGenerator, ScriptedSynthesizer, Step, StubTranscriber, controller, controller_with,
    count, delivered, drain, next_event, providers, until_terminal,
};

fn config(max_concurrent_synthesis: usize) -> PipelineConfig {
    PipelineConfig {
        max_concurrent_synthesis,
        ..PipelineConfig::default()
    }
}

/// Poll until the active turn reaches `state`
async fn wait_for_state(controller: &TurnController, state: TurnState) -> TurnId {
    for _ in 0..500 {
        if let Some((id, current)) = controller.active_turn()
            && current == state
        {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("turn never reached {state}");
}

#[tokio::test(start_paused = true)]
async fn audio_is_delivered_in_sentence_order() {
    let generator = Arc::new(ScriptedGenerator::tokens(&["One. ", "Two. ", "Three. ", "Four."]));
    let synth = Arc::new(
        ScriptedSynthesizer::new()
            .with_delay("One.", Duration::from_millis(400))
            .with_delay("Two.", Duration::from_millis(100))
            .with_delay("Three.", Duration::from_millis(300))
            .with_delay("Four.", Duration::from_millis(10)),
    );
    let controller = controller_with(generator, Arc::clone(&synth), config(4));
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("count to four").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert_eq!(
        delivered(&events),
        vec![
            (0, "One.".to_string()),
            (1, "Two.".to_string()),
            (2, "Three.".to_string()),
            (3, "Four.".to_string()),
        ]
    );
    assert!(matches!(events.first(), Some(PipelineEvent::TurnStarted { .. })));
    assert_eq!(events.last(), Some(&PipelineEvent::TurnCompleted { turn_id }));
    assert!(synth.peak_concurrency() > 1, "synthesis calls should overlap");
}

#[tokio::test(start_paused = true)]
async fn concurrency_bound_is_respected() {
    let generator = Arc::new(ScriptedGenerator::tokens(&["A. B. C. D. E. F."]));
    let synth = Arc::new(ScriptedSynthesizer::new().with_default_delay(Duration::from_millis(100)));
    let controller = controller_with(generator, Arc::clone(&synth), config(2));
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("letters").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    let sequences: Vec<u32> = delivered(&events).into_iter().map(|(seq, _)| seq).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(synth.peak_concurrency(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_receives_every_chunk() {
    let generator = Arc::new(ScriptedGenerator::tokens(&[
        "A. B. C. D. E. F. G. H. I. J. K. L. M. N. O. P. Q. R. S. T.",
    ]));
    let synth = Arc::new(ScriptedSynthesizer::new().with_default_delay(Duration::from_millis(10)));
    let config = PipelineConfig {
        event_capacity: 4,
        ..PipelineConfig::default()
    };
    let controller = controller_with(generator, Arc::clone(&synth), config);
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("alphabet").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The stalled consumer holds synthesis back instead of losing audio
    assert!(synth.completed() < 20);
    assert_ne!(controller.active_turn(), Some((turn_id, TurnState::Completed)));

    let events = until_terminal(&mut rx, turn_id).await;
    let sequences: Vec<u32> = delivered(&events).into_iter().map(|(seq, _)| seq).collect();
    assert_eq!(sequences, (0..20).collect::<Vec<u32>>());
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::SynthesisFailed { .. })), 0);
    assert_eq!(events.last(), Some(&PipelineEvent::TurnCompleted { turn_id }));
}

#[tokio::test(start_paused = true)]
async fn response_text_precedes_completion() {
    let generator = Arc::new(ScriptedGenerator::tokens(&["Hel", "lo! How ", "are you?"]));
    let controller = controller(generator, Arc::new(ScriptedSynthesizer::new()));
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("hi").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    let texts: Vec<String> = delivered(&events).into_iter().map(|(_, text)| text).collect();
    assert_eq!(texts, vec!["Hello!", "How are you?"]);

    let response = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::ResponseText { text, no_reply: false, .. } if text == "Hello! How are you?"))
        .expect("response text published");
    assert!(response < events.len() - 1);
    assert_eq!(controller.active_turn(), Some((turn_id, TurnState::Completed)));
}

#[tokio::test(start_paused = true)]
async fn cancelling_while_speaking_stops_audio() {
    let generator = Arc::new(ScriptedGenerator::tokens(&["One. Two. Three."]));
    let synth = Arc::new(ScriptedSynthesizer::new().with_default_delay(Duration::from_millis(200)));
    let controller = controller_with(generator, Arc::clone(&synth), config(1));
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("count").await.unwrap();
    loop {
        let event = next_event(&mut rx).await;
        if let PipelineEvent::AudioChunkReady(AudioChunk { sequence: 0, .. }) = event {
            break;
        }
    }

    assert_eq!(controller.cancel_active_turn().await, Some(turn_id));
    assert_eq!(controller.cancel_active_turn().await, None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let after = drain(&mut rx);

    assert_eq!(after.first(), Some(&PipelineEvent::TurnCancelled { turn_id }));
    assert_eq!(count(&after, |e| matches!(e, PipelineEvent::TurnCancelled { .. })), 1);
    assert!(delivered(&after).is_empty());
    assert_eq!(count(&after, |e| matches!(e, PipelineEvent::TurnCompleted { .. })), 0);

    // The in-flight call finished but the third sentence was never started
    assert!(synth.calls() < 3);
    assert_eq!(synth.completed(), synth.calls());
    assert_eq!(controller.active_turn(), Some((turn_id, TurnState::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_generation_ignores_later_tokens() {
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Step::Token("Hello there. "),
        Step::Pause(Duration::from_secs(1)),
        Step::Token("More text."),
    ]));
    let synth = Arc::new(ScriptedSynthesizer::new());
    let controller = controller(generator, Arc::clone(&synth));
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("hi").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.cancel_active_turn().await, Some(turn_id));

    tokio::time::sleep(Duration::from_secs(3)).await;
    let events = drain(&mut rx);

    let cancelled_at = events
        .iter()
        .position(|e| *e == PipelineEvent::TurnCancelled { turn_id })
        .expect("cancellation published");
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::TurnCancelled { .. })), 1);
    assert!(delivered(&events[cancelled_at..]).is_empty());
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::ResponseText { .. })));
    assert_eq!(synth.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_without_turn_is_noop() {
    let controller = controller(
        Arc::new(ScriptedGenerator::tokens(&["unused."])),
        Arc::new(ScriptedSynthesizer::new()),
    );
    let mut rx = controller.take_events().unwrap();
    assert_eq!(controller.cancel_active_turn().await, None);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_reply_sentinel_stays_silent() {
    let generator = Arc::new(ScriptedGenerator::tokens(&["NO_REPLY"]));
    let synth = Arc::new(ScriptedSynthesizer::new());
    let controller = controller(Arc::clone(&generator), Arc::clone(&synth));
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("ok bye").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert!(delivered(&events).is_empty());
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::TurnCompleted { .. })), 1);
    assert!(events.contains(&PipelineEvent::ResponseText {
        turn_id,
        text: "NO_REPLY".to_string(),
        no_reply: true,
    }));
    assert_eq!(synth.calls(), 0);

    // The silent reply is not remembered
    let turn_id = controller.start_turn("again").await.unwrap();
    until_terminal(&mut rx, turn_id).await;
    assert_eq!(
        generator.requests()[1],
        vec![Message::user("ok bye"), Message::user("again")]
    );
}

#[tokio::test(start_paused = true)]
async fn split_and_lowercase_sentinel_is_detected() {
    let synth = Arc::new(ScriptedSynthesizer::new());
    let controller = controller(
        Arc::new(ScriptedGenerator::tokens(&[" no_", "reply \n"])),
        Arc::clone(&synth),
    );
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("hmm").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert!(delivered(&events).is_empty());
    assert_eq!(events.last(), Some(&PipelineEvent::TurnCompleted { turn_id }));
    assert_eq!(synth.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn mentioning_the_sentinel_is_a_normal_reply() {
    let controller = controller(
        Arc::new(ScriptedGenerator::tokens(&["I would never say NO_REPLY to you."])),
        Arc::new(ScriptedSynthesizer::new()),
    );
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("test").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert_eq!(delivered(&events).len(), 1);
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::ResponseText { no_reply: false, .. })));
}

#[tokio::test(start_paused = true)]
async fn synthesis_failure_substitutes_silence() {
    let controller = controller_with(
        Arc::new(ScriptedGenerator::tokens(&["First. ", "Second. ", "Third."])),
        Arc::new(ScriptedSynthesizer::new().failing_on("Second.")),
        config(3),
    );
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("three things").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert_eq!(
        delivered(&events),
        vec![
            (0, "First.".to_string()),
            (1, String::new()),
            (2, "Third.".to_string()),
        ]
    );
    assert_eq!(
        count(&events, |e| *e == PipelineEvent::SynthesisFailed { turn_id, sequence: 1 }),
        1
    );
    assert_eq!(events.last(), Some(&PipelineEvent::TurnCompleted { turn_id }));
}

#[tokio::test(start_paused = true)]
async fn synthesis_timeout_is_a_synthesis_failure() {
    let pipeline = PipelineConfig {
        synthesis_timeout: Duration::from_secs(1),
        ..PipelineConfig::default()
    };
    let controller = controller_with(
        Arc::new(ScriptedGenerator::tokens(&["Slow. Fast."])),
        Arc::new(ScriptedSynthesizer::new().with_delay("Slow.", Duration::from_secs(5))),
        pipeline,
    );
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("go").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert_eq!(
        delivered(&events),
        vec![(0, String::new()), (1, "Fast.".to_string())]
    );
    assert!(events.contains(&PipelineEvent::SynthesisFailed { turn_id, sequence: 0 }));
    assert_eq!(events.last(), Some(&PipelineEvent::TurnCompleted { turn_id }));
}

#[tokio::test(start_paused = true)]
async fn start_turn_fails_while_speaking() {
    let controller = controller(
        Arc::new(ScriptedGenerator::tokens(&["A slow sentence."])),
        Arc::new(ScriptedSynthesizer::new().with_default_delay(Duration::from_secs(1))),
    );
    let mut rx = controller.take_events().unwrap();

    let first = controller.start_turn("one").await.unwrap();
    assert_eq!(wait_for_state(&controller, TurnState::Speaking).await, first);

    assert!(matches!(controller.start_turn("two").await, Err(Error::TurnActive(id)) if id == first));

    controller.cancel_active_turn().await;
    let second = controller.start_turn("two").await.unwrap();
    assert_ne!(first, second);

    // After natural completion a new turn may start again
    until_terminal(&mut rx, second).await;
    assert!(controller.start_turn("three").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn generation_failure_before_text_fails_turn() {
    let synth = Arc::new(ScriptedSynthesizer::new());
    let controller = controller(
        Arc::new(ScriptedGenerator::unavailable("model offline")),
        Arc::clone(&synth),
    );
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("hello").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert!(matches!(
        events.last(),
        Some(PipelineEvent::TurnFailed { reason, .. }) if reason.contains("model offline")
    ));
    assert_eq!(count(&events, PipelineEvent::is_terminal), 1);
    assert!(delivered(&events).is_empty());
    assert_eq!(synth.calls(), 0);
    assert_eq!(controller.active_turn(), Some((turn_id, TurnState::Failed)));
}

#[tokio::test(start_paused = true)]
async fn stream_error_before_text_fails_turn() {
    let controller = controller(
        Arc::new(ScriptedGenerator::new(vec![Step::Token("  "), Step::Fail("reset")])),
        Arc::new(ScriptedSynthesizer::new()),
    );
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("hello").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;
    assert!(matches!(events.last(), Some(PipelineEvent::TurnFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn generation_failure_after_text_keeps_partial_reply() {
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Step::Token("First sentence. Sec"),
        Step::Token("ond"),
        Step::Fail("connection reset"),
    ]));
    let controller = controller(Arc::clone(&generator), Arc::new(ScriptedSynthesizer::new()));
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("talk").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::GenerationFailed { reason, .. } if reason.contains("connection reset")
    )));
    assert_eq!(
        delivered(&events),
        vec![(0, "First sentence.".to_string()), (1, "Second".to_string())]
    );
    assert_eq!(events.last(), Some(&PipelineEvent::TurnCompleted { turn_id }));
    assert_eq!(
        controller.history(),
        vec![Message::user("talk"), Message::assistant("First sentence. Second")]
    );
}

#[tokio::test(start_paused = true)]
async fn generation_timeout_fails_turn() {
    let pipeline = PipelineConfig {
        generation_timeout: Duration::from_secs(1),
        ..PipelineConfig::default()
    };
    let controller = controller_with(
        Arc::new(ScriptedGenerator::new(vec![
            Step::Pause(Duration::from_secs(10)),
            Step::Token("Too late."),
        ])),
        Arc::new(ScriptedSynthesizer::new()),
        pipeline,
    );
    let mut rx = controller.take_events().unwrap();

    let turn_id = controller.start_turn("hello").await.unwrap();
    let events = until_terminal(&mut rx, turn_id).await;

    assert!(matches!(
        events.last(),
        Some(PipelineEvent::TurnFailed { reason, .. }) if reason.contains("timed out")
    ));
}

#[tokio::test(start_paused = true)]
async fn utterance_barges_in_on_speaking_turn() {
    let transcriber = Arc::new(StubTranscriber::says("stop please"));
    let controller = TurnController::new(
        providers(
            Arc::clone(&transcriber),
            Arc::new(ScriptedGenerator::tokens(&["A long answer. ", "With two sentences."])),
            Arc::new(ScriptedSynthesizer::new().with_default_delay(Duration::from_millis(500))),
        ),
        PipelineConfig::default(),
    );
    let mut rx = controller.take_events().unwrap();

    let first = controller.start_turn("tell me everything").await.unwrap();
    wait_for_state(&controller, TurnState::Speaking).await;

    let second = controller.handle_utterance(b"RIFF\0\0\0\0WAVE").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(transcriber.calls(), 1);

    let events = until_terminal(&mut rx, second).await;
    let cancelled = events
        .iter()
        .position(|e| *e == PipelineEvent::TurnCancelled { turn_id: first })
        .expect("first turn cancelled");
    let transcript = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::TranscriptReady { text } if text == "stop please"))
        .expect("transcript published");
    let started = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::TurnStarted { turn_id, .. } if *turn_id == second))
        .expect("second turn started");

    assert!(cancelled < transcript && transcript < started);
    assert!(
        !events[cancelled..]
            .iter()
            .any(|e| matches!(e, PipelineEvent::AudioChunkReady(chunk) if chunk.turn_id == first))
    );
    assert_eq!(events.last(), Some(&PipelineEvent::TurnCompleted { turn_id: second }));
}

#[tokio::test(start_paused = true)]
async fn failed_transcription_keeps_listening() {
    let generator = Arc::new(ScriptedGenerator::tokens(&["unused."]));
    let controller = TurnController::new(
        providers(
            Arc::new(StubTranscriber::failing("no speech detected")),
            Arc::clone(&generator),
            Arc::new(ScriptedSynthesizer::new()),
        ),
        PipelineConfig::default(),
    );
    let mut rx = controller.take_events().unwrap();

    let result = controller.handle_utterance(b"RIFF\0\0\0\0WAVE").await;
    assert!(matches!(result, Err(Error::Transcription(_))));
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [PipelineEvent::TranscriptionFailed { reason }] if reason.contains("no speech detected")
    ));
    assert!(controller.active_turn().is_none());
    assert!(generator.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_feeds_the_next_turn() {
    let generator = Arc::new(ScriptedGenerator::tokens(&["Sure."]));
    let controller = controller(Arc::clone(&generator), Arc::new(ScriptedSynthesizer::new()));
    let mut rx = controller.take_events().unwrap();

    let first = controller.start_turn("hi").await.unwrap();
    until_terminal(&mut rx, first).await;
    let second = controller.start_turn("again").await.unwrap();
    until_terminal(&mut rx, second).await;

    assert_eq!(
        generator.requests()[1],
        vec![
            Message::user("hi"),
            Message::assistant("Sure."),
            Message::user("again"),
        ]
    );

    controller.clear_history(true);
    assert!(controller.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_reply_is_not_remembered() {
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Step::Token("Partial "),
        Step::Pause(Duration::from_secs(1)),
        Step::Token("reply."),
    ]));
    let controller = controller(Arc::clone(&generator), Arc::new(ScriptedSynthesizer::new()));

    controller.start_turn("hi").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.cancel_active_turn().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(controller.history(), vec![Message::user("hi")]);
}
