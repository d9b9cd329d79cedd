use crate::helpers::{Harness, HarnessOptions, WAIT, wait_for_state};
use duplex_voice::memory::TurnKind;
use duplex_voice::pipeline::messages::PlaybackOutcome;
use duplex_voice::{AssistantState, PlaybackEvent, RuntimeEvent, ShutdownReason};
use std::time::{Duration, Instant};

fn is_interrupted(event: &RuntimeEvent) -> bool {
    matches!(
        event,
        RuntimeEvent::Playback(PlaybackEvent::Ended {
            outcome: PlaybackOutcome::Interrupted,
            ..
        })
    )
}

fn is_turn_for(event: &RuntimeEvent, user_text: &str) -> bool {
    matches!(event, RuntimeEvent::TurnCompleted(turn) if turn.user_text == user_text)
}

#[tokio::test]
async fn every_final_transcript_gets_exactly_one_reply() {
    let mut h = Harness::start().await;

    h.recognition.hear_partial("what ti").await;
    h.turn("what time is it").await;
    h.turn("tell me a story").await;
    h.turn("thanks a lot").await;

    assert_eq!(
        h.dialogue.calls(),
        vec!["what time is it", "tell me a story", "thanks a lot"]
    );
    assert_eq!(h.sink.played(), vec!["Reply 1", "Reply 2", "Reply 3"]);
    assert_eq!(h.handle.state(), AssistantState::Listening);

    h.handle.shutdown().await.unwrap();
    assert_eq!(h.handle.state(), AssistantState::Idle);
}

#[tokio::test]
async fn hello_sets_practice_phrase_and_next_turn_is_evaluated() {
    let mut h = Harness::start().await;

    h.recognition.say("hello").await;
    let RuntimeEvent::TurnCompleted(turn) = h.next_event(|e| is_turn_for(e, "hello")).await else {
        unreachable!()
    };
    assert_eq!(turn.assistant_text, "Hi there!");
    assert_eq!(turn.kind, TurnKind::Dialogue);
    assert_eq!(turn.pending_target.as_deref(), Some("Nice to meet you"));
    wait_for_state(&h.handle, AssistantState::Listening).await;

    assert_eq!(h.sink.played(), vec!["Hi there!"]);
    assert_eq!(h.handle.pending_target().as_deref(), Some("Nice to meet you"));

    h.recognition.say("Nice to meet you").await;
    let RuntimeEvent::TurnCompleted(turn) = h
        .next_event(|e| is_turn_for(e, "Nice to meet you"))
        .await
    else {
        unreachable!()
    };
    assert_eq!(turn.kind, TurnKind::Evaluation { score: 92 });
    assert_eq!(turn.pending_target, None);
    wait_for_state(&h.handle, AssistantState::Listening).await;

    assert_eq!(
        h.evaluator.calls(),
        vec![("Nice to meet you".to_owned(), "Nice to meet you".to_owned())]
    );
    assert_eq!(h.dialogue.calls(), vec!["hello"]);
    assert_eq!(h.handle.pending_target(), None);
    assert_eq!(h.sink.played(), vec!["Hi there!", "Great pronunciation!"]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn echo_of_the_last_reply_does_not_start_a_turn() {
    let mut h = Harness::start().await;
    h.turn("what time is it").await;

    h.recognition.say("Reply 1.").await;
    let RuntimeEvent::EchoSuppressed { text, similarity } = h
        .next_event(|e| matches!(e, RuntimeEvent::EchoSuppressed { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(text, "Reply 1.");
    assert!(similarity >= 0.8);

    h.turn("and tomorrow").await;
    assert_eq!(h.dialogue.calls(), vec!["what time is it", "and tomorrow"]);
    assert_eq!(h.sink.played(), vec!["Reply 1", "Reply 2"]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_dialogue_is_answered_with_an_apology() {
    let mut h = Harness::start().await;
    let apology = duplex_voice::VoiceConfig::default().turn.apology_text;

    h.dialogue.set_failing(true);
    h.recognition.say("what's the weather").await;
    let RuntimeEvent::TurnCompleted(turn) = h
        .next_event(|e| is_turn_for(e, "what's the weather"))
        .await
    else {
        unreachable!()
    };
    assert_eq!(turn.kind, TurnKind::Apology);
    assert_eq!(turn.assistant_text, apology);
    wait_for_state(&h.handle, AssistantState::Listening).await;
    assert_eq!(h.handle.pending_target(), None);

    h.dialogue.set_failing(false);
    h.turn("try again").await;
    assert_eq!(h.sink.played(), vec![apology, "Reply 2".to_owned()]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn slow_dialogue_times_out_into_an_apology() {
    let mut options = HarnessOptions::new();
    options.config.turn.collaborator_timeout_ms = 100;
    let mut h = Harness::start_with(options).await;
    h.dialogue.set_delay(Duration::from_secs(3));

    let started = Instant::now();
    h.recognition.say("are you there").await;
    let RuntimeEvent::TurnCompleted(turn) =
        h.next_event(|e| is_turn_for(e, "are you there")).await
    else {
        unreachable!()
    };
    assert_eq!(turn.kind, TurnKind::Apology);
    assert!(started.elapsed() < Duration::from_secs(2));

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn termination_phrase_while_listening_stops_everything() {
    let mut h = Harness::start().await;

    let started = Instant::now();
    h.recognition.say("turn off").await;
    tokio::time::timeout(WAIT, h.handle.wait())
        .await
        .expect("coordinator did not stop")
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(h.handle.state(), AssistantState::Idle);
    assert!(h.handle.audio().is_closed());
    assert!(h.dialogue.calls().is_empty());

    let RuntimeEvent::Shutdown(reason) = h
        .next_event(|e| matches!(e, RuntimeEvent::Shutdown(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(reason, ShutdownReason::TerminationPhrase("turn off".into()));
}

#[tokio::test]
async fn termination_phrase_while_speaking_cuts_playback_short() {
    let mut options = HarnessOptions::new();
    options.play_ms = 5_000;
    let h = Harness::start_with(options).await;

    h.recognition.say("tell me everything").await;
    wait_for_state(&h.handle, AssistantState::Speaking).await;

    let started = Instant::now();
    h.recognition.say("Please turn off.").await;
    tokio::time::timeout(WAIT, h.handle.wait())
        .await
        .expect("coordinator did not stop")
        .unwrap();

    // Grace is 500ms; the 5s clip must not have been waited out.
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(h.handle.state(), AssistantState::Idle);
    assert!(h.sink.stops() >= 1);
}

#[tokio::test]
async fn termination_phrase_while_evaluating_abandons_the_turn() {
    let h = Harness::start().await;
    h.dialogue.set_delay(Duration::from_secs(3));

    h.recognition.say("a long question").await;
    wait_for_state(&h.handle, AssistantState::Evaluating).await;

    let started = Instant::now();
    h.recognition.say("exit").await;
    tokio::time::timeout(WAIT, h.handle.wait())
        .await
        .expect("coordinator did not stop")
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(h.handle.state(), AssistantState::Idle);
    assert!(h.sink.played().is_empty());
}

#[tokio::test]
async fn user_speech_during_playback_barges_in() {
    let mut options = HarnessOptions::new();
    options.play_ms = 3_000;
    let mut h = Harness::start_with(options).await;

    h.recognition.say("tell me a long story").await;
    wait_for_state(&h.handle, AssistantState::Speaking).await;
    h.sink.set_play_ms(20);

    h.recognition.say("wait, a question").await;
    h.next_event(is_interrupted).await;
    h.next_event(|e| is_turn_for(e, "wait, a question")).await;
    h.next_event(|e| {
        matches!(
            e,
            RuntimeEvent::StateChanged {
                from: AssistantState::Speaking,
                to: AssistantState::Listening,
            }
        )
    })
    .await;

    assert!(h.sink.stops() >= 1);
    assert_eq!(h.sink.played(), vec!["Reply 1", "Reply 2"]);
    assert_eq!(h.dialogue.calls().len(), 2);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn speech_during_playback_waits_when_barge_in_is_off() {
    let mut options = HarnessOptions::new();
    options.config.turn.barge_in = false;
    options.play_ms = 300;
    let mut h = Harness::start_with(options).await;

    h.recognition.say("first question").await;
    wait_for_state(&h.handle, AssistantState::Speaking).await;
    h.recognition.say("second question").await;

    h.next_event(|e| is_turn_for(e, "second question")).await;
    h.next_event(|e| {
        matches!(
            e,
            RuntimeEvent::StateChanged {
                from: AssistantState::Speaking,
                to: AssistantState::Listening,
            }
        )
    })
    .await;

    assert_eq!(h.sink.stops(), 0);
    assert_eq!(h.sink.played(), vec!["Reply 1", "Reply 2"]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn interrupt_returns_to_listening_and_player_accepts_more() {
    let mut options = HarnessOptions::new();
    options.play_ms = 3_000;
    let mut h = Harness::start_with(options).await;

    h.recognition.say("read me the news").await;
    wait_for_state(&h.handle, AssistantState::Speaking).await;

    let started = Instant::now();
    h.handle.interrupt().unwrap();
    wait_for_state(&h.handle, AssistantState::Listening).await;
    assert!(started.elapsed() < Duration::from_millis(500));
    h.next_event(is_interrupted).await;

    h.sink.set_play_ms(20);
    h.turn("something shorter").await;
    assert_eq!(h.sink.played(), vec!["Reply 1", "Reply 2"]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn interrupt_while_listening_is_ignored() {
    let mut h = Harness::start().await;
    h.handle.interrupt().unwrap();
    h.turn("still there?").await;
    assert_eq!(h.sink.played(), vec!["Reply 1"]);
    assert_eq!(h.sink.stops(), 0);
    h.handle.shutdown().await.unwrap();
}

fn is_back_to_listening(event: &RuntimeEvent) -> bool {
    matches!(
        event,
        RuntimeEvent::StateChanged {
            from: AssistantState::Speaking,
            to: AssistantState::Listening,
        }
    )
}

#[tokio::test]
async fn transcripts_held_while_evaluating_run_in_arrival_order() {
    let mut h = Harness::start().await;
    h.dialogue.set_delay(Duration::from_millis(300));

    h.recognition.say("first question").await;
    wait_for_state(&h.handle, AssistantState::Evaluating).await;
    h.recognition.say("second question").await;
    h.recognition.say("third question").await;

    h.next_event(|e| is_turn_for(e, "third question")).await;
    h.next_event(is_back_to_listening).await;

    assert_eq!(
        h.dialogue.calls(),
        vec!["first question", "second question", "third question"]
    );
    assert_eq!(h.sink.played(), vec!["Reply 1", "Reply 2", "Reply 3"]);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn barge_in_waits_behind_held_transcripts() {
    let mut options = HarnessOptions::new();
    options.play_ms = 3_000;
    let mut h = Harness::start_with(options).await;
    h.dialogue.set_delay(Duration::from_millis(300));

    // The practice phrase is spoken while the greeting is still being
    // generated, so it is held until the greeting plays.
    h.recognition.say("hello").await;
    wait_for_state(&h.handle, AssistantState::Evaluating).await;
    h.recognition.say("Nice to meet you").await;
    wait_for_state(&h.handle, AssistantState::Speaking).await;
    h.sink.set_play_ms(20);

    h.recognition.say("what does that mean").await;
    h.next_event(is_interrupted).await;
    h.next_event(|e| is_turn_for(e, "what does that mean")).await;
    h.next_event(is_back_to_listening).await;

    assert_eq!(
        h.evaluator.calls(),
        vec![("Nice to meet you".to_owned(), "Nice to meet you".to_owned())]
    );
    assert_eq!(h.dialogue.calls(), vec!["hello", "what does that mean"]);
    assert_eq!(
        h.sink.played(),
        vec!["Hi there!", "Great pronunciation!", "Reply 2"]
    );
    h.handle.shutdown().await.unwrap();
}
