use crate::helpers::{Harness, HarnessOptions, WAIT, loud_frame, wait_for_state};
use duplex_voice::AudioFrame;
use duplex_voice::audio::PushOutcome;
use duplex_voice::{AssistantState, RuntimeEvent};
use std::time::Duration;

fn silent_frame(index: u64) -> AudioFrame {
    AudioFrame::new(vec![0; 1_600], 16_000, 1, index)
}

/// Poll until the recognizer has received `expected` frames in total.
async fn wait_for_frames(h: &Harness, expected: usize) -> usize {
    let mut total = 0;
    let _ = tokio::time::timeout(WAIT, async {
        while total < expected {
            total += h.recognition.frames_received();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    total
}

#[tokio::test]
async fn speech_frames_reach_the_recognizer_and_silence_does_not() {
    let h = Harness::start().await;
    let audio = h.handle.audio();

    for i in 0..5 {
        assert_eq!(audio.push(silent_frame(i)), PushOutcome::Queued);
    }
    for i in 5..10 {
        assert_eq!(audio.push(loud_frame(i)), PushOutcome::Queued);
    }

    assert_eq!(wait_for_frames(&h, 5).await, 5);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.recognition.frames_received(), 0);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn frames_captured_while_speaking_are_not_forwarded() {
    let mut options = HarnessOptions::new();
    options.play_ms = 400;
    let mut h = Harness::start_with(options).await;
    let audio = h.handle.audio();

    h.recognition.say("say something long").await;
    wait_for_state(&h.handle, AssistantState::Speaking).await;
    for i in 0..5 {
        audio.push(loud_frame(i));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.recognition.frames_received(), 0);

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
    // Past the echo tail, the microphone is live again.
    tokio::time::sleep(Duration::from_millis(250)).await;
    for i in 5..8 {
        audio.push(loud_frame(i));
    }
    assert_eq!(wait_for_frames(&h, 3).await, 3);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_the_audio_channel() {
    let h = Harness::start().await;
    let audio = h.handle.audio();
    h.handle.shutdown().await.unwrap();
    assert!(audio.is_closed());
    assert_eq!(audio.push(loud_frame(0)), PushOutcome::Closed);
}
