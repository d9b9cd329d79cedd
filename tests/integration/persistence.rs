use crate::helpers::{BrokenTurnStore, Harness, HarnessOptions, WAIT};
use duplex_voice::memory::{JsonlTurnStore, TurnKind, TurnStore};
use std::sync::Arc;
use std::time::Duration;

/// Saves are fire-and-forget, so poll until `count` turns are on disk.
async fn wait_for_saved(store: &JsonlTurnStore, user: &str, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            let turns = store.load_recent_turns(user, 100).await.unwrap();
            if turns.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("turns were not persisted");
}

#[tokio::test]
async fn completed_turns_are_persisted_per_user() {
    let turns_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlTurnStore::new(turns_dir.path()).unwrap());

    let mut options = HarnessOptions::new();
    options.turns = store.clone();
    let mut h = Harness::start_with(options).await;
    h.turn("hello").await;
    h.turn("Nice to meet you").await;
    h.handle.shutdown().await.unwrap();

    wait_for_saved(&store, "learner", 2).await;
    let turns = store.load_recent_turns("learner", 10).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].user_text, "hello");
    assert_eq!(turns[0].assistant_text, "Hi there!");
    assert_eq!(turns[0].pending_target.as_deref(), Some("Nice to meet you"));
    assert_eq!(turns[0].kind, TurnKind::Dialogue);
    assert_eq!(turns[1].kind, TurnKind::Evaluation { score: 92 });
    assert!(turns[0].timestamp <= turns[1].timestamp);
}

#[tokio::test]
async fn history_is_loaded_as_context_on_start() {
    let turns_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlTurnStore::new(turns_dir.path()).unwrap());

    let mut options = HarnessOptions::new();
    options.turns = store.clone();
    let mut first = Harness::start_with(options).await;
    first.turn("my name is Sam").await;
    first.turn("I like trains").await;
    first.handle.shutdown().await.unwrap();
    wait_for_saved(&store, "learner", 2).await;

    let mut options = HarnessOptions::new();
    options.turns = store.clone();
    let mut second = Harness::start_with(options).await;
    second.turn("what do I like").await;

    // Two turns from the earlier session, then the one just completed.
    assert_eq!(second.dialogue.context_sizes(), vec![2]);
    second.turn("anything else").await;
    assert_eq!(second.dialogue.context_sizes(), vec![2, 3]);
    second.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn context_is_bounded_by_configured_turns() {
    let mut options = HarnessOptions::new();
    options.config.turn.context_turns = 2;
    let mut h = Harness::start_with(options).await;

    for text in ["one", "two", "three", "four"] {
        h.turn(text).await;
    }
    assert_eq!(h.dialogue.context_sizes(), vec![0, 1, 2, 2]);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_store_never_blocks_the_conversation() {
    let mut options = HarnessOptions::new();
    options.turns = Arc::new(BrokenTurnStore);
    let mut h = Harness::start_with(options).await;

    h.turn("first").await;
    h.turn("second").await;
    assert_eq!(h.sink.played(), vec!["Reply 1", "Reply 2"]);
    h.handle.shutdown().await.unwrap();
}
