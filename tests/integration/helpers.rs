//! Shared fakes and wiring for coordinator integration tests.

use async_trait::async_trait;
use bytes::Bytes;
use duplex_voice::dialogue::{
    ConversationContext, DialogueCollaborator, DialogueReply, PronunciationEvaluator,
    PronunciationReport,
};
use duplex_voice::memory::{ConversationTurn, MemoryTurnStore, TurnStore};
use duplex_voice::stt::{RecognitionResult, RecognitionService, RecognitionSession};
use duplex_voice::tts::{AudioSink, CacheStore, FsCacheStore, SpeechSynthesizer};
use duplex_voice::{
    AssistantState, AudioFrame, CoordinatorHandle, RuntimeEvent, TurnCoordinator, VoiceConfig,
    VoiceError,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Upper bound for anything a test waits on.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Config with short backoff and grace so tests stay fast.
pub(crate) fn fast_config(dir: &Path) -> VoiceConfig {
    let mut config = VoiceConfig::default();
    config.player.cache_dir = dir.join("speech-cache");
    config.recognizer.initial_backoff_ms = 10;
    config.recognizer.max_backoff_ms = 40;
    config.turn.collaborator_timeout_ms = 2_000;
    config.turn.echo_tail_ms = 50;
    config.turn.context_turns = 5;
    config.turn.user_id = "learner".to_owned();
    config.shutdown_grace_ms = 500;
    config
}

// -- Recognition --

/// Recognition backend driven by the test: each `say` is delivered on the
/// current session as a final result.
pub(crate) struct ScriptedRecognition {
    current: Mutex<Option<mpsc::Sender<duplex_voice::Result<RecognitionResult>>>>,
    inputs: Mutex<Vec<mpsc::Receiver<AudioFrame>>>,
    connects: watch::Sender<u32>,
    refuse: AtomicBool,
}

impl ScriptedRecognition {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
            connects: watch::Sender::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    /// Connection attempts so far, refused ones included.
    pub(crate) fn connects(&self) -> u32 {
        *self.connects.borrow()
    }

    /// Wait until at least `n` connection attempts have been made.
    pub(crate) async fn wait_connects(&self, n: u32) {
        let mut rx = self.connects.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|c| *c >= n))
            .await
            .expect("timed out waiting for recognizer to connect")
            .expect("connect counter dropped");
    }

    /// Refuse every later connection with a transient error.
    pub(crate) fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    fn session(&self) -> mpsc::Sender<duplex_voice::Result<RecognitionResult>> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .expect("no open recognition session")
    }

    async fn send(&self, result: duplex_voice::Result<RecognitionResult>) {
        let tx = self.session();
        tx.send(result).await.expect("recognizer dropped session");
    }

    /// Deliver a final transcript.
    pub(crate) async fn say(&self, text: &str) {
        self.send(Ok(RecognitionResult {
            text: text.to_owned(),
            is_final: true,
        }))
        .await;
    }

    /// Deliver an interim transcript.
    pub(crate) async fn hear_partial(&self, text: &str) {
        self.send(Ok(RecognitionResult {
            text: text.to_owned(),
            is_final: false,
        }))
        .await;
    }

    /// Break the current session with a transient fault.
    pub(crate) async fn fault(&self) {
        let tx = self
            .current
            .lock()
            .unwrap()
            .take()
            .expect("no open recognition session");
        tx.send(Err(VoiceError::TransientStreamFault("socket reset".into())))
            .await
            .expect("recognizer dropped session");
    }

    /// Frames the recognizer forwarded to any session so far.
    pub(crate) fn frames_received(&self) -> usize {
        let mut inputs = self.inputs.lock().unwrap();
        let mut count = 0;
        for input in inputs.iter_mut() {
            while input.try_recv().is_ok() {
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl RecognitionService for ScriptedRecognition {
    async fn connect(&self) -> duplex_voice::Result<RecognitionSession> {
        if self.refuse.load(Ordering::SeqCst) {
            self.connects.send_modify(|c| *c += 1);
            return Err(VoiceError::TransientStreamFault("connection refused".into()));
        }
        let (audio_tx, audio_rx) = mpsc::channel(256);
        let (results_tx, results_rx) = mpsc::channel(16);
        *self.current.lock().unwrap() = Some(results_tx);
        self.inputs.lock().unwrap().push(audio_rx);
        self.connects.send_modify(|c| *c += 1);
        Ok(RecognitionSession {
            audio: audio_tx,
            results: results_rx,
        })
    }
}

// -- Dialogue and evaluation --

/// Dialogue collaborator with canned answers.
///
/// "hello" earns a practice phrase; anything else gets a numbered reply.
#[derive(Default)]
pub(crate) struct ScriptedDialogue {
    calls: Mutex<Vec<String>>,
    context_sizes: Mutex<Vec<usize>>,
    fail: AtomicBool,
    delay_ms: AtomicU64,
    fixed_reply: Mutex<Option<String>>,
}

impl ScriptedDialogue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// How many recent turns each call was given as context.
    pub(crate) fn context_sizes(&self) -> Vec<usize> {
        self.context_sizes.lock().unwrap().clone()
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer every later call with `reply` and no practice phrase.
    pub(crate) fn always_reply(&self, reply: &str) {
        *self.fixed_reply.lock().unwrap() = Some(reply.to_owned());
    }
}

#[async_trait]
impl DialogueCollaborator for ScriptedDialogue {
    async fn generate_reply(
        &self,
        user_text: &str,
        context: &ConversationContext,
    ) -> duplex_voice::Result<DialogueReply> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(user_text.to_owned());
            calls.len()
        };
        self.context_sizes
            .lock()
            .unwrap()
            .push(context.recent_turns.len());

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::collaborator("dialogue", "upstream returned 503"));
        }
        if let Some(reply) = self.fixed_reply.lock().unwrap().clone() {
            return Ok(DialogueReply::plain(reply));
        }
        if user_text.eq_ignore_ascii_case("hello") {
            return Ok(DialogueReply::with_target("Hi there!", "Nice to meet you"));
        }
        Ok(DialogueReply::plain(format!("Reply {n}")))
    }
}

/// Evaluator that records its inputs and always praises.
#[derive(Default)]
pub(crate) struct RecordingEvaluator {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingEvaluator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PronunciationEvaluator for RecordingEvaluator {
    async fn evaluate(
        &self,
        user_text: &str,
        target_phrase: &str,
    ) -> duplex_voice::Result<PronunciationReport> {
        self.calls
            .lock()
            .unwrap()
            .push((user_text.to_owned(), target_phrase.to_owned()));
        Ok(PronunciationReport {
            score: 92,
            feedback_text: "Great pronunciation!".to_owned(),
        })
    }
}

// -- Synthesis and playback --

/// Synthesizer whose "audio" is the UTF-8 text; counts calls.
#[derive(Default)]
pub(crate) struct CountingSynthesizer {
    calls: AtomicUsize,
    fail: AtomicBool,
    fail_on: Mutex<Option<String>>,
}

impl CountingSynthesizer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Fail only for exactly `text`.
    pub(crate) fn fail_on(&self, text: &str) {
        *self.fail_on.lock().unwrap() = Some(text.to_owned());
    }
}

#[async_trait]
impl SpeechSynthesizer for CountingSynthesizer {
    async fn synthesize(&self, text: &str) -> duplex_voice::Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let refused = self.fail_on.lock().unwrap().as_deref() == Some(text);
        if refused || self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::collaborator("synthesis", "voice quota exceeded"));
        }
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Sink that records what it was asked to play and takes `play_ms` per
/// clip unless stopped.
pub(crate) struct RecordingSink {
    played: Mutex<Vec<String>>,
    play_ms: AtomicU64,
    stop_generation: AtomicU64,
    stops: AtomicUsize,
}

impl RecordingSink {
    pub(crate) fn new(play_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            play_ms: AtomicU64::new(play_ms),
            stop_generation: AtomicU64::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn set_play_ms(&self, ms: u64) {
        self.play_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, audio: Bytes) -> duplex_voice::Result<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&audio).into_owned());
        let total = Duration::from_millis(self.play_ms.load(Ordering::SeqCst));
        let step = Duration::from_millis(5);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            if self.stop_generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            tokio::time::sleep(step).await;
            elapsed += step;
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Turn store whose writes always fail.
pub(crate) struct BrokenTurnStore;

#[async_trait]
impl TurnStore for BrokenTurnStore {
    async fn save_turn(&self, _turn: &ConversationTurn) -> duplex_voice::Result<()> {
        Err(VoiceError::Persistence("disk full".into()))
    }

    async fn load_recent_turns(
        &self,
        _user_id: &str,
        _limit: usize,
    ) -> duplex_voice::Result<Vec<ConversationTurn>> {
        Err(VoiceError::Persistence("disk full".into()))
    }
}

// -- Harness --

/// A running coordinator wired to the fakes above.
pub(crate) struct Harness {
    pub(crate) handle: CoordinatorHandle,
    pub(crate) recognition: Arc<ScriptedRecognition>,
    pub(crate) dialogue: Arc<ScriptedDialogue>,
    pub(crate) evaluator: Arc<RecordingEvaluator>,
    pub(crate) synthesizer: Arc<CountingSynthesizer>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) events: broadcast::Receiver<RuntimeEvent>,
    _dir: tempfile::TempDir,
}

/// Knobs for [`Harness::start_with`].
pub(crate) struct HarnessOptions {
    pub(crate) config: VoiceConfig,
    pub(crate) play_ms: u64,
    pub(crate) turns: Arc<dyn TurnStore>,
    pub(crate) cache: Option<Arc<dyn CacheStore>>,
    pub(crate) synthesizer: Arc<CountingSynthesizer>,
    pub(crate) dir: tempfile::TempDir,
}

impl HarnessOptions {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        Self {
            config: fast_config(dir.path()),
            play_ms: 20,
            turns: Arc::new(MemoryTurnStore::new()),
            cache: None,
            synthesizer: CountingSynthesizer::new(),
            dir,
        }
    }
}

impl Harness {
    pub(crate) async fn start() -> Self {
        Self::start_with(HarnessOptions::new()).await
    }

    pub(crate) async fn start_with(options: HarnessOptions) -> Self {
        let recognition = ScriptedRecognition::new();
        let dialogue = ScriptedDialogue::new();
        let evaluator = RecordingEvaluator::new();
        let sink = RecordingSink::new(options.play_ms);
        let (events_tx, events) = broadcast::channel(1024);

        let cache = match options.cache {
            Some(cache) => cache,
            None => Arc::new(
                FsCacheStore::new(&options.config.player.cache_dir).expect("create cache dir"),
            ),
        };

        let handle = TurnCoordinator::new(options.config)
            .with_recognition(recognition.clone())
            .with_dialogue(dialogue.clone())
            .with_evaluator(evaluator.clone())
            .with_synthesizer(options.synthesizer.clone())
            .with_sink(sink.clone())
            .with_cache(cache)
            .with_turn_store(options.turns)
            .with_runtime_events(events_tx)
            .start()
            .expect("start coordinator");

        recognition.wait_connects(1).await;
        wait_for_state(&handle, AssistantState::Listening).await;

        Self {
            handle,
            recognition,
            dialogue,
            evaluator,
            synthesizer: options.synthesizer,
            sink,
            events,
            _dir: options.dir,
        }
    }

    /// Say `text` and wait for the reply to finish playing.
    pub(crate) async fn turn(&mut self, text: &str) {
        self.recognition.say(text).await;
        self.next_event(|e| {
            matches!(
                e,
                RuntimeEvent::StateChanged {
                    from: AssistantState::Speaking,
                    to: AssistantState::Listening,
                }
            )
        })
        .await;
    }

    /// Wait for the first runtime event matching `pred`, skipping others.
    pub(crate) async fn next_event(
        &mut self,
        mut pred: impl FnMut(&RuntimeEvent) -> bool,
    ) -> RuntimeEvent {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("runtime event channel closed")
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for runtime event")
    }
}

/// Block until the coordinator reaches `state`.
pub(crate) async fn wait_for_state(handle: &CoordinatorHandle, state: AssistantState) {
    let mut rx = handle.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("state channel closed");
}

/// A frame loud enough to pass the voice activity gate.
pub(crate) fn loud_frame(index: u64) -> AudioFrame {
    let samples = (0..1_600)
        .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
        .collect();
    AudioFrame::new(samples, 16_000, 1, index)
}
