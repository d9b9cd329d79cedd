//! Turn coordinator: wires the stages together and decides who speaks when.
//!
//! ```text
//! AudioChannel ─► gate stage ─► StreamingRecognizer ─► control loop ─► SynthesisPlayer
//!                    ▲                                     │    ▲              │
//!                    └──────── AssistantState (watch) ◄────┘    └─ PlaybackEvent
//! ```
//!
//! Only the control loop changes [`AssistantState`]. The gate stage reads it
//! to stop forwarding microphone audio while the assistant is speaking; every
//! other stage talks to the loop through bounded queues.

use crate::audio::channel::{AudioChannel, Pull};
use crate::config::{TurnConfig, VoiceConfig};
use crate::dialogue::{
    ConversationContext, DialogueCollaborator, PronunciationEvaluator, SimilarityEvaluator,
};
use crate::error::{Result, VoiceError};
use crate::memory::{ConversationTurn, MemoryTurnStore, TurnKind, TurnStore};
use crate::pipeline::messages::{
    AssistantState, AudioFrame, PlaybackEvent, PlaybackOutcome, TranscriptEvent,
};
use crate::runtime::{RuntimeEvent, ShutdownReason};
use crate::stt::{RecognitionService, StreamingRecognizer};
use crate::tts::{
    AudioSink, CacheStore, FsCacheStore, MemoryCacheStore, SpeechSynthesizer, SynthesisPlayer,
};
use crate::turn::echo::EchoGuard;
use crate::turn::slot::PendingTargetSlot;
use crate::turn::termination::TerminationMatcher;
use crate::vad::{FrameClass, VoiceActivityGate};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the gate waits on an empty audio channel before re-checking
/// for shutdown.
const GATE_POLL: Duration = Duration::from_millis(50);
const CONTROL_CHANNEL_SIZE: usize = 8;
const RUNTIME_EVENT_CAPACITY: usize = 256;

/// Commands from the handle to the control loop.
enum ControlCommand {
    Interrupt,
    Shutdown,
}

/// Collects collaborators and configuration, then starts every worker.
///
/// Required: a recognition service, a dialogue collaborator, a speech
/// synthesizer, and an audio sink. Everything else has a default.
pub struct TurnCoordinator {
    config: VoiceConfig,
    recognition: Option<Arc<dyn RecognitionService>>,
    dialogue: Option<Arc<dyn DialogueCollaborator>>,
    evaluator: Option<Arc<dyn PronunciationEvaluator>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    sink: Option<Arc<dyn AudioSink>>,
    cache: Option<Arc<dyn CacheStore>>,
    turns: Option<Arc<dyn TurnStore>>,
    audio: Option<AudioChannel>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
}

impl TurnCoordinator {
    /// Create a coordinator with no collaborators attached.
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            config,
            recognition: None,
            dialogue: None,
            evaluator: None,
            synthesizer: None,
            sink: None,
            cache: None,
            turns: None,
            audio: None,
            runtime_tx: None,
        }
    }

    /// Attach the speech-recognition collaborator.
    pub fn with_recognition(mut self, service: Arc<dyn RecognitionService>) -> Self {
        self.recognition = Some(service);
        self
    }

    /// Attach the dialogue collaborator.
    pub fn with_dialogue(mut self, dialogue: Arc<dyn DialogueCollaborator>) -> Self {
        self.dialogue = Some(dialogue);
        self
    }

    /// Attach a pronunciation evaluator. Defaults to [`SimilarityEvaluator`].
    pub fn with_evaluator(mut self, evaluator: Arc<dyn PronunciationEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Attach the speech-synthesis collaborator.
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Attach the output device.
    pub fn with_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a specific synthesis cache. Defaults to an [`FsCacheStore`] in
    /// `player.cache_dir`, or an in-memory cache if that cannot be opened.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Persist turns to `store`. Defaults to an in-memory store.
    pub fn with_turn_store(mut self, store: Arc<dyn TurnStore>) -> Self {
        self.turns = Some(store);
        self
    }

    /// Read microphone frames from an existing channel instead of creating
    /// one from `audio` config.
    pub fn with_audio_channel(mut self, channel: AudioChannel) -> Self {
        self.audio = Some(channel);
        self
    }

    /// Attach a runtime event broadcaster for UI/observability.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    /// Validate, spawn every worker, and start listening.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::FatalConfig`] if the configuration is invalid
    /// or a required collaborator is missing.
    pub fn start(self) -> Result<CoordinatorHandle> {
        self.config.validate()?;
        let recognition = require(self.recognition, "recognition service")?;
        let dialogue = require(self.dialogue, "dialogue collaborator")?;
        let synthesizer = require(self.synthesizer, "speech synthesizer")?;
        let sink = require(self.sink, "audio sink")?;

        let config = self.config;
        let grace = config.shutdown_grace();
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(SimilarityEvaluator::default()));
        let cache: Arc<dyn CacheStore> = match self.cache {
            Some(cache) => cache,
            None => match FsCacheStore::new(&config.player.cache_dir) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!("speech cache unavailable, caching in memory: {e}");
                    Arc::new(MemoryCacheStore::new())
                }
            },
        };
        let turns = self
            .turns
            .unwrap_or_else(|| Arc::new(MemoryTurnStore::new()));
        let runtime_tx = self
            .runtime_tx
            .unwrap_or_else(|| broadcast::channel(RUNTIME_EVENT_CAPACITY).0);
        let audio = self
            .audio
            .unwrap_or_else(|| AudioChannel::from_config(&config.audio));

        info!(
            "starting turn coordinator (user: {}, barge-in: {})",
            config.turn.user_id, config.turn.barge_in
        );

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(AssistantState::Idle);
        let (frames_tx, frames_rx) = mpsc::channel(config.recognizer.frame_queue_capacity);
        let (transcripts_tx, transcripts_rx) =
            mpsc::channel(config.recognizer.event_queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let slot = Arc::new(PendingTargetSlot::new());

        let gate = GateStage {
            audio: audio.clone(),
            vad: VoiceActivityGate::new(&config.vad),
            state: state_rx.clone(),
            frames: frames_tx,
            echo_tail: Duration::from_millis(config.turn.echo_tail_ms),
            cancel: cancel.clone(),
        };
        let gate_task = tokio::task::spawn_blocking(move || run_gate_stage(gate));

        let recognizer = StreamingRecognizer::spawn(
            recognition,
            config.recognizer.clone(),
            frames_rx,
            transcripts_tx,
            Some(runtime_tx.clone()),
            cancel.child_token(),
        );
        let (player, playback_rx) = SynthesisPlayer::spawn(
            synthesizer,
            cache,
            sink,
            &config.player,
            cancel.child_token(),
        );

        let control = ControlLoop {
            echo: EchoGuard::new(config.turn.echo_similarity_threshold),
            termination: TerminationMatcher::new(&config.turn.termination_phrases),
            grace,
            turn: config.turn,
            state_tx,
            runtime_tx: runtime_tx.clone(),
            player,
            recognizer,
            dialogue,
            evaluator,
            turns,
            slot: Arc::clone(&slot),
            context: VecDeque::new(),
            outstanding: HashSet::new(),
            apologies: HashSet::new(),
            deferred: VecDeque::new(),
            audio: audio.clone(),
            gate_task: Some(gate_task),
            cancel: cancel.clone(),
            transcripts: transcripts_rx,
            playback: playback_rx,
            control: control_rx,
        };
        let task = tokio::spawn(control.run());

        Ok(CoordinatorHandle {
            state: state_rx,
            control: control_tx,
            runtime_tx,
            audio,
            slot,
            cancel,
            grace,
            task: Mutex::new(Some(task)),
        })
    }
}

fn require<T: ?Sized>(collaborator: Option<Arc<T>>, name: &str) -> Result<Arc<T>> {
    collaborator
        .ok_or_else(|| VoiceError::FatalConfig(format!("missing required collaborator: {name}")))
}

/// Control surface of a running coordinator.
///
/// Dropping the handle stops the coordinator.
pub struct CoordinatorHandle {
    state: watch::Receiver<AssistantState>,
    control: mpsc::Sender<ControlCommand>,
    runtime_tx: broadcast::Sender<RuntimeEvent>,
    audio: AudioChannel,
    slot: Arc<PendingTargetSlot>,
    cancel: CancellationToken,
    grace: Duration,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl CoordinatorHandle {
    /// Current turn state.
    pub fn state(&self) -> AssistantState {
        *self.state.borrow()
    }

    /// Subscribe to turn state changes.
    pub fn watch_state(&self) -> watch::Receiver<AssistantState> {
        self.state.clone()
    }

    /// Subscribe to runtime events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.runtime_tx.subscribe()
    }

    /// Channel that microphone producers push frames into.
    pub fn audio(&self) -> AudioChannel {
        self.audio.clone()
    }

    /// Practice phrase waiting for the next turn, if any.
    pub fn pending_target(&self) -> Option<String> {
        self.slot.peek()
    }

    /// Stop the current reply (barge-in). Ignored unless speaking.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Channel`] if the coordinator has stopped or its
    /// control queue is full.
    pub fn interrupt(&self) -> Result<()> {
        self.control
            .try_send(ControlCommand::Interrupt)
            .map_err(|e| VoiceError::Channel(format!("interrupt not delivered: {e}")))
    }

    /// Wait until the coordinator stops on its own, e.g. after a termination
    /// phrase or a recognizer failure.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::FatalConfig`] if the recognizer exhausted its
    /// reconnect budget.
    pub async fn wait(&self) -> Result<()> {
        let mut guard = self.task.lock().await;
        let Some(task) = guard.as_mut() else {
            return Ok(());
        };
        // Awaiting by reference keeps the task joinable by `shutdown` if
        // this future is dropped early.
        let joined = task.await;
        *guard = None;
        match joined {
            Ok(result) => result,
            Err(e) => Err(VoiceError::Channel(format!("coordinator task failed: {e}"))),
        }
    }

    /// Stop every worker and wait for them within the shutdown grace period.
    ///
    /// # Errors
    ///
    /// Returns the coordinator's own failure, if it had already stopped with
    /// one.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.control.try_send(ControlCommand::Shutdown);
        self.cancel.cancel();
        let Some(mut task) = self.task.lock().await.take() else {
            return Ok(());
        };
        // Workers get `grace` each, concurrently; allow the loop one more.
        match tokio::time::timeout(self.grace * 2, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(VoiceError::Channel(format!("coordinator task failed: {e}"))),
            Err(_) => {
                warn!("coordinator did not stop within {:?}, aborting", self.grace * 2);
                task.abort();
                Ok(())
            }
        }
    }

    /// Token that stops the coordinator when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// -- Gate stage --

struct GateStage {
    audio: AudioChannel,
    vad: VoiceActivityGate,
    state: watch::Receiver<AssistantState>,
    frames: mpsc::Sender<AudioFrame>,
    echo_tail: Duration,
    cancel: CancellationToken,
}

/// Blocking loop: pull frames, drop silence and self-echo, forward speech.
fn run_gate_stage(mut gate: GateStage) {
    let mut was_speaking = false;
    // Frames captured before this instant are assumed to contain the tail
    // of our own playback.
    let mut suppress_until: Option<Instant> = None;
    let mut forwarded: u64 = 0;
    let mut suppressed: u64 = 0;

    while !gate.cancel.is_cancelled() {
        let pulled = gate.audio.pull(GATE_POLL);

        // Checked on every poll: the tail runs from the end of playback.
        let speaking = *gate.state.borrow() == AssistantState::Speaking;
        if speaking && !was_speaking {
            gate.vad.reset();
            was_speaking = true;
        } else if !speaking && was_speaking {
            was_speaking = false;
            suppress_until = Some(Instant::now() + gate.echo_tail);
        }

        let frame = match pulled {
            Pull::Frame(frame) => frame,
            Pull::Empty => continue,
            Pull::Closed => break,
        };
        if speaking {
            suppressed += 1;
            continue;
        }
        if let Some(until) = suppress_until {
            if frame.captured_at <= until {
                suppressed += 1;
                continue;
            }
            suppress_until = None;
        }

        if gate.vad.classify(&frame) == FrameClass::Silence {
            continue;
        }
        match gate.frames.try_send(frame) {
            Ok(()) => forwarded += 1,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!(index = frame.index, "recognizer queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    info!(forwarded, suppressed, "gate stage stopped");
}

// -- Control loop --

/// How a collaborator call inside a turn ended.
enum Call<T> {
    Done(T),
    Failed(VoiceError),
    Stop(ShutdownReason),
}

/// What to do with a final transcript.
enum Disposition {
    Terminate(String),
    Echo(f32),
    Turn,
}

struct ControlLoop {
    turn: TurnConfig,
    grace: Duration,
    state_tx: watch::Sender<AssistantState>,
    runtime_tx: broadcast::Sender<RuntimeEvent>,
    player: SynthesisPlayer,
    recognizer: StreamingRecognizer,
    dialogue: Arc<dyn DialogueCollaborator>,
    evaluator: Arc<dyn PronunciationEvaluator>,
    turns: Arc<dyn TurnStore>,
    slot: Arc<PendingTargetSlot>,
    echo: EchoGuard,
    termination: TerminationMatcher,
    /// Recent turns handed to the dialogue collaborator, oldest first.
    context: VecDeque<ConversationTurn>,
    /// Playback requests not yet reported as ended.
    outstanding: HashSet<u64>,
    /// Outstanding requests that carry the apology. A failed apology is not
    /// apologised for again.
    apologies: HashSet<u64>,
    /// Final transcripts that arrived while busy, handled in order once the
    /// loop is back in `Listening`.
    deferred: VecDeque<String>,
    audio: AudioChannel,
    gate_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    transcripts: mpsc::Receiver<TranscriptEvent>,
    playback: mpsc::Receiver<PlaybackEvent>,
    control: mpsc::Receiver<ControlCommand>,
}

impl ControlLoop {
    async fn run(mut self) -> Result<()> {
        self.seed_context().await;
        self.set_state(AssistantState::Listening);

        let reason = loop {
            if self.state() == AssistantState::Listening {
                if let Some(text) = self.deferred.pop_front() {
                    if let Some(reason) = self.run_turn(text).await {
                        break reason;
                    }
                    continue;
                }
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break ShutdownReason::Requested,
                Some(cmd) = self.control.recv() => match cmd {
                    ControlCommand::Interrupt => self.interrupt(),
                    ControlCommand::Shutdown => break ShutdownReason::Requested,
                },
                event = self.playback.recv() => match event {
                    Some(event) => self.on_playback(event),
                    None => break ShutdownReason::WorkerStopped("player stopped".into()),
                },
                transcript = self.transcripts.recv() => match transcript {
                    Some(t) => {
                        if let Some(reason) = self.on_transcript(t).await {
                            break reason;
                        }
                    }
                    None => break ShutdownReason::WorkerStopped("recognizer stopped".into()),
                },
            }
        };

        self.finish(reason).await
    }

    fn state(&self) -> AssistantState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, to: AssistantState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state_tx.send_replace(to);
        info!("state: {from} -> {to}");
        self.emit(RuntimeEvent::StateChanged { from, to });
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.runtime_tx.send(event);
    }

    async fn seed_context(&mut self) {
        let limit = self.turn.context_turns;
        if limit == 0 {
            return;
        }
        let timeout = Duration::from_millis(self.turn.collaborator_timeout_ms);
        let load = self.turns.load_recent_turns(&self.turn.user_id, limit);
        let loaded = tokio::select! {
            () = self.cancel.cancelled() => return,
            r = tokio::time::timeout(timeout, load) => r,
        };
        match loaded {
            Ok(Ok(turns)) => {
                info!(count = turns.len(), "loaded conversation history");
                self.context.extend(turns);
            }
            Ok(Err(e)) => warn!("failed to load conversation history: {e}"),
            Err(_) => warn!("timed out loading conversation history"),
        }
    }

    fn classify(&self, text: &str) -> Disposition {
        if let Some(phrase) = self.termination.matched(text) {
            return Disposition::Terminate(phrase);
        }
        match self.echo.echo_similarity(text) {
            Some(similarity) => Disposition::Echo(similarity),
            None => Disposition::Turn,
        }
    }

    fn suppress_echo(&self, text: &str, similarity: f32) {
        info!(similarity, "ignoring echo of our own reply: {text:?}");
        self.emit(RuntimeEvent::EchoSuppressed {
            text: text.to_owned(),
            similarity,
        });
    }

    /// Handle a transcript while idle in `Listening` or `Speaking`.
    async fn on_transcript(&mut self, transcript: TranscriptEvent) -> Option<ShutdownReason> {
        let text = self.accept_transcript(transcript)?;
        match self.classify(&text) {
            Disposition::Terminate(phrase) => {
                info!("termination phrase heard: {phrase:?}");
                Some(ShutdownReason::TerminationPhrase(phrase))
            }
            Disposition::Echo(similarity) => {
                self.suppress_echo(&text, similarity);
                None
            }
            Disposition::Turn if self.state() == AssistantState::Speaking => {
                if self.turn.barge_in {
                    info!("barge-in: user spoke over the reply");
                    self.interrupt();
                    if self.deferred.is_empty() {
                        self.run_turn(text).await
                    } else {
                        // Earlier transcripts are still waiting; keep arrival order.
                        self.deferred.push_back(text);
                        None
                    }
                } else {
                    debug!("holding transcript until playback ends");
                    self.deferred.push_back(text);
                    None
                }
            }
            Disposition::Turn => self.run_turn(text).await,
        }
    }

    /// Handle a transcript that arrives while a collaborator call is in
    /// flight. Only termination takes effect immediately.
    fn on_transcript_while_busy(&mut self, transcript: TranscriptEvent) -> Option<ShutdownReason> {
        let text = self.accept_transcript(transcript)?;
        match self.classify(&text) {
            Disposition::Terminate(phrase) => {
                info!("termination phrase heard: {phrase:?}");
                Some(ShutdownReason::TerminationPhrase(phrase))
            }
            Disposition::Echo(similarity) => {
                self.suppress_echo(&text, similarity);
                None
            }
            Disposition::Turn => {
                debug!("turn in progress, queueing transcript");
                self.deferred.push_back(text);
                None
            }
        }
    }

    /// Publish a transcript and return its text if it is a non-empty final.
    fn accept_transcript(&self, transcript: TranscriptEvent) -> Option<String> {
        debug!(
            session = transcript.session,
            sequence = transcript.sequence,
            is_final = transcript.is_final,
            "transcript: {:?}",
            transcript.text
        );
        let text = transcript.text.trim().to_owned();
        let is_final = transcript.is_final;
        self.emit(RuntimeEvent::Transcript(transcript));
        (is_final && !text.is_empty()).then_some(text)
    }

    /// One full turn: evaluate or converse, then speak the reply.
    async fn run_turn(&mut self, user_text: String) -> Option<ShutdownReason> {
        self.set_state(AssistantState::Evaluating);
        info!("user: {user_text}");

        // Cleared before the call so a later transcript can never re-read it.
        let target = self.slot.take();

        let (mut reply, mut kind, mut next_target) = match target {
            Some(target) => {
                let evaluator = Arc::clone(&self.evaluator);
                let user = user_text.clone();
                let call = async move { evaluator.evaluate(&user, &target).await };
                match self.await_collaborator("evaluation", call).await {
                    Call::Done(report) => (
                        report.feedback_text,
                        TurnKind::Evaluation {
                            score: report.score.min(100),
                        },
                        None,
                    ),
                    Call::Failed(e) => {
                        error!("pronunciation evaluation failed: {e}");
                        (self.turn.apology_text.clone(), TurnKind::Apology, None)
                    }
                    Call::Stop(reason) => return Some(reason),
                }
            }
            None => {
                let dialogue = Arc::clone(&self.dialogue);
                let context = self.conversation_context();
                let user = user_text.clone();
                let call = async move { dialogue.generate_reply(&user, &context).await };
                match self.await_collaborator("dialogue", call).await {
                    Call::Done(r) => (
                        r.reply_text,
                        TurnKind::Dialogue,
                        r.target_phrase.filter(|t| !t.trim().is_empty()),
                    ),
                    Call::Failed(e) => {
                        error!("dialogue failed: {e}");
                        (self.turn.apology_text.clone(), TurnKind::Apology, None)
                    }
                    Call::Stop(reason) => return Some(reason),
                }
            }
        };

        if reply.trim().is_empty() {
            warn!("collaborator returned an empty reply, apologising instead");
            reply = self.turn.apology_text.clone();
            kind = TurnKind::Apology;
            next_target = None;
        }
        if let Some(target) = &next_target {
            info!("next practice phrase: {target:?}");
            self.slot.set(target.clone());
        }

        self.speak(&reply, kind == TurnKind::Apology);
        let turn = ConversationTurn::new(&self.turn.user_id, user_text, reply, kind)
            .with_pending_target(next_target);
        self.record_turn(turn);
        None
    }

    /// Drive `call` to completion while still servicing shutdown, playback
    /// bookkeeping and incoming transcripts.
    async fn await_collaborator<T, F>(&mut self, name: &'static str, call: F) -> Call<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = Duration::from_millis(self.turn.collaborator_timeout_ms);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        tokio::pin!(call);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Call::Stop(ShutdownReason::Requested),
                Some(cmd) = self.control.recv() => match cmd {
                    ControlCommand::Interrupt => debug!("nothing to interrupt while evaluating"),
                    ControlCommand::Shutdown => return Call::Stop(ShutdownReason::Requested),
                },
                result = &mut call => {
                    return match result {
                        Ok(value) => Call::Done(value),
                        Err(e) => Call::Failed(e),
                    };
                }
                () = &mut deadline => {
                    return Call::Failed(VoiceError::collaborator(
                        name,
                        format!("no answer within {timeout:?}"),
                    ));
                }
                Some(event) = self.playback.recv() => self.on_playback(event),
                transcript = self.transcripts.recv() => match transcript {
                    Some(t) => {
                        if let Some(reason) = self.on_transcript_while_busy(t) {
                            return Call::Stop(reason);
                        }
                    }
                    None => {
                        return Call::Stop(ShutdownReason::WorkerStopped(
                            "recognizer stopped".into(),
                        ));
                    }
                },
            }
        }
    }

    fn conversation_context(&self) -> ConversationContext {
        ConversationContext {
            user_id: self.turn.user_id.clone(),
            recent_turns: self.context.iter().cloned().collect(),
            suppress_target_on_long_reply: self.turn.suppress_target_on_long_reply,
            long_reply_chars: self.turn.long_reply_chars,
        }
    }

    fn speak(&mut self, reply: &str, apology: bool) {
        info!("assistant: {reply}");
        self.echo.remember(reply);
        match self.player.enqueue(reply) {
            Ok(id) => {
                self.outstanding.insert(id);
                if apology {
                    self.apologies.insert(id);
                }
                self.set_state(AssistantState::Speaking);
            }
            Err(e) => {
                error!("failed to queue reply for playback: {e}");
                self.set_state(AssistantState::Listening);
            }
        }
    }

    fn record_turn(&mut self, turn: ConversationTurn) {
        self.context.push_back(turn.clone());
        while self.context.len() > self.turn.context_turns {
            self.context.pop_front();
        }
        self.emit(RuntimeEvent::TurnCompleted(turn.clone()));

        let store = Arc::clone(&self.turns);
        tokio::spawn(async move {
            if let Err(e) = store.save_turn(&turn).await {
                warn!(turn_id = %turn.id, "failed to persist turn: {e}");
            }
        });
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        self.emit(RuntimeEvent::Playback(event.clone()));
        let PlaybackEvent::Ended { id, outcome } = event else {
            return;
        };
        let current = self.outstanding.remove(&id);
        let was_apology = self.apologies.remove(&id);
        match outcome {
            PlaybackOutcome::Finished => debug!(id, "reply finished"),
            PlaybackOutcome::Interrupted => debug!(id, "reply interrupted"),
            PlaybackOutcome::Failed(reason) => {
                error!(id, "reply could not be played: {reason}");
                if current && !was_apology && self.state() == AssistantState::Speaking {
                    let apology = self.turn.apology_text.clone();
                    self.speak(&apology, true);
                }
            }
        }
        if self.outstanding.is_empty() && self.state() == AssistantState::Speaking {
            self.set_state(AssistantState::Listening);
        }
    }

    fn interrupt(&mut self) {
        let state = self.state();
        if state != AssistantState::Speaking {
            debug!("interrupt ignored while {state}");
            return;
        }
        info!("interrupting playback");
        self.player.cancel();
        // Ended events for the cancelled requests still arrive; they no
        // longer gate the state.
        self.outstanding.clear();
        self.apologies.clear();
        self.set_state(AssistantState::Listening);
    }

    async fn finish(mut self, reason: ShutdownReason) -> Result<()> {
        info!("turn coordinator shutting down: {reason:?}");
        self.emit(RuntimeEvent::Shutdown(reason.clone()));
        self.cancel.cancel();
        self.audio.close();

        let grace = self.grace;
        let gate = self.gate_task.take();
        let (_, recognizer_result, _) = tokio::join!(
            self.player.shutdown(grace),
            self.recognizer.shutdown(grace),
            async {
                if let Some(gate) = gate {
                    if tokio::time::timeout(grace, gate).await.is_err() {
                        warn!("gate stage did not stop within {grace:?}");
                    }
                }
            },
        );

        self.set_state(AssistantState::Idle);
        info!("turn coordinator stopped");

        match (reason, recognizer_result) {
            (ShutdownReason::WorkerStopped(_), Err(e)) => {
                error!("recognizer failed: {e}");
                Err(e)
            }
            (_, Err(e)) => {
                warn!("recognizer reported an error during shutdown: {e}");
                Ok(())
            }
            (_, Ok(())) => Ok(()),
        }
    }
}
