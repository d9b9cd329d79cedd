//! FIFO synthesis and playback worker.

use super::cache::CacheStore;
use super::{AudioSink, SpeechSynthesizer, cache_key, normalize_text};
use crate::config::PlayerConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{PlaybackEvent, PlaybackOutcome};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle events buffered between the worker and its consumer.
const EVENT_QUEUE_CAPACITY: usize = 64;

struct PlayRequest {
    id: u64,
    text: String,
    /// Cancel generation at enqueue time. Requests from an older generation
    /// are discarded unplayed.
    generation: u64,
}

/// Plays reply text one request at a time, in enqueue order.
///
/// [`cancel`](Self::cancel) stops the current request and discards anything
/// queued before it; requests enqueued afterwards play normally.
pub struct SynthesisPlayer {
    tx: mpsc::Sender<PlayRequest>,
    generation: watch::Sender<u64>,
    next_id: AtomicU64,
    sink: Arc<dyn AudioSink>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct PlayerWorker {
    rx: mpsc::Receiver<PlayRequest>,
    generation: watch::Receiver<u64>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    cache: Arc<dyn CacheStore>,
    sink: Arc<dyn AudioSink>,
    events: mpsc::Sender<PlaybackEvent>,
    case_fold: bool,
    cancel: CancellationToken,
}

impl SynthesisPlayer {
    /// Spawn the playback worker on the current tokio runtime.
    ///
    /// Every accepted request produces exactly one
    /// [`PlaybackEvent::Ended`] on the returned receiver, preceded by
    /// [`PlaybackEvent::Started`] if any audio reached the sink.
    pub fn spawn(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        cache: Arc<dyn CacheStore>,
        sink: Arc<dyn AudioSink>,
        config: &PlayerConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<PlaybackEvent>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (gen_tx, gen_rx) = watch::channel(0u64);

        let worker = PlayerWorker {
            rx,
            generation: gen_rx,
            synthesizer,
            cache,
            sink: Arc::clone(&sink),
            events: events_tx,
            case_fold: config.case_fold,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        let player = Self {
            tx,
            generation: gen_tx,
            next_id: AtomicU64::new(1),
            sink,
            cancel,
            task: Mutex::new(Some(task)),
        };
        (player, events_rx)
    }

    /// Queue `text` for playback and return its request id. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Channel`] if the queue is full or the worker
    /// has stopped.
    pub fn enqueue(&self, text: impl Into<String>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = PlayRequest {
            id,
            text: text.into(),
            generation: *self.generation.borrow(),
        };
        match self.tx.try_send(request) {
            Ok(()) => {
                debug!(id, "playback request queued");
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(VoiceError::Channel("playback queue is full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VoiceError::Channel("player has stopped".into()))
            }
        }
    }

    /// Stop the current playback and drop everything queued so far.
    pub fn cancel(&self) {
        self.generation.send_modify(|g| *g += 1);
        self.sink.stop();
        info!("playback cancelled");
    }

    /// Stop the worker and wait up to `grace` for it to exit.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.sink.stop();
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("player did not stop within {grace:?}, aborting");
            handle.abort();
        }
    }
}

impl PlayerWorker {
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                r = self.rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
            };

            let current = *self.generation.borrow_and_update();
            let outcome = if request.generation < current {
                debug!(id = request.id, "discarding playback request queued before cancel");
                PlaybackOutcome::Interrupted
            } else {
                self.play_request(&request).await
            };
            if !self.emit(PlaybackEvent::Ended {
                id: request.id,
                outcome,
            })
            .await
            {
                break;
            }
        }

        // Anything still queued will never play; report it so consumers
        // waiting on Ended events are not left hanging.
        self.rx.close();
        while let Ok(request) = self.rx.try_recv() {
            let _ = self.events.try_send(PlaybackEvent::Ended {
                id: request.id,
                outcome: PlaybackOutcome::Interrupted,
            });
        }
        info!("player stopped");
    }

    async fn play_request(&mut self, request: &PlayRequest) -> PlaybackOutcome {
        let normalized = normalize_text(&request.text, self.case_fold);
        if normalized.is_empty() {
            return PlaybackOutcome::Finished;
        }
        let key = cache_key(&normalized);

        let (audio, cached) = match self.lookup(&key).await {
            Some(audio) => (audio, true),
            None => match self.synthesize_and_store(request, &key).await {
                Ok(audio) => (audio, false),
                Err(outcome) => return outcome,
            },
        };

        if !self.emit(PlaybackEvent::Started {
            id: request.id,
            cached,
        })
        .await
        {
            return PlaybackOutcome::Interrupted;
        }

        match self.play(request.id, audio).await {
            Ok(outcome) => outcome,
            Err(reason) if cached => {
                // The stored clip may be corrupt; replace it with fresh audio.
                warn!(
                    id = request.id,
                    key = %key,
                    "cached audio failed to play, regenerating: {reason}"
                );
                match self.synthesize_and_store(request, &key).await {
                    Ok(audio) => self
                        .play(request.id, audio)
                        .await
                        .unwrap_or_else(PlaybackOutcome::Failed),
                    Err(outcome) => outcome,
                }
            }
            Err(reason) => PlaybackOutcome::Failed(reason),
        }
    }

    /// Synthesizes `request` and stores the audio under `key`, replacing any
    /// existing entry. A cache write failure is logged and ignored.
    async fn synthesize_and_store(
        &mut self,
        request: &PlayRequest,
        key: &str,
    ) -> std::result::Result<Bytes, PlaybackOutcome> {
        let synthesized = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(PlaybackOutcome::Interrupted),
            _ = self.generation.changed() => return Err(PlaybackOutcome::Interrupted),
            r = self.synthesizer.synthesize(&request.text) => r,
        };
        let audio = synthesized.map_err(|e| {
            error!(id = request.id, "speech synthesis failed: {e}");
            PlaybackOutcome::Failed(e.to_string())
        })?;
        if let Err(e) = self.cache.write(key, &audio).await {
            warn!(key = %key, "failed to store synthesized audio: {e}");
        }
        Ok(audio)
    }

    /// Plays one clip. `Err` carries the sink failure.
    async fn play(
        &mut self,
        id: u64,
        audio: Bytes,
    ) -> std::result::Result<PlaybackOutcome, String> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.sink.stop();
                Ok(PlaybackOutcome::Interrupted)
            }
            _ = self.generation.changed() => {
                self.sink.stop();
                Ok(PlaybackOutcome::Interrupted)
            }
            r = self.sink.play(audio) => r.map(|()| PlaybackOutcome::Finished).map_err(|e| {
                error!(id, "playback failed: {e}");
                e.to_string()
            }),
        }
    }

    /// Cached audio for `key`, or `None` on a miss or any cache fault.
    async fn lookup(&self, key: &str) -> Option<Bytes> {
        match self.cache.exists(key).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(key = %key, "cache lookup failed, synthesizing: {e}");
                return None;
            }
        }
        match self.cache.read(key).await {
            Ok(audio) => {
                debug!(key = %key, "speech cache hit");
                Some(audio)
            }
            Err(e) => {
                warn!(key = %key, "cache read failed, synthesizing: {e}");
                None
            }
        }
    }

    /// Returns `false` once the worker should stop.
    async fn emit(&self, event: PlaybackEvent) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.events.send(event) => {
                // A dropped receiver only means nobody is listening.
                let _ = sent;
                true
            }
        }
    }
}
