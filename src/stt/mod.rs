//! Streaming speech recognition with automatic reconnect.
//!
//! [`StreamingRecognizer`] owns one long-lived session with a
//! [`RecognitionService`] at a time. Gated frames are forwarded as they
//! arrive and results come back as [`TranscriptEvent`]s on a bounded queue.
//!
//! ```text
//! Disconnected ──► Connecting ──► Streaming
//!      ▲                              │ fault
//!      └──────── backoff ◄────────────┘
//! ```
//!
//! # Known gap
//!
//! Frames already handed to a session that later faults are not replayed to
//! the next session. The audio the old session had not acknowledged is lost,
//! so a user may have to repeat the last few words after a reconnect. The
//! upside is that no frame ever reaches two sessions.

use crate::config::RecognizerConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, TranscriptEvent};
use crate::runtime::RuntimeEvent;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One raw result from the recognition backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    /// Best transcript alternative.
    pub text: String,
    /// Whether the backend marked the result final.
    pub is_final: bool,
}

/// An open bidirectional recognition stream.
///
/// Dropping `audio` closes the input side, which is how the recognizer tears
/// a session down. The backend ends `results` (or sends a transient error)
/// when the stream fails.
pub struct RecognitionSession {
    /// Frames for the backend.
    pub audio: mpsc::Sender<AudioFrame>,
    /// Results from the backend, in the order it produced them.
    pub results: mpsc::Receiver<Result<RecognitionResult>>,
}

/// Speech-recognition collaborator.
#[async_trait]
pub trait RecognitionService: Send + Sync {
    /// Open a new streaming session.
    ///
    /// Return [`VoiceError::TransientStreamFault`] for failures worth
    /// retrying; any other error stops the recognizer.
    async fn connect(&self) -> Result<RecognitionSession>;
}

/// Connection state of the recognizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecognizerState {
    /// No session (initial, between retries, and after stop).
    #[default]
    Disconnected,
    /// Opening a session.
    Connecting,
    /// Forwarding frames and delivering transcripts.
    Streaming,
}

impl fmt::Display for RecognizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
        };
        f.write_str(label)
    }
}

/// Handle to a running recognizer task.
pub struct StreamingRecognizer {
    cancel: CancellationToken,
    state_rx: watch::Receiver<RecognizerState>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Everything the recognizer task needs.
struct RecognizerTask {
    service: Arc<dyn RecognitionService>,
    config: RecognizerConfig,
    frames: mpsc::Receiver<AudioFrame>,
    events: mpsc::Sender<TranscriptEvent>,
    state_tx: watch::Sender<RecognizerState>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    cancel: CancellationToken,
}

/// Why a streaming session ended.
enum SessionEnd {
    Cancelled,
    /// Frame producer or transcript consumer went away.
    PeerClosed,
    Fault {
        error: VoiceError,
        delivered: bool,
    },
    Fatal(VoiceError),
}

impl StreamingRecognizer {
    /// Spawn the recognizer on the current tokio runtime.
    ///
    /// `frames` carries gated audio in; `events` carries transcripts out.
    /// The task stops when `cancel` (or [`stop`](Self::stop)) fires, when
    /// either queue's peer goes away, or when the reconnect budget runs out.
    pub fn spawn(
        service: Arc<dyn RecognitionService>,
        config: RecognizerConfig,
        frames: mpsc::Receiver<AudioFrame>,
        events: mpsc::Sender<TranscriptEvent>,
        runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(RecognizerState::Disconnected);
        let task = RecognizerTask {
            service,
            config,
            frames,
            events,
            state_tx,
            runtime_tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());
        Self {
            cancel,
            state_rx,
            task: Mutex::new(Some(handle)),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> RecognizerState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<RecognizerState> {
        self.state_rx.clone()
    }

    /// Ask the recognizer to stop. Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait up to `grace` for the task to exit.
    ///
    /// Returns the task's own result the first time; later calls return
    /// `Ok(())`. A task that overruns the grace period is aborted.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::FatalConfig`] if the recognizer gave up after
    /// exhausting its reconnect budget, or the backend's non-transient error.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.stop();
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => return Err(VoiceError::Channel("recognizer handle poisoned".into())),
        };
        let Some(mut handle) = handle else {
            return Ok(());
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(VoiceError::Channel(format!("recognizer task failed: {e}"))),
            Err(_) => {
                warn!("recognizer did not stop within {grace:?}, aborting");
                handle.abort();
                Ok(())
            }
        }
    }
}

impl RecognizerTask {
    async fn run(mut self) -> Result<()> {
        let mut session_no: u64 = 0;
        let mut failures: u32 = 0;

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            if failures > 0 {
                if failures > self.config.max_reconnect_attempts {
                    error!(
                        "recognition stream failed {failures} times in a row, giving up"
                    );
                    break Err(VoiceError::FatalConfig(format!(
                        "recognizer exceeded {} reconnect attempts",
                        self.config.max_reconnect_attempts
                    )));
                }
                let delay = self.config.backoff_for(failures);
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting recognition stream"
                );
                self.emit(RuntimeEvent::RecognizerReconnecting {
                    attempt: failures,
                    delay,
                });
                tokio::select! {
                    () = self.cancel.cancelled() => break Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(RecognizerState::Connecting);
            let connected = tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                s = self.service.connect() => s,
            };
            let session = match connected {
                Ok(s) => s,
                Err(e) if e.is_transient() => {
                    warn!("recognition connect failed: {e}");
                    failures += 1;
                    self.set_state(RecognizerState::Disconnected);
                    continue;
                }
                Err(e) => {
                    error!("recognition connect failed permanently: {e}");
                    break Err(e);
                }
            };

            session_no += 1;
            self.set_state(RecognizerState::Streaming);
            info!(session = session_no, "recognition session streaming");

            match self.stream_session(session, session_no).await {
                SessionEnd::Cancelled | SessionEnd::PeerClosed => break Ok(()),
                SessionEnd::Fault { error, delivered } => {
                    warn!(
                        session = session_no,
                        "recognition stream fault: {error}; unacknowledged audio from this session is lost"
                    );
                    failures = if delivered { 1 } else { failures + 1 };
                    self.set_state(RecognizerState::Disconnected);
                }
                SessionEnd::Fatal(e) => {
                    error!(session = session_no, "recognition stream failed: {e}");
                    break Err(e);
                }
            }
        };

        self.set_state(RecognizerState::Disconnected);
        info!("recognizer stopped");
        result
    }

    async fn stream_session(&mut self, session: RecognitionSession, session_no: u64) -> SessionEnd {
        let RecognitionSession { audio, mut results } = session;
        let mut sequence: u64 = 0;
        let mut delivered = false;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                result = results.recv() => {
                    let event = match result {
                        Some(Ok(r)) => TranscriptEvent {
                            text: r.text,
                            is_final: r.is_final,
                            sequence,
                            session: session_no,
                        },
                        Some(Err(e)) if e.is_transient() => {
                            return SessionEnd::Fault { error: e, delivered };
                        }
                        Some(Err(e)) => return SessionEnd::Fatal(e),
                        None => {
                            return SessionEnd::Fault {
                                error: VoiceError::TransientStreamFault(
                                    "recognition stream closed by backend".into(),
                                ),
                                delivered,
                            };
                        }
                    };
                    sequence += 1;
                    delivered = true;
                    tokio::select! {
                        () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                        sent = self.events.send(event) => {
                            if sent.is_err() {
                                return SessionEnd::PeerClosed;
                            }
                        }
                    }
                }
                frame = self.frames.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::PeerClosed;
                    };
                    let sent = tokio::select! {
                        () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                        sent = audio.send(frame) => sent,
                    };
                    if sent.is_err() {
                        return SessionEnd::Fault {
                            error: VoiceError::TransientStreamFault(
                                "recognition input closed by backend".into(),
                            ),
                            delivered,
                        };
                    }
                }
            }
        }
    }

    fn set_state(&self, state: RecognizerState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(RuntimeEvent::RecognizerState(state));
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        if let Some(rt) = &self.runtime_tx {
            let _ = rt.send(event);
        }
    }
}
