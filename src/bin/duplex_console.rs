//! Text-mode harness for the turn coordinator.
//!
//! Each line typed on stdin is treated as a final transcript and replies are
//! printed instead of spoken, so turn-taking, practice phrases, echo
//! suppression and termination can be exercised without a microphone or
//! cloud services.
//!
//! All tracing output goes to stderr; stdout carries the conversation.

use async_trait::async_trait;
use bytes::Bytes;
use duplex_voice::dialogue::{ConversationContext, DialogueCollaborator, DialogueReply};
use duplex_voice::memory::JsonlTurnStore;
use duplex_voice::stt::{RecognitionResult, RecognitionService, RecognitionSession};
use duplex_voice::tts::{AudioSink, SpeechSynthesizer};
use duplex_voice::{
    AssistantState, PlaybackEvent, RuntimeEvent, TurnCoordinator, VoiceConfig, VoiceError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Simulated speaking rate for the console sink.
const MS_PER_CHAR: u64 = 15;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let Some(options) = parse_args()? else {
        print_usage();
        return Ok(());
    };
    let config = load_config(options.config.as_deref())?;

    let stdin_closed = CancellationToken::new();
    // End of input reads as the user saying goodbye, after any queued lines.
    let farewell = config.turn.termination_phrases.first().cloned();
    let mut coordinator = TurnCoordinator::new(config.clone())
        .with_recognition(Arc::new(StdinRecognition::spawn(
            farewell,
            stdin_closed.clone(),
        )))
        .with_dialogue(Arc::new(PracticeDialogue))
        .with_synthesizer(Arc::new(TextSynthesizer))
        .with_sink(Arc::new(ConsoleSink::default()));
    if !options.ephemeral {
        coordinator = coordinator.with_turn_store(Arc::new(JsonlTurnStore::open_default()?));
    }

    let handle = coordinator.start()?;
    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("console missed {n} runtime events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    println!(
        "duplex-console ready. Type what you would say; {:?} ends the session.",
        config.turn.termination_phrases
    );

    let result = tokio::select! {
        r = handle.wait() => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            handle.shutdown().await
        }
        () = stdin_closed.cancelled() => {
            tracing::info!("end of input, shutting down");
            handle.shutdown().await
        }
    };
    drop(handle);
    printer.abort();

    result.map_err(|e| {
        tracing::error!(error = %e, "duplex-console exited with error");
        anyhow::anyhow!("duplex-console failed: {e}")
    })
}

struct Options {
    config: Option<PathBuf>,
    ephemeral: bool,
}

fn parse_args() -> Result<Option<Options>, VoiceError> {
    let mut options = Options {
        config: None,
        ephemeral: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or_else(|| {
                    VoiceError::Config("--config requires a file path".to_owned())
                })?;
                options.config = Some(PathBuf::from(path));
            }
            "--ephemeral" => options.ephemeral = true,
            "help" | "--help" | "-h" => return Ok(None),
            other => {
                return Err(VoiceError::Config(format!("unknown argument `{other}`")));
            }
        }
    }
    Ok(Some(options))
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  duplex-console [--config <file.toml>] [--ephemeral]");
    eprintln!();
    eprintln!("  --config     load settings from a TOML file");
    eprintln!("  --ephemeral  keep conversation history in memory only");
}

fn load_config(path: Option<&std::path::Path>) -> Result<VoiceConfig, VoiceError> {
    match path {
        Some(path) => VoiceConfig::from_file(path),
        None => {
            let default = VoiceConfig::default_config_path();
            if default.exists() {
                tracing::info!("using config {}", default.display());
                VoiceConfig::from_file(&default)
            } else {
                Ok(VoiceConfig::default())
            }
        }
    }
}

fn print_event(event: &RuntimeEvent) {
    match event {
        RuntimeEvent::StateChanged { to, .. } if *to == AssistantState::Listening => {
            println!("[listening]");
        }
        RuntimeEvent::EchoSuppressed { text, similarity } => {
            println!("[ignored echo {similarity:.2}: {text}]");
        }
        RuntimeEvent::TurnCompleted(turn) => {
            if let Some(target) = &turn.pending_target {
                println!("[practice phrase: {target}]");
            }
        }
        RuntimeEvent::Playback(PlaybackEvent::Started { cached: true, .. }) => {
            println!("[from cache]");
        }
        RuntimeEvent::RecognizerReconnecting { attempt, delay } => {
            println!("[reconnecting: attempt {attempt} in {delay:?}]");
        }
        RuntimeEvent::Shutdown(reason) => println!("[shutting down: {reason:?}]"),
        _ => {}
    }
}

/// Turns stdin lines into final recognition results.
///
/// stdin is read by one task for the life of the process; whichever session
/// is current receives the lines. At end of input `farewell` is sent as a
/// last line, or `closed` is cancelled when there is none.
struct StdinRecognition {
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl StdinRecognition {
    fn spawn(farewell: Option<String>, closed: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut reader = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            match farewell {
                Some(phrase) => {
                    let _ = tx.send(phrase).await;
                }
                None => closed.cancel(),
            }
        });
        Self {
            lines: Arc::new(Mutex::new(rx)),
        }
    }
}

#[async_trait]
impl RecognitionService for StdinRecognition {
    async fn connect(&self) -> duplex_voice::Result<RecognitionSession> {
        let (audio_tx, mut audio_rx) = mpsc::channel(64);
        let (results_tx, results_rx) = mpsc::channel(16);
        let lines = Arc::clone(&self.lines);
        tokio::spawn(async move {
            let mut lines = lines.lock().await;
            let mut open = true;
            loop {
                tokio::select! {
                    frame = audio_rx.recv() => {
                        // No audio backend: gated frames are discarded.
                        if frame.is_none() {
                            break;
                        }
                    }
                    line = lines.recv(), if open => {
                        let Some(text) = line else {
                            open = false;
                            continue;
                        };
                        let result = RecognitionResult { text, is_final: true };
                        if results_tx.send(Ok(result)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(RecognitionSession {
            audio: audio_tx,
            results: results_rx,
        })
    }
}

/// A tiny scripted tutor: greets, proposes phrases to repeat, chats back.
struct PracticeDialogue;

#[async_trait]
impl DialogueCollaborator for PracticeDialogue {
    async fn generate_reply(
        &self,
        user_text: &str,
        context: &ConversationContext,
    ) -> duplex_voice::Result<DialogueReply> {
        let lower = user_text.to_lowercase();
        let reply = if lower.contains("hello") || lower.contains("hola") {
            DialogueReply::with_target(
                "Hi there! Try saying: nice to meet you.",
                "Nice to meet you",
            )
        } else if lower.contains("practice") || lower.contains("again") {
            DialogueReply::with_target(
                "Repeat after me: the weather is lovely today.",
                "The weather is lovely today",
            )
        } else {
            DialogueReply::plain(format!(
                "You said: {user_text}. We have talked {} times so far.",
                context.recent_turns.len() + 1
            ))
        };
        if reply.target_phrase.is_some() && !context.allows_target(&reply.reply_text) {
            return Ok(DialogueReply::plain(reply.reply_text));
        }
        Ok(reply)
    }
}

/// Synthesizes "audio" that is just the UTF-8 text.
struct TextSynthesizer;

#[async_trait]
impl SpeechSynthesizer for TextSynthesizer {
    async fn synthesize(&self, text: &str) -> duplex_voice::Result<Bytes> {
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Prints replies and holds for a speaking-length delay.
#[derive(Default)]
struct ConsoleSink {
    stop_generation: AtomicU64,
}

#[async_trait]
impl AudioSink for ConsoleSink {
    async fn play(&self, audio: Bytes) -> duplex_voice::Result<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let text = String::from_utf8_lossy(&audio).into_owned();
        println!("assistant: {text}");
        let duration = Duration::from_millis(MS_PER_CHAR * text.chars().count() as u64);
        let step = Duration::from_millis(20);
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            if self.stop_generation.load(Ordering::SeqCst) != generation {
                println!("[stopped]");
                return Ok(());
            }
            tokio::time::sleep(step).await;
            elapsed += step;
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
    }
}
