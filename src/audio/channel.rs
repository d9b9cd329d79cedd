//! Bounded hand-off of captured frames from the capture source to the gate.
//!
//! The channel is the single point of truth for "is there unconsumed audio".
//! Producers run on the audio callback thread and must never block there for
//! long, so [`AudioChannel::push`] either evicts the oldest frame or waits a
//! short, configured time before giving up on the new one.

use crate::config::{AudioConfig, OverflowPolicy};
use crate::pipeline::messages::AudioFrame;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Result of a [`AudioChannel::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued without loss.
    Queued,
    /// Frame queued after evicting the oldest queued frame.
    EvictedOldest,
    /// Queue stayed full for the whole backpressure window; frame dropped.
    Dropped,
    /// Channel closed; frame dropped.
    Closed,
}

/// Result of a [`AudioChannel::pull`].
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// The next frame, in capture order.
    Frame(AudioFrame),
    /// Nothing arrived within the timeout.
    Empty,
    /// The channel was closed and fully drained.
    Closed,
}

/// Cloneable, thread-safe bounded frame queue.
///
/// Any number of clones may push; exactly one consumer is expected to pull.
#[derive(Clone)]
pub struct AudioChannel {
    tx: Sender<AudioFrame>,
    rx: Receiver<AudioFrame>,
    policy: OverflowPolicy,
    push_timeout: Duration,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl AudioChannel {
    /// Create a channel holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy, push_timeout: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            policy,
            push_timeout,
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a channel from the audio section of the config.
    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            config.channel_capacity,
            config.overflow,
            Duration::from_millis(config.push_timeout_ms),
        )
    }

    /// Hand a frame to the consumer. Never blocks longer than the
    /// configured push timeout.
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }
        match self.policy {
            OverflowPolicy::DropOldest => self.push_drop_oldest(frame),
            OverflowPolicy::Backpressure => match self.tx.send_timeout(frame, self.push_timeout) {
                Ok(()) => PushOutcome::Queued,
                Err(SendTimeoutError::Timeout(dropped)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(index = dropped.index, "audio channel full, dropping newest frame");
                    PushOutcome::Dropped
                }
                Err(SendTimeoutError::Disconnected(_)) => PushOutcome::Closed,
            },
        }
    }

    fn push_drop_oldest(&self, frame: AudioFrame) -> PushOutcome {
        let mut frame = frame;
        let mut evicted = false;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => {
                    return if evicted {
                        PushOutcome::EvictedOldest
                    } else {
                        PushOutcome::Queued
                    };
                }
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    // The consumer may drain concurrently, so an empty
                    // try_recv just means there is room now.
                    if let Ok(old) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(index = old.index, "audio channel full, evicting oldest frame");
                        evicted = true;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
            }
        }
    }

    /// Take the next frame, waiting at most `timeout`. Never fails on an
    /// empty queue.
    pub fn pull(&self, timeout: Duration) -> Pull {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Pull::Frame(frame),
            Err(RecvTimeoutError::Timeout) if self.is_closed() => Pull::Closed,
            Err(RecvTimeoutError::Timeout) => Pull::Empty,
            Err(RecvTimeoutError::Disconnected) => Pull::Closed,
        }
    }

    /// Stop accepting frames. Frames already queued can still be pulled.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Total frames lost to overflow since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
