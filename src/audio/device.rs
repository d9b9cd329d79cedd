//! System microphone and speaker via cpal.
//!
//! [`CpalCapture`] feeds the [`AudioChannel`] with fixed-size mono int16
//! frames at the configured rate. [`CpalSink`] plays WAV blobs (as produced
//! by most synthesis services) on the default or named output device.

use crate::audio::channel::{AudioChannel, PushOutcome};
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::AudioFrame;
use crate::tts::AudioSink;
use async_trait::async_trait;
use bytes::Bytes;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the device threads check for cancellation.
const DEVICE_POLL: Duration = Duration::from_millis(20);

fn find_input_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let devices = match name {
        Some(_) => match host.input_devices() {
            Ok(devices) => devices.collect(),
            Err(e) => {
                warn!("cannot enumerate input devices: {e}");
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    select_device("input", name, devices, device_label, || {
        host.default_input_device()
    })
}

fn find_output_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let devices = match name {
        Some(_) => match host.output_devices() {
            Ok(devices) => devices.collect(),
            Err(e) => {
                warn!("cannot enumerate output devices: {e}");
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    select_device("output", name, devices, device_label, || {
        host.default_output_device()
    })
}

/// The device labelled `name`, else the host default. A configured name
/// that matches nothing only warns.
fn select_device<D>(
    kind: &str,
    name: Option<&str>,
    devices: Vec<D>,
    label: impl Fn(&D) -> Option<String>,
    default: impl FnOnce() -> Option<D>,
) -> Result<D> {
    if let Some(name) = name {
        if let Some(device) = devices
            .into_iter()
            .find(|d| label(d).as_deref() == Some(name))
        {
            return Ok(device);
        }
        warn!("{kind} device '{name}' not found, using the default device");
    }
    default().ok_or_else(|| VoiceError::Audio(format!("no default {kind} device")))
}

fn device_label(device: &cpal::Device) -> Option<String> {
    device.description().ok().map(|d| d.name().to_owned())
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into())
}

/// Running microphone capture. Stops when dropped or when its token fires.
pub struct CpalCapture {
    cancel: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalCapture {
    /// Open the input device and start pushing frames into `channel`.
    ///
    /// The stream lives on its own thread; cpal streams are not `Send` on
    /// every platform.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Audio`] if the device cannot be opened or the
    /// stream cannot be started.
    pub fn start(
        config: &AudioConfig,
        channel: AudioChannel,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let config = config.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let thread_cancel = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("duplex-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(&config, channel) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                while !thread_cancel.is_cancelled() {
                    std::thread::sleep(DEVICE_POLL);
                }
                drop(stream);
                info!("audio capture stopped");
            })
            .map_err(|e| VoiceError::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cancel,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::Audio("capture thread exited during start-up".into())),
        }
    }

    /// Stop capturing and wait for the device thread.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(config: &AudioConfig, channel: AudioChannel) -> Result<cpal::Stream> {
    let device = find_input_device(config.input_device.as_deref())?;
    info!("using input device: {}", device_name(&device));

    let default_config = device
        .default_input_config()
        .map_err(|e| VoiceError::Audio(format!("no default input config: {e}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        "native input config: {}Hz, {} channels -> {}Hz mono",
        native_rate, native_channels, config.sample_rate
    );

    let mut assembler = FrameAssembler::new(config.sample_rate, config.samples_per_frame());
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(data, native_channels);
                let resampled = resample(&mono, native_rate, assembler.sample_rate);
                for frame in assembler.push(&resampled) {
                    match channel.push(frame) {
                        PushOutcome::Queued | PushOutcome::EvictedOldest => {}
                        PushOutcome::Dropped => debug!("audio channel full, frame dropped"),
                        PushOutcome::Closed => return,
                    }
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::Audio(format!("failed to build input stream: {e}")))?;
    stream
        .play()
        .map_err(|e| VoiceError::Audio(format!("failed to start input stream: {e}")))?;
    info!("audio capture started");
    Ok(stream)
}

/// Cuts a continuous sample stream into fixed-size int16 frames.
struct FrameAssembler {
    sample_rate: u32,
    frame_len: usize,
    pending: Vec<i16>,
    next_index: u64,
}

impl FrameAssembler {
    fn new(sample_rate: u32, frame_len: usize) -> Self {
        Self {
            sample_rate,
            frame_len: frame_len.max(1),
            pending: Vec::with_capacity(frame_len.max(1)),
            next_index: 0,
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        for &s in samples {
            self.pending.push(f32_to_i16(s));
            if self.pending.len() == self.frame_len {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
                frames.push(AudioFrame::new(full, self.sample_rate, 1, self.next_index));
                self.next_index += 1;
            }
        }
        frames
    }
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = usize::from(channels);
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech in either direction.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(&a), Some(&b)) => (f64::from(a) * (1.0 - frac) + f64::from(b) * frac) as f32,
                (Some(&a), None) => a,
                _ => samples[samples.len() - 1],
            }
        })
        .collect()
}

/// Decoded WAV: mono samples in \[-1, 1\] and their rate.
struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
}

fn decode_wav(blob: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(blob))
        .map_err(|e| VoiceError::Audio(format!("invalid WAV data: {e}")))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VoiceError::Audio(format!("corrupt WAV samples: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoiceError::Audio(format!("corrupt WAV samples: {e}")))?
        }
    };
    Ok(DecodedAudio {
        samples: to_mono(&interleaved, spec.channels),
        sample_rate: spec.sample_rate,
    })
}

/// Encode mono samples as a 16-bit PCM WAV blob.
///
/// # Errors
///
/// Returns [`VoiceError::Audio`] if encoding fails.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Bytes> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Audio(format!("WAV encode failed: {e}")))?;
        for &s in samples {
            writer
                .write_sample(f32_to_i16(s))
                .map_err(|e| VoiceError::Audio(format!("WAV encode failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Audio(format!("WAV encode failed: {e}")))?;
    }
    Ok(Bytes::from(cursor.into_inner()))
}

/// Speaker output for WAV blobs.
///
/// Each `play` opens a stream on a blocking thread and holds it until the
/// audio has drained or [`stop`](AudioSink::stop) is called.
pub struct CpalSink {
    output_device: Option<String>,
    /// Bumped by `stop`; a playback ends once it sees a newer value.
    stop_generation: Arc<AtomicU64>,
}

impl CpalSink {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            output_device: config.output_device.clone(),
            stop_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .output_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

fn play_blocking(
    output_device: Option<&str>,
    audio: DecodedAudio,
    stop_generation: &AtomicU64,
    started_at: u64,
) -> Result<()> {
    let device = find_output_device(output_device)?;
    let default_config = device
        .default_output_config()
        .map_err(|e| VoiceError::Audio(format!("no default output config: {e}")))?;
    let out_rate = default_config.sample_rate();
    let out_channels = usize::from(default_config.channels().max(1));
    let stream_config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: out_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples: resample(&audio.samples, audio.sample_rate, out_rate),
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let Ok(mut buf) = buffer_clone.lock() else {
                    return;
                };
                for frame in data.chunks_mut(out_channels) {
                    let value = if buf.position < buf.samples.len() {
                        let v = buf.samples[buf.position];
                        buf.position += 1;
                        v
                    } else {
                        buf.finished = true;
                        0.0
                    };
                    frame.fill(value);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::Audio(format!("failed to build output stream: {e}")))?;
    stream
        .play()
        .map_err(|e| VoiceError::Audio(format!("failed to start output stream: {e}")))?;

    loop {
        std::thread::sleep(DEVICE_POLL);
        if stop_generation.load(Ordering::Acquire) != started_at {
            debug!("playback stopped early");
            break;
        }
        let buf = buffer
            .lock()
            .map_err(|e| VoiceError::Audio(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }
    drop(stream);
    Ok(())
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, audio: Bytes) -> Result<()> {
        let decoded = decode_wav(&audio)?;
        let started_at = self.stop_generation.load(Ordering::Acquire);
        let stop_generation = Arc::clone(&self.stop_generation);
        let output_device = self.output_device.clone();
        tokio::task::spawn_blocking(move || {
            play_blocking(
                output_device.as_deref(),
                decoded,
                &stop_generation,
                started_at,
            )
        })
        .await
        .map_err(|e| {
            warn!("playback thread failed: {e}");
            VoiceError::Audio(format!("playback thread failed: {e}"))
        })?
    }

    fn stop(&self) {
        self.stop_generation.fetch_add(1, Ordering::AcqRel);
    }
}
