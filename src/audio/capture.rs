//! Microphone capture as fixed-size frames.
//!
//! Opens the default input device at 16 kHz mono and regroups the device's
//! arbitrary callback buffers into the exact frame sizes the detectors
//! expect: 512 samples for voice-activity detection, 1280 samples (80 ms)
//! for wake word scoring.
//!
//! `cpal::Stream` is not `Send`; open the stream on the thread that will
//! consume it (the pipelines run their capture loops on blocking worker
//! threads).

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for all capture (16 kHz for speech models)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Frame size expected by the voice activity detector
pub const VAD_FRAME_LEN: usize = 512;

/// Frame size expected by the wake word detector (80 ms at 16 kHz)
pub const WAKE_FRAME_LEN: usize = 1280;

/// Source of fixed-size float frames. Implemented by the live microphone
/// and by scripted in-memory sources in the test suite.
pub trait FrameSource {
    /// Next frame, or `None` if nothing arrived within `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>>;
}

fn input_config() -> Result<(cpal::Device, StreamConfig)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

    let config = supported
        .with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = CAPTURE_SAMPLE_RATE,
        "input device selected"
    );

    Ok((device, config))
}

/// Live microphone delivering f32 frames of a fixed length
pub struct MicFrames {
    _stream: cpal::Stream,
    rx: Receiver<Vec<f32>>,
}

impl MicFrames {
    /// Open the default microphone and start the stream.
    ///
    /// # Errors
    ///
    /// Returns error if no input device is available or the stream cannot
    /// be built.
    pub fn open(frame_len: usize) -> Result<Self> {
        let (device, config) = input_config()?;
        let (tx, rx) = mpsc::channel::<Vec<f32>>();

        let mut pending: Vec<f32> = Vec::with_capacity(frame_len * 2);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    pending.extend_from_slice(data);
                    while pending.len() >= frame_len {
                        let frame: Vec<f32> = pending.drain(..frame_len).collect();
                        // Receiver gone means the pipeline is shutting down.
                        if tx.send(frame).is_err() {
                            pending.clear();
                            break;
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "capture stream error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        tracing::debug!(frame_len, "microphone capture started");

        Ok(Self {
            _stream: stream,
            rx,
        })
    }
}

impl FrameSource for MicFrames {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Audio("capture stream closed".to_string()))
            }
        }
    }
}

/// Live microphone delivering int16 frames, used by the wake word scorer.
/// The device is opened in f32 and converted; not every backend negotiates
/// a native i16 stream.
pub struct MicFramesI16 {
    _stream: cpal::Stream,
    rx: Receiver<Vec<i16>>,
}

impl MicFramesI16 {
    /// Open the default microphone and start the stream.
    ///
    /// # Errors
    ///
    /// Returns error if no input device is available or the stream cannot
    /// be built.
    pub fn open(frame_len: usize) -> Result<Self> {
        let (device, config) = input_config()?;
        let (tx, rx) = mpsc::channel::<Vec<i16>>();

        let mut pending: Vec<i16> = Vec::with_capacity(frame_len * 2);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    pending.extend(data.iter().map(|s| {
                        #[allow(clippy::cast_possible_truncation)]
                        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                        v
                    }));
                    while pending.len() >= frame_len {
                        let frame: Vec<i16> = pending.drain(..frame_len).collect();
                        if tx.send(frame).is_err() {
                            pending.clear();
                            break;
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "capture stream error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        tracing::debug!(frame_len, "int16 microphone capture started");

        Ok(Self {
            _stream: stream,
            rx,
        })
    }

    /// Next frame, or `None` if nothing arrived within `timeout`.
    pub fn next_frame(&mut self, timeout: Duration) -> Option<Vec<i16>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Discard any frames already queued, e.g. audio captured while the
    /// wake phrase itself was being spoken.
    pub fn drain_pending(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}
