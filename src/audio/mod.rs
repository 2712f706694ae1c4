//! Audio device plumbing: microphone capture, playback, and the
//! cross-process playback lock.

mod capture;
mod lock;
mod sink;

pub use capture::{
    FrameSource, MicFrames, MicFramesI16, CAPTURE_SAMPLE_RATE, VAD_FRAME_LEN, WAKE_FRAME_LEN,
};
pub use lock::{AudioLock, AudioLockGuard};
pub use sink::{AudioSink, PlaybackOutcome};
