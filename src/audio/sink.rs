//! Audio playback through an external player subprocess.
//!
//! Samples are written to a temporary WAV file and handed to `mpv` (or the
//! platform fallback). The cross-process playback lock is held from just
//! before the player starts until it exits, so sibling gateways never talk
//! over each other.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::audio::AudioLock;
use crate::{Error, Result};

/// Result of one playback
#[derive(Debug, Clone, Copy)]
pub struct PlaybackOutcome {
    /// Wall-clock playback time
    pub duration_ms: f64,
    /// False when the player was killed by `stop`
    pub completed: bool,
}

/// Plays PCM buffers through an external player process
pub struct AudioSink {
    player: String,
    lock: AudioLock,
    current: Mutex<Option<Child>>,
    stopped: AtomicBool,
}

impl AudioSink {
    /// Create a sink using `preferred` as the player command, falling back
    /// to `afplay` (macOS) or `aplay` (Linux) when it is not installed.
    #[must_use]
    pub fn new(preferred: &str, lock: AudioLock) -> Self {
        let player = if command_exists(preferred) {
            preferred.to_string()
        } else if cfg!(target_os = "macos") && command_exists("afplay") {
            tracing::info!(preferred, "player not found, falling back to afplay");
            "afplay".to_string()
        } else if command_exists("aplay") {
            tracing::info!(preferred, "player not found, falling back to aplay");
            "aplay".to_string()
        } else {
            tracing::warn!(preferred, "player not found and no fallback available");
            preferred.to_string()
        };

        Self {
            player,
            lock,
            current: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Serialise samples to a temporary WAV file and play it, holding the
    /// cross-process playback lock for the duration. Blocks the calling
    /// thread until the player exits.
    ///
    /// # Errors
    ///
    /// Returns error if the WAV cannot be written or the player cannot be
    /// spawned.
    pub fn play(&self, samples: &[f32], sample_rate: u32) -> Result<PlaybackOutcome> {
        let wav = tempfile::Builder::new()
            .prefix("chorus-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| Error::Audio(format!("cannot create temp wav: {e}")))?;
        write_wav(wav.path(), samples, sample_rate)?;

        let _guard = self.lock.acquire()?;
        self.stopped.store(false, Ordering::SeqCst);

        let start = Instant::now();
        let child = Command::new(&self.player)
            .args(player_args(&self.player, wav.path()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Audio(format!("cannot spawn {}: {e}", self.player)))?;

        *lock_poisoned(&self.current) = Some(child);
        let status = self.wait_current();
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let interrupted = self.stopped.swap(false, Ordering::SeqCst);
        if interrupted {
            tracing::debug!("playback interrupted by stop");
            return Ok(PlaybackOutcome {
                duration_ms,
                completed: false,
            });
        }

        match status {
            Some(status) if status.success() => Ok(PlaybackOutcome {
                duration_ms,
                completed: true,
            }),
            Some(status) => Err(Error::Audio(format!(
                "player exited with {status}",
            ))),
            None => Err(Error::Audio("player exited abnormally".to_string())),
        }
    }

    /// Poll the current child until it exits. Polling (rather than a
    /// blocking `wait`) keeps the child reachable for `stop`.
    fn wait_current(&self) -> Option<std::process::ExitStatus> {
        loop {
            {
                let mut current = lock_poisoned(&self.current);
                match current.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            *current = None;
                            return Some(status);
                        }
                        Ok(None) => {}
                        Err(_) => {
                            *current = None;
                            return None;
                        }
                    },
                    None => return None,
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Kill the current player, if any. Returns true when something was
    /// actually playing.
    pub fn stop(&self) -> bool {
        let mut current = lock_poisoned(&self.current);
        if let Some(child) = current.as_mut() {
            self.stopped.store(true, Ordering::SeqCst);
            let _ = child.kill();
            let _ = child.wait();
            *current = None;
            tracing::info!("stopped audio playback");
            true
        } else {
            false
        }
    }

    /// True while a player subprocess is running
    pub fn is_playing(&self) -> bool {
        lock_poisoned(&self.current).is_some()
    }

    /// Play a short cue sound file, best effort. Does not take the
    /// playback lock; cues are sub-second and never worth blocking a
    /// sibling's speech for.
    pub fn play_cue(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        let result = Command::new(&self.player)
            .args(player_args(&self.player, path))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match result {
            Ok(mut child) => {
                let deadline = Instant::now() + Duration::from_secs(2);
                while Instant::now() < deadline {
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                let _ = child.kill();
            }
            Err(e) => tracing::debug!(error = %e, "ready cue failed"),
        }
    }
}

fn player_args(player: &str, path: &Path) -> Vec<String> {
    let path = path.display().to_string();
    match player {
        "mpv" => vec![
            "--no-terminal".to_string(),
            "--no-video".to_string(),
            path,
        ],
        _ => vec![path],
    }
}

fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| Error::Audio(e.to_string()))?;
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer
            .write_sample(sample_i16)
            .map_err(|e| Error::Audio(e.to_string()))?;
    }
    writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(())
}

fn lock_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::audio_lock_path;

    #[test]
    fn wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let samples = vec![0.0f32, 0.5, -0.5, 1.0, -1.0];
        write_wav(&path, &samples, 16_000).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read.len(), samples.len());
        assert_eq!(read[0], 0);
        assert_eq!(read[3], 32767);
    }

    #[test]
    fn player_args_for_mpv() {
        let args = player_args("mpv", Path::new("/tmp/x.wav"));
        assert_eq!(args[0], "--no-terminal");
        assert_eq!(args.last().map(String::as_str), Some("/tmp/x.wav"));
    }

    #[test]
    fn stop_without_playback_is_noop() {
        let sink = AudioSink::new("definitely-not-a-player", AudioLock::new(audio_lock_path()));
        assert!(!sink.stop());
        assert!(!sink.is_playing());
    }
}
