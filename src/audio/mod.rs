#[cfg(feature = "playback")]
pub mod engine;

#[cfg(feature = "playback")]
pub use engine::AudioEngineHandle;

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::survey::CallCue;

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// A call that could not be played. Playback runs independently of the survey
/// clock, so failures travel on their own channel instead of as errors from
/// `play`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackFailure {
    pub clip: PathBuf,
    pub reason: String,
}

pub type FailureSender = mpsc::UnboundedSender<PlaybackFailure>;
pub type FailureReceiver = mpsc::UnboundedReceiver<PlaybackFailure>;

pub fn failure_channel() -> (FailureSender, FailureReceiver) {
    mpsc::unbounded_channel()
}

/// Plays survey calls. `play` only submits the cue and must return promptly;
/// it replaces any call still sounding.
pub trait CallPlayer: Send + Sync {
    fn play(&self, cue: &CallCue) -> Result<(), String>;
    fn stop(&self) -> Result<(), String>;
}

/// Stand-in used when the crate is built without audio output.
#[derive(Debug, Default)]
pub struct SilentPlayer;

impl CallPlayer for SilentPlayer {
    fn play(&self, cue: &CallCue) -> Result<(), String> {
        log_info!(
            "audio output disabled; skipping {} ({}s from {}s)",
            cue.clip.display(),
            cue.duration.as_secs(),
            cue.offset.as_secs()
        );
        Ok(())
    }

    fn stop(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(feature = "playback")]
pub fn default_player(failures: FailureSender) -> Box<dyn CallPlayer> {
    Box::new(AudioEngineHandle::new(failures))
}

#[cfg(not(feature = "playback"))]
pub fn default_player(failures: FailureSender) -> Box<dyn CallPlayer> {
    drop(failures);
    Box::new(SilentPlayer)
}
