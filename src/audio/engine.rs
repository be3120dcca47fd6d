use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::fs::File;
use std::io::BufReader;
use std::sync::{
    mpsc::{self, Sender},
    Arc, Mutex,
};
use std::thread;

use super::{CallPlayer, FailureSender, PlaybackFailure};
use crate::survey::CallCue;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

enum AudioCommand {
    Play(CallCue),
    Stop,
}

type CueSource = rodio::source::TakeDuration<rodio::source::SkipDuration<Decoder<BufReader<File>>>>;

/// Handle to the dedicated audio thread. rodio's output objects are not `Send`,
/// so they live on that thread and are driven through a command channel.
pub struct AudioEngineHandle {
    tx: Arc<Mutex<Option<Sender<AudioCommand>>>>,
    failures: FailureSender,
}

impl AudioEngineHandle {
    pub fn new(failures: FailureSender) -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
            failures,
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AudioCommand>, String> {
        if let Some(tx) = self.tx.lock().map_err(|e| e.to_string())?.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<AudioCommand>();
        let failures = self.failures.clone();

        thread::Builder::new()
            .name("survey-audio".to_string())
            .spawn(move || {
                // The device stays open for the life of the thread; only sinks are rebuilt.
                let mut output: Option<(OutputStream, OutputStreamHandle)> = None;
                let mut sink: Option<Sink> = None;

                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        AudioCommand::Play(cue) => {
                            // One playback handle at a time.
                            if let Some(old) = sink.take() {
                                old.stop();
                            }

                            let started = decode_cue(&cue).and_then(|source| {
                                let handle = ensure_output(&mut output)?;
                                let new_sink = Sink::try_new(handle)
                                    .map_err(|e| format!("Failed to create audio sink: {}", e))?;
                                new_sink.append(source);
                                new_sink.play();
                                Ok(new_sink)
                            });

                            match started {
                                Ok(new_sink) => {
                                    log_info!(
                                        "playing {} for {}s",
                                        cue.clip.display(),
                                        cue.duration.as_secs()
                                    );
                                    sink = Some(new_sink);
                                }
                                Err(reason) => {
                                    log_error!("call playback failed: {}", reason);
                                    let _ = failures.send(PlaybackFailure {
                                        clip: cue.clip.clone(),
                                        reason,
                                    });
                                }
                            }
                        }
                        AudioCommand::Stop => {
                            if let Some(old) = sink.take() {
                                old.stop();
                            }
                        }
                    }
                }
            })
            .map_err(|e| e.to_string())?;

        let tx_clone = tx.clone();
        *self.tx.lock().map_err(|e| e.to_string())? = Some(tx);
        Ok(tx_clone)
    }
}

fn ensure_output(
    output: &mut Option<(OutputStream, OutputStreamHandle)>,
) -> Result<&OutputStreamHandle, String> {
    if output.is_none() {
        let opened = OutputStream::try_default()
            .map_err(|e| format!("Failed to create audio output stream: {}", e))?;
        *output = Some(opened);
    }
    output
        .as_ref()
        .map(|(_, handle)| handle)
        .ok_or_else(|| "audio output stream unavailable".to_string())
}

fn decode_cue(cue: &CallCue) -> Result<CueSource, String> {
    let file = File::open(&cue.clip)
        .map_err(|e| format!("Failed to open {}: {}", cue.clip.display(), e))?;
    let source = Decoder::new(BufReader::new(file))
        .map_err(|e| format!("Failed to decode {}: {}", cue.clip.display(), e))?;
    Ok(source
        .skip_duration(cue.offset)
        .take_duration(cue.duration))
}

impl CallPlayer for AudioEngineHandle {
    fn play(&self, cue: &CallCue) -> Result<(), String> {
        let tx = self.ensure_thread()?;
        tx.send(AudioCommand::Play(cue.clone()))
            .map_err(|e| e.to_string())
    }

    fn stop(&self) -> Result<(), String> {
        if let Ok(Some(tx)) = self.tx.lock().map(|g| g.clone()) {
            let _ = tx.send(AudioCommand::Stop);
        }
        Ok(())
    }
}
