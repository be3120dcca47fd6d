use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Number of call-and-listen phases in the standard protocol.
pub const CALL_COUNT: usize = 3;

pub const SURVEY_COMPLETE_MESSAGE: &str =
    "Survey complete. Record whether a Cooper's Hawk responded, then stop the survey.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PhaseKind {
    /// Silent listening before any call is broadcast.
    Listen,
    /// Broadcast the call at phase start, then listen for the rest of the phase.
    CallAndListen { call_number: usize, total_calls: usize },
}

/// A slice of a recording to broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallCue {
    pub clip: PathBuf,
    pub offset: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub kind: PhaseKind,
    pub duration: Duration,
    pub message: String,
    pub cue: Option<CallCue>,
}

/// Phase lengths in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimings {
    pub initial_listen_secs: u64,
    pub call_listen_secs: u64,
    pub final_listen_secs: u64,
}

impl PhaseTimings {
    pub const fn standard() -> Self {
        Self {
            initial_listen_secs: 120,
            call_listen_secs: 60,
            final_listen_secs: 180,
        }
    }

    pub const fn debug() -> Self {
        Self {
            initial_listen_secs: 3,
            call_listen_secs: 22,
            final_listen_secs: 22,
        }
    }

    pub fn select(debug: bool) -> Self {
        if debug {
            Self::debug()
        } else {
            Self::standard()
        }
    }
}

impl Default for PhaseTimings {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SurveyProtocol {
    /// Initial listen followed by three call-and-listen phases.
    #[default]
    ThreeCall,
    /// A single listening phase, no broadcast.
    Silent,
}

impl SurveyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurveyProtocol::ThreeCall => "ThreeCall",
            SurveyProtocol::Silent => "Silent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "threecall" | "three-call" | "three_call" => Some(SurveyProtocol::ThreeCall),
            "silent" => Some(SurveyProtocol::Silent),
            _ => None,
        }
    }
}

/// The ordered, immutable list of phases for one survey run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhasePlan {
    protocol: SurveyProtocol,
    phases: Vec<Phase>,
}

impl PhasePlan {
    /// `call` is the full-length cue; each phase receives a copy clamped to its own
    /// duration.
    pub fn build(protocol: SurveyProtocol, timings: PhaseTimings, call: &CallCue) -> Self {
        let initial = Duration::from_secs(timings.initial_listen_secs);

        let phases = match protocol {
            SurveyProtocol::Silent => vec![Phase {
                kind: PhaseKind::Listen,
                duration: initial,
                message: listen_message(initial),
                cue: None,
            }],
            SurveyProtocol::ThreeCall => {
                let mut phases = Vec::with_capacity(CALL_COUNT + 1);
                phases.push(Phase {
                    kind: PhaseKind::Listen,
                    duration: initial,
                    message: listen_message(initial),
                    cue: None,
                });

                for call_number in 1..=CALL_COUNT {
                    let secs = if call_number == CALL_COUNT {
                        timings.final_listen_secs
                    } else {
                        timings.call_listen_secs
                    };
                    let duration = Duration::from_secs(secs);
                    phases.push(Phase {
                        kind: PhaseKind::CallAndListen {
                            call_number,
                            total_calls: CALL_COUNT,
                        },
                        duration,
                        message: call_message(call_number, CALL_COUNT, duration),
                        cue: Some(clamp_cue(call, duration)),
                    });
                }
                phases
            }
        };

        Self { protocol, phases }
    }

    pub fn protocol(&self) -> SurveyProtocol {
        self.protocol
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn get(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn total_duration(&self) -> Duration {
        self.phases.iter().map(|phase| phase.duration).sum()
    }

    pub fn call_count(&self) -> usize {
        self.phases.iter().filter(|phase| phase.cue.is_some()).count()
    }
}

fn clamp_cue(call: &CallCue, phase_duration: Duration) -> CallCue {
    CallCue {
        clip: call.clip.clone(),
        offset: call.offset,
        duration: call.duration.min(phase_duration),
    }
}

fn describe(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        if minutes == 1 {
            "1 minute".to_string()
        } else {
            format!("{minutes} minutes")
        }
    } else {
        format!("{secs} seconds")
    }
}

fn listen_message(duration: Duration) -> String {
    format!(
        "Listen quietly for {} and note any Cooper's Hawk calls.",
        describe(duration)
    )
}

fn call_message(call_number: usize, total_calls: usize, duration: Duration) -> String {
    let listen = describe(duration);
    if call_number == 1 {
        format!("Playing the first call. Watch and listen for a response for {listen}.")
    } else if call_number == total_calls {
        format!("Playing the final call. Keep listening for {listen}.")
    } else {
        format!("Playing call {call_number} of {total_calls}. Listen for a response for {listen}.")
    }
}
