pub mod controller;
pub mod countdown;
pub mod phase;
pub mod sequencer;
pub mod state;

pub use controller::SurveyController;
pub use countdown::{format_remaining, Countdown, CountdownStep};
pub use phase::{CallCue, Phase, PhaseKind, PhasePlan, PhaseTimings, SurveyProtocol};
pub use sequencer::{SurveyEffect, SurveySequencer};
pub use state::{SurveySnapshot, SurveyStatus};
