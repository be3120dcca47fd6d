use serde::{Deserialize, Serialize};

use super::phase::SurveyProtocol;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum SurveyStatus {
    #[default]
    Idle,
    Running {
        phase_index: usize,
    },
    /// Final phase finished; waits for the observer to stop the survey.
    Complete,
    Stopped,
}

impl SurveyStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SurveyStatus::Running { .. })
    }

    pub fn phase_index(&self) -> Option<usize> {
        match self {
            SurveyStatus::Running { phase_index } => Some(*phase_index),
            _ => None,
        }
    }
}

/// Point-in-time view of a survey, suitable for rendering or JSON output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveySnapshot {
    pub status: SurveyStatus,
    pub protocol: SurveyProtocol,
    pub debug: bool,
    pub phase_count: usize,
    pub phases_completed: usize,
    pub remaining_ms: u64,
    pub display: String,
    pub message: Option<String>,
}
