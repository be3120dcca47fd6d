use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

use crate::survey::{CallCue, PhaseTimings, SurveyProtocol};

pub const DEBUG_ENV_VAR: &str = "COHA_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SurveySettings {
    /// Recording of the call broadcast at the start of each call phase.
    pub call_clip: PathBuf,
    pub call_offset_secs: u64,
    pub call_duration_secs: u64,
    pub tick_interval_ms: u64,
    pub protocol: SurveyProtocol,
    /// Observer id that switches the survey into debug timings.
    pub debug_observer: String,
    /// Last observer id used; recorded with each survey.
    pub observer: Option<String>,
    /// Last quadrat surveyed.
    pub quadrat: Option<String>,
    pub timings: PhaseTimings,
    pub debug_timings: PhaseTimings,
}

impl Default for SurveySettings {
    fn default() -> Self {
        Self {
            call_clip: PathBuf::from("static/coha-call.mp3"),
            call_offset_secs: 0,
            call_duration_secs: 30,
            tick_interval_ms: 250,
            protocol: SurveyProtocol::ThreeCall,
            debug_observer: "debug@coha.test".into(),
            observer: None,
            quadrat: None,
            timings: PhaseTimings::standard(),
            debug_timings: PhaseTimings::debug(),
        }
    }
}

impl SurveySettings {
    pub fn call_cue(&self) -> CallCue {
        CallCue {
            clip: self.call_clip.clone(),
            offset: Duration::from_secs(self.call_offset_secs),
            duration: Duration::from_secs(self.call_duration_secs),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn timings_for(&self, debug: bool) -> PhaseTimings {
        if debug {
            self.debug_timings
        } else {
            self.timings
        }
    }

    /// Debug mode is on when requested explicitly, through the environment, or when
    /// the observer id matches the configured sentinel.
    pub fn debug_enabled(&self, flag: bool, env_value: Option<&str>, observer: Option<&str>) -> bool {
        let from_env = env_value
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let from_observer = observer
            .map(|id| !self.debug_observer.is_empty() && id.trim().eq_ignore_ascii_case(&self.debug_observer))
            .unwrap_or(false);
        flag || from_env || from_observer
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<SurveySettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed settings in {}: {}", path.display(), err);
                SurveySettings::default()
            })
        } else {
            SurveySettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn survey(&self) -> SurveySettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update_survey(&self, settings: SurveySettings) -> Result<()> {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &SurveySettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
