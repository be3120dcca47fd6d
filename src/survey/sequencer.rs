use std::time::{Duration, Instant};

use super::countdown::{format_remaining, Countdown};
use super::phase::{CallCue, PhasePlan, SURVEY_COMPLETE_MESSAGE};
use super::state::{SurveySnapshot, SurveyStatus};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Side effect requested by a transition. The host applies them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurveyEffect {
    ShowRemaining(String),
    ShowMessage(String),
    PlayCall(CallCue),
    HaltCall,
    PhaseStarted { phase_index: usize },
    PhaseCompleted { phase_index: usize },
    SurveyCompleted,
    SurveyStopped { phase_index: usize, remaining: Duration },
}

/// Chains the phases of a plan. Every transition is a plain method call that takes
/// the current instant and returns effects, so the sequencer owns no timers and
/// performs no I/O.
#[derive(Debug, Clone)]
pub struct SurveySequencer {
    plan: PhasePlan,
    debug: bool,
    status: SurveyStatus,
    countdown: Option<Countdown>,
    phases_started: usize,
    phases_completed: usize,
    message: Option<String>,
    display: String,
}

impl SurveySequencer {
    pub fn new(plan: PhasePlan, debug: bool) -> Self {
        Self {
            plan,
            debug,
            status: SurveyStatus::Idle,
            countdown: None,
            phases_started: 0,
            phases_completed: 0,
            message: None,
            display: format_remaining(Duration::ZERO),
        }
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn status(&self) -> SurveyStatus {
        self.status
    }

    /// Countdowns created during the current run.
    pub fn phases_started(&self) -> usize {
        self.phases_started
    }

    pub fn phases_completed(&self) -> usize {
        self.phases_completed
    }

    /// Idle, Complete or Stopped -> Running(0). Ignored while a survey is running.
    pub fn start(&mut self, now: Instant) -> Vec<SurveyEffect> {
        let mut effects = Vec::new();
        if self.status.is_running() {
            log_warn!("start requested while survey already running; ignoring");
            return effects;
        }

        self.countdown = None;
        self.phases_started = 0;
        self.phases_completed = 0;
        log_info!(
            "starting {} survey with {} phases (debug: {})",
            self.plan.protocol().as_str(),
            self.plan.len(),
            self.debug
        );

        if self.plan.is_empty() {
            self.finish(&mut effects);
        } else {
            self.begin_phase(0, now, &mut effects);
        }
        effects
    }

    /// Running(i) -> Stopped. Ignored in any other state.
    pub fn stop(&mut self, now: Instant) -> Vec<SurveyEffect> {
        let mut effects = Vec::new();
        let Some(phase_index) = self.status.phase_index() else {
            return effects;
        };

        let remaining = self
            .countdown
            .as_mut()
            .map(|countdown| countdown.pause(now))
            .unwrap_or(Duration::ZERO);
        self.status = SurveyStatus::Stopped;
        self.display = format_remaining(remaining);
        log_info!(
            "survey stopped during phase {} with {} left",
            phase_index,
            self.display
        );

        effects.push(SurveyEffect::HaltCall);
        effects.push(SurveyEffect::ShowRemaining(self.display.clone()));
        effects.push(SurveyEffect::SurveyStopped {
            phase_index,
            remaining,
        });
        effects
    }

    /// Recomputes remaining time and advances when the active countdown crosses zero.
    pub fn tick(&mut self, now: Instant) -> Vec<SurveyEffect> {
        let mut effects = Vec::new();
        let Some(phase_index) = self.status.phase_index() else {
            return effects;
        };
        let Some(countdown) = self.countdown.as_mut() else {
            return effects;
        };

        let step = countdown.step(now);
        self.display = format_remaining(step.remaining);
        effects.push(SurveyEffect::ShowRemaining(self.display.clone()));

        if step.completed {
            self.advance(phase_index, now, &mut effects);
        }
        effects
    }

    pub fn snapshot(&self, now: Instant) -> SurveySnapshot {
        let remaining = match (self.status, self.countdown.as_ref()) {
            (SurveyStatus::Running { .. } | SurveyStatus::Stopped, Some(countdown)) => {
                countdown.remaining(now)
            }
            _ => Duration::ZERO,
        };

        SurveySnapshot {
            status: self.status,
            protocol: self.plan.protocol(),
            debug: self.debug,
            phase_count: self.plan.len(),
            phases_completed: self.phases_completed,
            remaining_ms: remaining.as_millis() as u64,
            display: format_remaining(remaining),
            message: self.message.clone(),
        }
    }

    fn advance(&mut self, phase_index: usize, now: Instant, effects: &mut Vec<SurveyEffect>) {
        self.phases_completed += 1;
        effects.push(SurveyEffect::PhaseCompleted { phase_index });

        let next = phase_index + 1;
        if next < self.plan.len() {
            self.begin_phase(next, now, effects);
        } else {
            self.finish(effects);
        }
    }

    fn begin_phase(&mut self, phase_index: usize, now: Instant, effects: &mut Vec<SurveyEffect>) {
        let Some(phase) = self.plan.get(phase_index).cloned() else {
            self.finish(effects);
            return;
        };

        // The previous countdown is either completed or never existed.
        self.countdown = Some(Countdown::start(phase.duration, now));
        self.status = SurveyStatus::Running { phase_index };
        self.phases_started += 1;
        self.message = Some(phase.message.clone());
        self.display = format_remaining(phase.duration);

        effects.push(SurveyEffect::PhaseStarted { phase_index });
        effects.push(SurveyEffect::ShowMessage(phase.message));
        if let Some(cue) = phase.cue {
            effects.push(SurveyEffect::PlayCall(cue));
        }
        effects.push(SurveyEffect::ShowRemaining(self.display.clone()));
    }

    fn finish(&mut self, effects: &mut Vec<SurveyEffect>) {
        self.countdown = None;
        self.status = SurveyStatus::Complete;
        self.display = format_remaining(Duration::ZERO);
        self.message = Some(SURVEY_COMPLETE_MESSAGE.to_string());
        log_info!("survey complete after {} phases", self.phases_completed);

        effects.push(SurveyEffect::ShowMessage(SURVEY_COMPLETE_MESSAGE.to_string()));
        effects.push(SurveyEffect::SurveyCompleted);
    }
}
