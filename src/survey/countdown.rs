use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CountdownState {
    /// `budget` is what was left when the current running window opened at `anchor`.
    Running { anchor: Instant, budget: Duration },
    Paused { remaining: Duration },
    Completed,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownStep {
    pub remaining: Duration,
    /// True only on the tick that crossed zero.
    pub completed: bool,
}

/// Countdown bound to one phase.
///
/// Remaining time is always derived from the anchor instant and the caller's `now`
/// instead of decrementing a counter, so late or bunched ticks never accumulate
/// drift. Completion is a terminal state: it is reported by exactly one `step`.
#[derive(Debug, Clone)]
pub struct Countdown {
    state: CountdownState,
}

impl Countdown {
    pub fn start(total: Duration, now: Instant) -> Self {
        Self {
            state: CountdownState::Running {
                anchor: now,
                budget: total,
            },
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, CountdownState::Running { .. })
    }

    pub fn is_completed(&self) -> bool {
        self.state == CountdownState::Completed
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.state {
            CountdownState::Running { anchor, budget } => {
                budget.saturating_sub(now.saturating_duration_since(anchor))
            }
            CountdownState::Paused { remaining } => remaining,
            CountdownState::Completed => Duration::ZERO,
        }
    }

    pub fn step(&mut self, now: Instant) -> CountdownStep {
        let remaining = self.remaining(now);
        let completed = self.is_running() && remaining.is_zero();
        if completed {
            self.state = CountdownState::Completed;
        }
        CountdownStep {
            remaining,
            completed,
        }
    }

    /// Halts the countdown and reports what is left. Pausing a paused or completed
    /// countdown just reports again.
    pub fn pause(&mut self, now: Instant) -> Duration {
        let remaining = self.remaining(now);
        if self.is_running() {
            self.state = CountdownState::Paused { remaining };
        }
        remaining
    }

    /// No-op unless paused.
    pub fn resume(&mut self, now: Instant) {
        if let CountdownState::Paused { remaining } = self.state {
            self.state = CountdownState::Running {
                anchor: now,
                budget: remaining,
            };
        }
    }
}

/// Formats remaining time as `M:SS`, flooring to whole seconds.
pub fn format_remaining(remaining: Duration) -> String {
    let ms = remaining.as_millis();
    let minutes = ms / 60_000;
    let seconds = (ms / 1_000) % 60;
    format!("{minutes}:{seconds:02}")
}
