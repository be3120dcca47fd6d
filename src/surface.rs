use std::io::{self, Write};
use std::sync::Mutex;

/// Where the survey writes what the observer sees.
pub trait SurveySurface: Send + Sync {
    /// Countdown text, `M:SS`. Called on every tick.
    fn show_remaining(&self, display: &str);
    fn show_message(&self, message: &str);
    /// Non-fatal problems the observer should know about, e.g. a call that failed to play.
    fn alert(&self, message: &str);
}

/// Renders the countdown on a single rewritten terminal line.
pub struct TerminalSurface {
    last_display: Mutex<String>,
}

impl TerminalSurface {
    pub fn new() -> Self {
        Self {
            last_display: Mutex::new(String::new()),
        }
    }
}

impl Default for TerminalSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl SurveySurface for TerminalSurface {
    fn show_remaining(&self, display: &str) {
        let mut last = match self.last_display.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Ticks arrive four times a second; only redraw when the text changes.
        if *last == display {
            return;
        }
        *last = display.to_string();

        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "\r  {display}  ");
        let _ = stdout.flush();
    }

    fn show_message(&self, message: &str) {
        println!("\n{message}");
    }

    fn alert(&self, message: &str) {
        eprintln!("\n[!] {message}");
    }
}
