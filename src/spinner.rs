//! Terminal progress indicators for slow sandbox operations.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TICKS: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .tick_strings(&TICKS)
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Spinner following one operation through its phase labels
pub struct PhaseSpinner {
    pb: ProgressBar,
    subject: String,
}

impl PhaseSpinner {
    pub fn start(subject: &str, first_phase: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_style(spinner_style());
        let spinner = Self {
            pb,
            subject: subject.to_string(),
        };
        spinner.phase(first_phase);
        spinner
    }

    /// Show `label` as the current phase
    pub fn phase(&self, label: &str) {
        self.pb.set_message(format!("{}: {}", self.subject, label));
    }

    pub fn succeed(&self, msg: &str) {
        self.pb.finish_with_message(format!("✔ {}", msg));
    }

    pub fn fail(&self, msg: &str) {
        self.pb.finish_with_message(format!("✘ {}", msg));
    }
}

/// Run an operation with a spinner, showing success/failure.
pub fn with_spinner<T, F>(msg: &str, op: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let spinner = PhaseSpinner::start(msg, "working");
    let result = op();
    match &result {
        Ok(_) => spinner.succeed(msg),
        Err(_) => spinner.fail(msg),
    }
    result
}
