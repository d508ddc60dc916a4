//! Terminal rendering of pipeline progress.

use std::io::{self, Write};
use std::sync::Mutex;

use console::style;

use oms_core::logger::{StepLogger, StepOutcome};

/// Step logger printing a compact, styled progress log.
pub struct ConsoleStepLogger<W: Write + Send = io::Stderr> {
    writer: Mutex<W>,
}

impl ConsoleStepLogger<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write + Send> ConsoleStepLogger<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn line(&self, text: std::fmt::Arguments<'_>) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Progress output is best-effort.
        let _ = writeln!(writer, "{text}");
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> StepLogger for ConsoleStepLogger<W> {
    fn step_started(&self, name: &str) {
        self.line(format_args!("{} {}", style("==>").cyan().bold(), style(name).bold()));
    }

    fn step_finished(&self, name: &str, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Done => self.line(format_args!("    {}", style("done").green())),
            StepOutcome::Skipped => self.line(format_args!(
                "{} {} {}",
                style("==>").dim(),
                style(name).dim(),
                style("(skipped)").dim()
            )),
            StepOutcome::Failed => self.line(format_args!("    {}", style("failed").red().bold())),
        }
    }

    fn substep(&self, name: &str) {
        self.line(format_args!("    {} {name}", style("-").dim()));
    }

    fn log_retry(&self) {
        self.line(format_args!("    {}", style("retrying...").yellow()));
    }

    fn log(&self, message: &str) {
        self.line(format_args!("{message}"));
    }
}
