use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;
use terminal_size::{Width, Height, terminal_size};
use crate::vm::{ProgressSink, TaskOutcome};

pub fn print_header(subtitle: &str) {
    let (width, _) = terminal_size().unwrap_or((Width(80), Height(24)));
    let width = (width.0 as usize).min(100);

    let line = "─".repeat(width);
    println!("{}", line.black().bold());

    let name = "muon".cyan().bold();
    let version = format!("v{}", env!("CARGO_PKG_VERSION")).black().bold();
    println!("  {} {}", name, version);
    println!("  {}", subtitle.cyan());

    println!("{}", line.black().bold());
}

pub fn print_step(msg: &str) {
    println!("  {} {}", "•".green(), msg);
}

pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green().bold(), msg.green());
}

pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠️ ".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("  {} {}", "❌".red().bold(), msg.red());
}

pub fn print_thinking(msg: &str) {
    println!("  {} {}...", "∴".magenta(), msg);
}

/// Print `key: value` rows with the keys aligned
pub fn print_fields<'a>(rows: impl IntoIterator<Item = (&'a str, String)>) {
    let rows: Vec<_> = rows.into_iter().collect();
    let key_width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in rows {
        println!("  {:width$}  {}", key.cyan(), value.green(), width = key_width);
    }
}

/// Spinner for short waits on the API
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::with_template("  {spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb
}

/// Progress bar fed by the task tracker
#[derive(Default)]
pub struct TaskProgress {
    state: Mutex<Option<(ProgressBar, String)>>,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for TaskProgress {
    fn begin(&self, message: &str) {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "  {spinner:.cyan} {msg:.cyan} [{bar:30.cyan/blue}] {pos:>3}% ({elapsed_precise})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));

        if let Ok(mut state) = self.state.lock() {
            *state = Some((bar, message.to_string()));
        }
    }

    fn update(&self, percent: f64) {
        if let Ok(state) = self.state.lock() {
            if let Some((bar, _)) = state.as_ref() {
                bar.set_position(percent.round() as u64);
            }
        }
    }

    fn settling(&self) {
        if let Ok(state) = self.state.lock() {
            if let Some((bar, message)) = state.as_ref() {
                bar.set_message(format!("Waiting for {} to complete", message));
            }
        }
    }

    fn finish(&self, outcome: &TaskOutcome) {
        let Ok(mut state) = self.state.lock() else { return };
        let Some((bar, message)) = state.take() else { return };

        match outcome {
            TaskOutcome::Succeeded => bar.finish_and_clear(),
            _ => bar.abandon(),
        }
        match outcome {
            TaskOutcome::Succeeded => print_success(&format!("{} completed", message)),
            TaskOutcome::Failed(_) => print_error(&format!("{} failed", message)),
            TaskOutcome::Unknown(_) => print_warning(&format!("{} status unknown", message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_progress_lifecycle() {
        let progress = TaskProgress::new();
        progress.update(10.0);

        progress.begin("Copying data from template");
        progress.update(42.4);
        {
            let state = progress.state.lock().unwrap();
            let (bar, message) = state.as_ref().unwrap();
            assert_eq!(bar.position(), 42);
            assert_eq!(message, "Copying data from template");
        }

        progress.settling();
        progress.finish(&TaskOutcome::Succeeded);
        assert!(progress.state.lock().unwrap().is_none());
    }
}
