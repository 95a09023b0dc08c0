use anstyle::{AnsiColor, Style};
use is_terminal::IsTerminal;
use std::fmt::Display;
use std::io::{self, Write};
use std::time::{Duration, Instant};

const STATUS_WIDTH: usize = 12;

#[derive(Debug, Clone, Copy)]
enum StatusKind {
    Pending,
    Success,
    Info,
    Warn,
    Error,
}

/// Status output goes to stderr; stdout is reserved for activation scripts.
fn supports_color() -> bool {
    io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

fn style_for(kind: StatusKind) -> Style {
    let style = Style::new().bold();
    match kind {
        StatusKind::Pending => style.fg_color(Some(AnsiColor::Cyan.into())),
        StatusKind::Success => style.fg_color(Some(AnsiColor::Green.into())),
        StatusKind::Info => style.fg_color(Some(AnsiColor::Blue.into())),
        StatusKind::Warn => style.fg_color(Some(AnsiColor::Yellow.into())),
        StatusKind::Error => style.fg_color(Some(AnsiColor::Red.into())),
    }
}

/// Label right-aligned in a fixed column; continuation lines are indented
/// under the message.
fn render_status(kind: StatusKind, label: &str, message: &str, color: bool) -> String {
    let (prefix, suffix) = if color {
        let style = style_for(kind);
        (style.render().to_string(), style.render_reset().to_string())
    } else {
        (String::new(), String::new())
    };

    let mut rendered = String::new();
    for (idx, line) in message.split('\n').enumerate() {
        if idx == 0 {
            rendered.push_str(&format!("{prefix}{label:>STATUS_WIDTH$}{suffix} {line}\n"));
        } else {
            rendered.push_str(&format!("{:>STATUS_WIDTH$} {line}\n", ""));
        }
    }
    rendered
}

fn write_status(kind: StatusKind, label: &str, message: &str) {
    let rendered = render_status(kind, label, message, supports_color());
    let mut handle = io::stderr().lock();
    let _ = handle.write_all(rendered.as_bytes());
    let _ = handle.flush();
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 60 {
        let minutes = duration.as_secs() / 60;
        let seconds = duration.as_secs() % 60;
        if seconds == 0 {
            format!("{minutes}m")
        } else {
            format!("{minutes}m {seconds}s")
        }
    } else if duration.as_secs_f64() >= 1.0 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if duration.as_millis() >= 1 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}µs", duration.as_micros())
    }
}

pub fn status(label: &str, message: impl Display) {
    write_status(StatusKind::Pending, label, &message.to_string());
}

pub fn info(message: impl Display) {
    write_status(StatusKind::Info, "Info", &message.to_string());
}

pub fn warn(message: impl Display) {
    write_status(StatusKind::Warn, "Warning", &message.to_string());
}

pub fn error(message: impl Display) {
    write_status(StatusKind::Error, "Error", &message.to_string());
}

pub fn success(label: &str, message: impl Display) {
    write_status(StatusKind::Success, label, &message.to_string());
}

pub struct Progress {
    message: String,
    started: Instant,
    complete: bool,
}

impl Progress {
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        let label = label.into();
        let message = message.into();
        write_status(StatusKind::Pending, &label, &message);

        Self {
            message,
            started: Instant::now(),
            complete: false,
        }
    }

    pub fn success(mut self, label: &str, detail: Option<String>) {
        if self.complete {
            return;
        }

        self.complete = true;
        let mut combined = self.message.clone();
        if let Some(detail) = detail {
            if !detail.is_empty() {
                combined.push_str(" ");
                combined.push_str(&detail);
            }
        }
        let elapsed = format_duration(self.started.elapsed());
        combined.push_str(" in ");
        combined.push_str(&elapsed);

        write_status(StatusKind::Success, label, &combined);
    }

    pub fn fail(mut self, label: &str, error: impl Display) {
        if self.complete {
            return;
        }

        self.complete = true;
        let elapsed = format_duration(self.started.elapsed());
        let combined = format!("{} after {}: {}", self.message, elapsed, error);
        write_status(StatusKind::Error, label, &combined);
    }
}

impl Progress {
    /// Line reported when the progress is dropped unfinished, e.g. while an
    /// error unwinds through `?`.
    fn cancellation(&self) -> Option<String> {
        (!self.complete).then(|| format!("{} (aborted)", self.message))
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if let Some(message) = self.cancellation() {
            write_status(StatusKind::Warn, "Cancelled", &message);
            self.complete = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::from_micros(250), "250µs")]
    #[case(Duration::from_millis(42), "42ms")]
    #[case(Duration::from_millis(1500), "1.50s")]
    #[case(Duration::from_secs(120), "2m")]
    #[case(Duration::from_secs(125), "2m 5s")]
    fn formats_elapsed_time(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(format_duration(duration), expected);
    }

    #[test]
    fn status_lines_align_labels_and_continuations() {
        let rendered = render_status(StatusKind::Error, "Failed", "nixpkgs\nhash mismatch", false);
        assert_eq!(rendered, "      Failed nixpkgs\n             hash mismatch\n");

        let colored = render_status(StatusKind::Success, "Built", "rustc", true);
        assert!(colored.starts_with("\u{1b}["));
        assert!(colored.contains("Built"));
    }

    #[test]
    fn unfinished_progress_reports_cancellation() {
        let progress = Progress::new("Resolving", "rust-overlay");
        assert_eq!(
            progress.cancellation().as_deref(),
            Some("rust-overlay (aborted)")
        );
        drop(progress);

        let mut finished = Progress::new("Building", "rust-toolchain 1.82.0");
        finished.complete = true;
        assert!(finished.cancellation().is_none());
    }
}
