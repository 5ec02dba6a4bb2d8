//! Formatting functions for foreground graph runs.
//!
//! Pure functions returning strings; printing happens in the caller.

use chrono::Duration;
use colored::Colorize;
use std::fmt::Write;

use crate::exec::ExecEvent;
use crate::graph::TaskEvent;

/// Banner information for display when a run starts.
#[derive(Debug, Clone)]
pub(crate) struct BannerInfo {
    pub graph: String,
    pub exec: String,
    pub workdir: String,
    pub tasks: usize,
}

/// Tally of task outcomes for the closing summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RunTally {
    pub completed: usize,
    pub failed: usize,
    /// Tasks that never started because something upstream failed.
    pub blocked: usize,
    pub cancelled: bool,
}

impl RunTally {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && !self.cancelled
    }
}

/// Formats a duration for display (e.g., "2h 5m 30s").
pub(crate) fn format_duration(duration: &Duration) -> String {
    let total_seconds = duration.num_seconds();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Formats the startup banner for display.
pub(crate) fn format_banner(info: &BannerInfo) -> String {
    let mut out = String::new();

    writeln!(&mut out, "\n{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(
        &mut out,
        "{}",
        format!("   Running {} graph", info.graph).yellow().bold()
    )
    .unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "  Exec:       {}", info.exec.cyan().bold()).unwrap();
    writeln!(&mut out, "  Workdir:    {}", info.workdir.cyan()).unwrap();
    writeln!(&mut out, "  Tasks:      {}", info.tasks.to_string().cyan()).unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "\n  {} to stop\n", "Ctrl+C".dimmed()).unwrap();

    out
}

/// Formats one task event. Output chunks become one prefixed line per line
/// of text.
pub(crate) fn format_task_event(event: &TaskEvent) -> String {
    let prefix = format!("[{}]", event.task_id).dimmed().to_string();

    match &event.event {
        ExecEvent::Start { .. } => format!("{} {}", "▶".blue(), event.title.bold()),
        ExecEvent::Stdout { data, .. } => prefixed_lines(&prefix, data, false),
        ExecEvent::Stderr { data, .. } => prefixed_lines(&prefix, data, true),
        ExecEvent::Complete { .. } => format!("{} {}", "✓".green().bold(), event.title),
        ExecEvent::Error { message, .. } => {
            format!("{} {}: {}", "✗".red().bold(), event.title, message.red())
        }
    }
}

fn prefixed_lines(prefix: &str, data: &str, stderr: bool) -> String {
    data.lines()
        .map(|line| {
            if stderr {
                format!("{prefix} {}", line.yellow())
            } else {
                format!("{prefix} {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Formats the closing summary.
pub(crate) fn format_summary(tally: &RunTally, elapsed: &Duration) -> String {
    let mut out = String::new();

    let headline = if tally.cancelled {
        format!("{} Run cancelled.", "🛑".red())
    } else if tally.success() {
        format!("{} Run finished.", "✅".green())
    } else {
        format!("{} Run failed.", "❌".red())
    };
    writeln!(&mut out, "\n{headline}").unwrap();
    writeln!(
        &mut out,
        "  Completed: {}",
        tally.completed.to_string().green()
    )
    .unwrap();
    if tally.failed > 0 {
        writeln!(&mut out, "  Failed:    {}", tally.failed.to_string().red()).unwrap();
    }
    if tally.blocked > 0 {
        writeln!(
            &mut out,
            "  Blocked:   {}",
            tally.blocked.to_string().yellow()
        )
        .unwrap();
    }
    writeln!(&mut out, "  Elapsed:   {}", format_duration(elapsed).cyan()).unwrap();

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_ansi_codes(s: &str) -> String {
        let mut result = String::new();
        let mut chars = s.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch == '\x1b' && chars.peek() == Some(&'[') {
                chars.next();
                while let Some(c) = chars.next() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            } else {
                result.push(ch);
            }
        }
        result
    }

    fn task_event(event: ExecEvent) -> TaskEvent {
        TaskEvent {
            task_id: "install".to_string(),
            title: "Install dependencies".to_string(),
            event,
        }
    }

    #[test]
    fn test_format_banner() {
        let output = strip_ansi_codes(&format_banner(&BannerInfo {
            graph: "start".to_string(),
            exec: "docker".to_string(),
            workdir: "/workspace".to_string(),
            tasks: 3,
        }));
        assert!(output.contains("Running start graph"));
        assert!(output.contains("docker"));
        assert!(output.contains("/workspace"));
        assert!(output.contains('3'));
    }

    #[test]
    fn test_format_stdout_prefixes_each_line() {
        let output = strip_ansi_codes(&format_task_event(&task_event(ExecEvent::stdout(
            "added 12 packages\naudited 13 packages\n",
        ))));
        assert_eq!(
            output,
            "[install] added 12 packages\n[install] audited 13 packages"
        );
    }

    #[test]
    fn test_format_lifecycle_events() {
        let start = strip_ansi_codes(&format_task_event(&task_event(ExecEvent::start())));
        assert!(start.contains("Install dependencies"));

        let done = strip_ansi_codes(&format_task_event(&task_event(ExecEvent::complete())));
        assert!(done.starts_with('✓'));

        let failed = strip_ansi_codes(&format_task_event(&task_event(ExecEvent::error(
            "exited with status 1",
        ))));
        assert!(failed.contains("Install dependencies: exited with status 1"));
    }

    #[test]
    fn test_format_summary_success() {
        let tally = RunTally {
            completed: 2,
            ..Default::default()
        };
        let output = strip_ansi_codes(&format_summary(&tally, &Duration::seconds(65)));
        assert!(output.contains("Run finished"));
        assert!(output.contains("1m 5s"));
        assert!(!output.contains("Failed"));
    }

    #[test]
    fn test_format_summary_failure() {
        let tally = RunTally {
            completed: 1,
            failed: 1,
            blocked: 2,
            cancelled: false,
        };
        assert!(!tally.success());
        let output = strip_ansi_codes(&format_summary(&tally, &Duration::seconds(3)));
        assert!(output.contains("Run failed"));
        assert!(output.contains("Blocked:   2"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::seconds(45)), "45s");
        assert_eq!(format_duration(&Duration::seconds(3665)), "1h 1m 5s");
    }
}
