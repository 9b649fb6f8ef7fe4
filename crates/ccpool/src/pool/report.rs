//! Per-job reports and where they are written.

use std::fmt;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    /// Non-zero exit. `code` is `None` when the process was killed by a signal.
    Failed { code: Option<i32> },
    /// The compiler could not be started at all.
    SpawnFailed { reason: String },
}

impl JobStatus {
    pub fn from_exit(status: ExitStatus) -> Self {
        if status.success() {
            Self::Succeeded
        } else {
            Self::Failed {
                code: status.code(),
            }
        }
    }

    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Succeeded)
    }
}

/// Everything printed for one harvested job, emitted as a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub source: PathBuf,
    pub output: PathBuf,
    pub command_line: String,
    pub compiler: String,
    /// Combined stdout/stderr, in the order the child wrote it.
    pub captured: String,
    /// `captured` stops short of what the job wrote.
    pub truncated: bool,
    pub status: JobStatus,
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Building file: {}", self.source.display())?;
        writeln!(f, "> {}", self.command_line)?;
        f.write_str(&self.captured)?;
        if !self.captured.is_empty() && !self.captured.ends_with('\n') {
            f.write_str("\n")?;
        }
        if self.truncated {
            writeln!(
                f,
                "[output truncated: the output pipe was still open after {} exited]",
                self.compiler
            )?;
        }
        match &self.status {
            JobStatus::Succeeded => Ok(()),
            JobStatus::Failed { code: Some(code) } => {
                writeln!(f, "{} exited with error code: {code}", self.compiler)
            }
            JobStatus::Failed { code: None } => {
                writeln!(f, "{} was terminated by a signal", self.compiler)
            }
            JobStatus::SpawnFailed { reason } => {
                writeln!(f, "{} could not be started: {reason}", self.compiler)
            }
        }
    }
}

/// Receives each job report exactly once, at harvest time.
pub trait ReportSink: Send {
    fn report(&mut self, report: &JobReport);
}

/// Writes reports to stdout, one blank line between jobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn report(&mut self, report: &JobReport) {
        let mut out = std::io::stdout().lock();
        let result = writeln!(out, "{report}").and_then(|()| out.flush());
        if let Err(e) = result {
            warn!(source = %report.source.display(), error = %e, "Failed to write job report");
        }
    }
}

/// Keeps reports in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    reports: Arc<Mutex<Vec<JobReport>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far, in report order.
    pub fn reports(&self) -> Vec<JobReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ReportSink for MemorySink {
    fn report(&mut self, report: &JobReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn report(captured: &str, status: JobStatus) -> JobReport {
        JobReport {
            source: "src/lexer.c".into(),
            output: "build/lexer.o".into(),
            command_line: "gcc -o build/lexer.o -c src/lexer.c".to_string(),
            compiler: "gcc".to_string(),
            captured: captured.to_string(),
            truncated: false,
            status,
        }
    }

    #[test]
    fn success_prints_trace_and_output() {
        let text = report("", JobStatus::Succeeded).to_string();
        assert_eq!(
            text,
            "Building file: src/lexer.c\n> gcc -o build/lexer.o -c src/lexer.c\n"
        );
    }

    #[test]
    fn failure_names_compiler_and_exit_code() {
        let text = report(
            "src/lexer.c:3:1: error: expected ';'",
            JobStatus::Failed { code: Some(2) },
        )
        .to_string();
        assert!(text.contains("src/lexer.c:3:1: error: expected ';'\n"));
        assert!(text.ends_with("gcc exited with error code: 2\n"));
    }

    #[test]
    fn signal_and_spawn_failures_have_notices() {
        let killed = report("", JobStatus::Failed { code: None }).to_string();
        assert!(killed.contains("gcc was terminated by a signal"));

        let missing = report(
            "",
            JobStatus::SpawnFailed {
                reason: "No such file or directory".to_string(),
            },
        )
        .to_string();
        assert!(missing.contains("gcc could not be started: No such file or directory"));
    }

    #[test]
    fn truncated_output_gets_a_notice_before_the_status() {
        let mut truncated = report("partial line", JobStatus::Failed { code: Some(1) });
        truncated.truncated = true;
        let text = truncated.to_string();
        assert!(text.contains(
            "partial line\n[output truncated: the output pipe was still open after gcc exited]\ngcc exited"
        ));
    }

    #[test]
    fn memory_sink_clones_share_reports() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.report(&report("ok\n", JobStatus::Succeeded));
        writer.report(&report("", JobStatus::Failed { code: Some(1) }));

        let reports = sink.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports[1].status.is_failure());
        assert!(!reports[0].status.is_failure());
    }
}
