//! Job records, statuses and signals.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::option_duration_ms;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Executing (or eligible to)
    Running,
    /// Suspended by `SIGSTOP`
    Stopped,
    /// Finished successfully
    Completed,
    /// Finished with an error or non-zero exit
    Failed,
    /// Terminated by a signal or a timeout
    Killed,
}

impl JobStatus {
    /// Completed, failed and killed jobs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
        };
        f.pad(name)
    }
}

/// Job control signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Terminate
    #[serde(rename = "SIGTERM")]
    Term,
    /// Kill
    #[serde(rename = "SIGKILL")]
    Kill,
    /// Suspend a running job
    #[serde(rename = "SIGSTOP")]
    Stop,
    /// Resume a stopped job
    #[serde(rename = "SIGCONT")]
    Cont,
}

impl Signal {
    /// Conventional signal name, e.g. `SIGTERM`.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Stop => "SIGSTOP",
            Signal::Cont => "SIGCONT",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signal name that is not one of the supported job control signals
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown signal: {0}")]
pub struct UnknownSignal(pub String);

impl FromStr for Signal {
    type Err = UnknownSignal;

    /// Accepts `SIGTERM`, `TERM` and `15` style names (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" | "15" => Ok(Signal::Term),
            "KILL" | "9" => Ok(Signal::Kill),
            "STOP" | "19" => Ok(Signal::Stop),
            "CONT" | "18" => Ok(Signal::Cont),
            _ => Err(UnknownSignal(s.to_string())),
        }
    }
}

/// Options for [`JobController::start_job`](super::JobController::start_job)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Run detached from the terminal
    pub background: bool,
    /// Kill the job if it is still live after this long
    pub timeout: Option<Duration>,
}

impl JobOptions {
    /// Options for a foreground job.
    pub fn foreground() -> Self {
        Self::default()
    }

    /// Options for a background job.
    pub fn background() -> Self {
        Self {
            background: true,
            timeout: None,
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One tracked command invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Session-unique id, assigned in increasing order and never reused
    pub job_id: u32,
    /// External process id the executor reports completion under
    pub process_id: u32,
    /// Command line as typed
    pub command: String,
    /// Current status
    pub status: JobStatus,
    /// Start time as Unix milliseconds
    pub start_time: u64,
    /// Time the job reached a terminal status, as Unix milliseconds
    pub end_time: Option<u64>,
    /// Attached to the terminal
    pub foreground: bool,
    /// Exit code once finished
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub output: String,
    /// Captured standard error
    pub error_output: String,
    /// Wall-clock budget before the sweeper kills the job
    #[serde(with = "option_duration_ms", default)]
    pub timeout: Option<Duration>,
}

impl Job {
    pub(crate) fn new(
        job_id: u32,
        process_id: u32,
        command: String,
        options: JobOptions,
        start_time: u64,
    ) -> Self {
        Self {
            job_id,
            process_id,
            command,
            status: JobStatus::Running,
            start_time,
            end_time: None,
            foreground: !options.background,
            exit_code: None,
            output: String::new(),
            error_output: String::new(),
            timeout: options.timeout,
        }
    }

    /// Whether the job has finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Shell banner announcing that this job finished.
    ///
    /// Background jobs get the `[n]+` prefix, like a shell reporting an
    /// asynchronous job before the next prompt.
    pub fn banner(&self) -> String {
        let state = match self.status {
            JobStatus::Completed => "Done".to_string(),
            JobStatus::Failed => match self.exit_code {
                Some(code) => format!("Exit {}", code),
                None => "Failed".to_string(),
            },
            JobStatus::Killed => "Killed".to_string(),
            JobStatus::Stopped => "Stopped".to_string(),
            JobStatus::Running => "Running".to_string(),
        };
        if self.foreground {
            format!("{:<8}{}", state, self.command)
        } else {
            format!("[{}]+  {:<8}{}", self.job_id, state, self.command)
        }
    }
}
