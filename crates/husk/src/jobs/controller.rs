//! Job table with shell-style job control.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::job::{Job, JobOptions, JobStatus, Signal};
use crate::clock::unix_millis;
use crate::limits::duration_ms;

/// Errors from starting a job
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// Too many live jobs
    #[error("job capacity exceeded: {max_jobs} live jobs allowed")]
    CapacityExceeded {
        /// Configured maximum
        max_jobs: usize,
    },
    /// The process already has a live job
    #[error("process {process_id} already has live job {job_id}")]
    ProcessBusy {
        /// Process that was asked to start a second job
        process_id: u32,
        /// Its live job
        job_id: u32,
    },
}

/// Job controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Maximum number of running or stopped jobs
    pub max_jobs: usize,
    /// How long finished jobs stay visible before [`JobController::sweep`] drops them
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    /// Period of the sweeper the kernel starts
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_jobs: 32,
            retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one [`JobController::sweep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Live jobs killed for running past their timeout
    pub timed_out: usize,
    /// Finished jobs dropped after the retention period
    pub removed: usize,
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: BTreeMap<u32, Job>,
    /// Most recent job per process
    by_process: HashMap<u32, u32>,
    next_id: u32,
    notifications: Vec<String>,
}

impl JobTable {
    fn live_count(&self) -> usize {
        self.jobs.values().filter(|job| !job.is_terminal()).count()
    }

    fn latest_for(&self, process_id: u32) -> Option<u32> {
        self.by_process.get(&process_id).copied()
    }

    /// Move a live job to `status`, stamping the end time and queueing a
    /// banner when the job finishes. Terminal jobs are left alone.
    fn transition(&mut self, job_id: u32, status: JobStatus, now: u64) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if job.is_terminal() {
            tracing::debug!(job_id, %status, current = %job.status, "ignoring transition out of terminal status");
            return false;
        }
        if job.status == status {
            return true;
        }
        tracing::debug!(job_id, from = %job.status, to = %status, "job status change");
        job.status = status;
        if status.is_terminal() {
            job.end_time = Some(now);
            let banner = job.banner();
            self.notifications.push(banner);
        }
        true
    }
}

/// Tracks every command the kernel runs.
///
/// All operations are safe to call from any thread; each one takes the table
/// lock for its whole duration, so callers observe a consistent snapshot.
#[derive(Debug)]
pub struct JobController {
    config: JobConfig,
    table: Mutex<JobTable>,
}

impl Default for JobController {
    fn default() -> Self {
        Self::new(JobConfig::default())
    }
}

impl JobController {
    /// Create a controller with the given configuration.
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            table: Mutex::new(JobTable {
                next_id: 1,
                ..JobTable::default()
            }),
        }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new running job for `process_id`.
    pub fn start_job(
        &self,
        command: &str,
        process_id: u32,
        options: JobOptions,
    ) -> Result<Job, JobError> {
        let mut table = self.table();

        let live = table.live_count();
        if live >= self.config.max_jobs {
            tracing::warn!(live, max_jobs = self.config.max_jobs, "job capacity exceeded");
            return Err(JobError::CapacityExceeded {
                max_jobs: self.config.max_jobs,
            });
        }
        if let Some(existing) = table.latest_for(process_id)
            && table.jobs.get(&existing).is_some_and(|job| !job.is_terminal())
        {
            return Err(JobError::ProcessBusy {
                process_id,
                job_id: existing,
            });
        }

        let job_id = table.next_id;
        table.next_id += 1;
        let job = Job::new(job_id, process_id, command.to_string(), options, unix_millis());
        table.jobs.insert(job_id, job.clone());
        table.by_process.insert(process_id, job_id);

        tracing::info!(job_id, process_id, command, background = options.background, "job started");
        Ok(job)
    }

    /// Record a status change reported by the executor for `process_id`.
    ///
    /// Exit code and output are stored when the job finishes. Returns false
    /// when there is no such job or it has already finished.
    pub fn update_job_status(
        &self,
        process_id: u32,
        status: JobStatus,
        exit_code: Option<i32>,
        output: Option<&str>,
        error_output: Option<&str>,
    ) -> bool {
        let mut table = self.table();
        let Some(job_id) = table.latest_for(process_id) else {
            tracing::debug!(process_id, "status update for unknown process");
            return false;
        };

        if status.is_terminal()
            && let Some(job) = table.jobs.get_mut(&job_id)
            && !job.is_terminal()
        {
            job.exit_code = exit_code;
            if let Some(output) = output {
                job.output = output.to_string();
            }
            if let Some(error_output) = error_output {
                job.error_output = error_output.to_string();
            }
        }
        table.transition(job_id, status, unix_millis())
    }

    /// Snapshot of one job.
    pub fn get_job(&self, job_id: u32) -> Option<Job> {
        self.table().jobs.get(&job_id).cloned()
    }

    /// Snapshot of the most recent job started for `process_id`.
    pub fn get_job_by_process(&self, process_id: u32) -> Option<Job> {
        let table = self.table();
        let job_id = table.latest_for(process_id)?;
        table.jobs.get(&job_id).cloned()
    }

    /// Every tracked job in ascending id order.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.table().jobs.values().cloned().collect()
    }

    /// Number of running or stopped jobs.
    pub fn live_jobs(&self) -> usize {
        self.table().live_count()
    }

    /// Bring a job to the foreground, resuming it if stopped.
    pub fn foreground_job(&self, job_id: u32) -> bool {
        let mut table = self.table();
        match table.jobs.get_mut(&job_id) {
            Some(job) if !job.is_terminal() => {
                job.foreground = true;
                if job.status == JobStatus::Stopped {
                    job.status = JobStatus::Running;
                }
                true
            }
            _ => false,
        }
    }

    /// Send the job to the background, resuming it if stopped.
    pub fn background_job(&self, job_id: u32) -> bool {
        let mut table = self.table();
        match table.jobs.get_mut(&job_id) {
            Some(job) if !job.is_terminal() => {
                job.foreground = false;
                if job.status == JobStatus::Stopped {
                    job.status = JobStatus::Running;
                }
                true
            }
            _ => false,
        }
    }

    /// Deliver a job control signal.
    ///
    /// `SIGTERM` and `SIGKILL` kill a live job, `SIGSTOP` suspends a running
    /// one and `SIGCONT` resumes a stopped one. Returns false for unknown or
    /// finished jobs.
    pub fn send_signal(&self, job_id: u32, signal: Signal) -> bool {
        let mut table = self.table();
        let Some(status) = table.jobs.get(&job_id).map(|job| job.status) else {
            return false;
        };
        if status.is_terminal() {
            return false;
        }

        tracing::debug!(job_id, %signal, "signal");
        match signal {
            Signal::Term | Signal::Kill => table.transition(job_id, JobStatus::Killed, unix_millis()),
            Signal::Stop => {
                if status == JobStatus::Running {
                    table.transition(job_id, JobStatus::Stopped, unix_millis());
                }
                true
            }
            Signal::Cont => {
                if status == JobStatus::Stopped {
                    table.transition(job_id, JobStatus::Running, unix_millis());
                }
                true
            }
        }
    }

    /// [`send_signal`](Self::send_signal) by name; unrecognized names return false.
    pub fn send_signal_named(&self, job_id: u32, signal: &str) -> bool {
        match signal.parse::<Signal>() {
            Ok(signal) => self.send_signal(job_id, signal),
            Err(e) => {
                tracing::debug!(job_id, error = %e, "ignoring signal");
                false
            }
        }
    }

    /// Shorthand for sending `SIGKILL`.
    pub fn kill_job(&self, job_id: u32) -> bool {
        self.send_signal(job_id, Signal::Kill)
    }

    /// Drop a job from the table, whatever its status.
    pub fn remove_job(&self, job_id: u32) -> bool {
        let mut table = self.table();
        let Some(job) = table.jobs.remove(&job_id) else {
            return false;
        };
        if table.by_process.get(&job.process_id) == Some(&job_id) {
            table.by_process.remove(&job.process_id);
        }
        true
    }

    /// Pending completion banners, oldest first.
    pub fn notifications(&self) -> Vec<String> {
        self.table().notifications.clone()
    }

    /// Discard pending banners.
    pub fn clear_notifications(&self) {
        self.table().notifications.clear();
    }

    /// Return and discard pending banners.
    pub fn take_notifications(&self) -> Vec<String> {
        std::mem::take(&mut self.table().notifications)
    }

    /// Kill live jobs that ran past their timeout and drop finished jobs
    /// older than the retention period.
    pub fn sweep(&self) -> SweepReport {
        let now = unix_millis();
        let retention = self.config.retention.as_millis() as u64;
        let mut table = self.table();
        let mut report = SweepReport::default();

        let expired: Vec<u32> = table
            .jobs
            .values()
            .filter(|job| !job.is_terminal())
            .filter(|job| {
                job.timeout.is_some_and(|timeout| {
                    now.saturating_sub(job.start_time) >= timeout.as_millis() as u64
                })
            })
            .map(|job| job.job_id)
            .collect();
        for job_id in expired {
            tracing::info!(job_id, "killing job past its timeout");
            if table.transition(job_id, JobStatus::Killed, now) {
                report.timed_out += 1;
            }
        }

        let stale: Vec<(u32, u32)> = table
            .jobs
            .values()
            .filter(|job| {
                job.end_time
                    .is_some_and(|end| now.saturating_sub(end) >= retention)
            })
            .map(|job| (job.job_id, job.process_id))
            .collect();
        for (job_id, process_id) in stale {
            table.jobs.remove(&job_id);
            if table.by_process.get(&process_id) == Some(&job_id) {
                table.by_process.remove(&process_id);
            }
            report.removed += 1;
        }

        if report != SweepReport::default() {
            tracing::debug!(timed_out = report.timed_out, removed = report.removed, "job sweep");
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `period` until the controller is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.sweep();
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn controller(max_jobs: usize) -> JobController {
        JobController::new(JobConfig {
            max_jobs,
            ..JobConfig::default()
        })
    }

    #[test]
    fn test_start_assigns_increasing_ids() {
        let jobs = controller(4);
        let a = jobs.start_job("ls", 10, JobOptions::foreground()).unwrap();
        let b = jobs.start_job("cat", 11, JobOptions::background()).unwrap();

        assert_eq!(a.job_id, 1);
        assert_eq!(b.job_id, 2);
        assert_eq!(a.status, JobStatus::Running);
        assert!(a.foreground);
        assert!(!b.foreground);
        assert_eq!(jobs.live_jobs(), 2);
    }

    #[test]
    fn test_capacity_counts_live_jobs_only() {
        let jobs = controller(2);
        jobs.start_job("a", 1, JobOptions::default()).unwrap();
        jobs.start_job("b", 2, JobOptions::default()).unwrap();

        let err = jobs.start_job("c", 3, JobOptions::default()).unwrap_err();
        assert_eq!(err, JobError::CapacityExceeded { max_jobs: 2 });

        jobs.update_job_status(1, JobStatus::Completed, Some(0), None, None);
        let c = jobs.start_job("c", 3, JobOptions::default()).unwrap();
        assert_eq!(c.job_id, 3);
    }

    #[test]
    fn test_process_cannot_run_two_live_jobs() {
        let jobs = controller(4);
        jobs.start_job("a", 7, JobOptions::default()).unwrap();
        let err = jobs.start_job("b", 7, JobOptions::default()).unwrap_err();
        assert_eq!(
            err,
            JobError::ProcessBusy {
                process_id: 7,
                job_id: 1
            }
        );

        jobs.update_job_status(7, JobStatus::Failed, Some(1), None, None);
        let b = jobs.start_job("b", 7, JobOptions::default()).unwrap();
        assert_eq!(jobs.get_job_by_process(7).unwrap().job_id, b.job_id);
    }

    #[test]
    fn test_completion_records_output_and_notifies() {
        let jobs = controller(4);
        let job = jobs.start_job("sleep 10", 5, JobOptions::background()).unwrap();

        assert!(jobs.update_job_status(5, JobStatus::Completed, Some(0), Some("out"), Some("err")));

        let done = jobs.get_job(job.job_id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.output, "out");
        assert_eq!(done.error_output, "err");
        assert!(done.end_time.is_some());
        assert_eq!(jobs.notifications(), vec!["[1]+  Done    sleep 10".to_string()]);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let jobs = controller(4);
        let job = jobs.start_job("x", 5, JobOptions::default()).unwrap();
        jobs.update_job_status(5, JobStatus::Failed, Some(3), None, None);

        assert!(!jobs.update_job_status(5, JobStatus::Completed, Some(0), Some("late"), None));
        assert!(!jobs.send_signal(job.job_id, Signal::Kill));

        let after = jobs.get_job(job.job_id).unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.exit_code, Some(3));
        assert_eq!(after.output, "");
        assert_eq!(jobs.notifications().len(), 1);
    }

    #[test]
    fn test_stop_and_continue_ignore_finished_jobs() {
        let jobs = controller(4);
        let done = jobs.start_job("ls", 1, JobOptions::default()).unwrap();
        let killed = jobs.start_job("yes", 2, JobOptions::background()).unwrap();
        jobs.update_job_status(1, JobStatus::Completed, Some(0), None, None);
        assert!(jobs.kill_job(killed.job_id));

        for job_id in [done.job_id, killed.job_id] {
            assert!(!jobs.send_signal(job_id, Signal::Stop));
            assert!(!jobs.send_signal(job_id, Signal::Cont));
        }
        assert_eq!(jobs.get_job(done.job_id).unwrap().status, JobStatus::Completed);
        assert_eq!(jobs.get_job(killed.job_id).unwrap().status, JobStatus::Killed);
        assert_eq!(jobs.notifications().len(), 2);
    }

    #[test]
    fn test_update_unknown_process() {
        let jobs = controller(4);
        assert!(!jobs.update_job_status(99, JobStatus::Completed, Some(0), None, None));
        assert!(jobs.notifications().is_empty());
    }

    #[test]
    fn test_stop_and_continue() {
        let jobs = controller(4);
        let job = jobs.start_job("top", 1, JobOptions::default()).unwrap();

        assert!(jobs.send_signal(job.job_id, Signal::Stop));
        assert_eq!(jobs.get_job(job.job_id).unwrap().status, JobStatus::Stopped);
        // Stopped jobs still count against capacity.
        assert_eq!(jobs.live_jobs(), 1);

        assert!(jobs.send_signal(job.job_id, Signal::Cont));
        assert_eq!(jobs.get_job(job.job_id).unwrap().status, JobStatus::Running);
        assert!(jobs.notifications().is_empty());
    }

    #[test]
    fn test_kill_signal_notifies() {
        let jobs = controller(4);
        let job = jobs.start_job("yes", 1, JobOptions::background()).unwrap();

        assert!(jobs.send_signal_named(job.job_id, "SIGTERM"));
        let killed = jobs.get_job(job.job_id).unwrap();
        assert_eq!(killed.status, JobStatus::Killed);
        assert!(killed.end_time.is_some());
        assert_eq!(jobs.take_notifications(), vec!["[1]+  Killed  yes".to_string()]);
        assert!(jobs.notifications().is_empty());
    }

    #[test]
    fn test_kill_job_and_repeated_stop() {
        let jobs = controller(4);
        let job = jobs.start_job("yes", 1, JobOptions::default()).unwrap();

        assert!(jobs.send_signal(job.job_id, Signal::Stop));
        // A recognized signal on a live job counts even without a transition.
        assert!(jobs.send_signal(job.job_id, Signal::Stop));
        assert!(jobs.kill_job(job.job_id));
        assert!(!jobs.kill_job(job.job_id));
        assert_eq!(jobs.get_job(job.job_id).unwrap().status, JobStatus::Killed);
        assert_eq!(jobs.notifications(), vec!["Killed  yes".to_string()]);
    }

    #[test]
    fn test_signal_unknown_job_or_name() {
        let jobs = controller(4);
        assert!(!jobs.send_signal(42, Signal::Kill));
        let job = jobs.start_job("yes", 1, JobOptions::default()).unwrap();
        assert!(!jobs.send_signal_named(job.job_id, "SIGHUP"));
        assert_eq!(jobs.get_job(job.job_id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_foreground_resumes_stopped_job() {
        let jobs = controller(4);
        let job = jobs.start_job("vim", 1, JobOptions::background()).unwrap();
        jobs.send_signal(job.job_id, Signal::Stop);

        assert!(jobs.foreground_job(job.job_id));
        let fg = jobs.get_job(job.job_id).unwrap();
        assert!(fg.foreground);
        assert_eq!(fg.status, JobStatus::Running);

        assert!(jobs.background_job(job.job_id));
        assert!(!jobs.get_job(job.job_id).unwrap().foreground);

        assert!(!jobs.foreground_job(99));
        jobs.update_job_status(1, JobStatus::Completed, Some(0), None, None);
        assert!(!jobs.foreground_job(job.job_id));
    }

    #[test]
    fn test_list_jobs_in_id_order() {
        let jobs = controller(8);
        for pid in [30, 10, 20] {
            jobs.start_job("cmd", pid, JobOptions::default()).unwrap();
        }
        let ids: Vec<u32> = jobs.list_jobs().iter().map(|job| job.job_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_job() {
        let jobs = controller(4);
        let job = jobs.start_job("a", 1, JobOptions::default()).unwrap();
        assert!(jobs.remove_job(job.job_id));
        assert!(!jobs.remove_job(job.job_id));
        assert!(jobs.get_job_by_process(1).is_none());

        // Ids are never reused.
        let next = jobs.start_job("b", 1, JobOptions::default()).unwrap();
        assert_eq!(next.job_id, 2);
    }

    #[test]
    fn test_sweep_kills_expired_and_drops_retained() {
        let jobs = JobController::new(JobConfig {
            max_jobs: 4,
            retention: Duration::ZERO,
            sweep_interval: Duration::from_secs(1),
        });
        let expired = jobs
            .start_job("spin", 1, JobOptions::background().with_timeout(Duration::ZERO))
            .unwrap();
        let patient = jobs
            .start_job("wait", 2, JobOptions::background().with_timeout(Duration::from_secs(3600)))
            .unwrap();

        let report = jobs.sweep();
        assert_eq!(report.timed_out, 1);
        // Zero retention: the freshly killed job is dropped in the same pass.
        assert_eq!(report.removed, 1);
        assert!(jobs.get_job(expired.job_id).is_none());
        assert_eq!(jobs.get_job(patient.job_id).unwrap().status, JobStatus::Running);
        assert_eq!(jobs.notifications(), vec!["[1]+  Killed  spin".to_string()]);
    }

    #[test]
    fn test_sweep_keeps_recent_finished_jobs() {
        let jobs = controller(4);
        let job = jobs.start_job("a", 1, JobOptions::default()).unwrap();
        jobs.update_job_status(1, JobStatus::Completed, Some(0), None, None);

        assert_eq!(jobs.sweep(), SweepReport::default());
        assert!(jobs.get_job(job.job_id).is_some());
    }

    #[test]
    fn test_config_serialization() {
        let config: JobConfig =
            serde_json::from_str(r#"{"max_jobs": 3, "retention": 1500}"#).unwrap();
        assert_eq!(config.max_jobs, 3);
        assert_eq!(config.retention, Duration::from_millis(1500));
        assert_eq!(config.sweep_interval, JobConfig::default().sweep_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let jobs = Arc::new(JobController::new(JobConfig {
            max_jobs: 4,
            retention: Duration::ZERO,
            sweep_interval: Duration::from_millis(100),
        }));
        let job = jobs.start_job("a", 1, JobOptions::default()).unwrap();
        jobs.update_job_status(1, JobStatus::Completed, Some(0), None, None);

        let handle = jobs.spawn_sweeper(jobs.config().sweep_interval);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(jobs.get_job(job.job_id).is_none());

        drop(jobs);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(handle.is_finished());
    }
}
