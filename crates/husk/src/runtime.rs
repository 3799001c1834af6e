//! The kernel facade and its data contracts.
//!
//! A [`Kernel`] ties the three subsystems together: every module run is
//! registered with the [`JobController`], executed by the
//! [`ExecutionEngine`], and its outcome reported back to the job table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, KernelConfig};
use crate::engine::{EngineError, ExecutionEngine, ExecutionResult, ModuleConfig};
use crate::jobs::{Job, JobController, JobError, JobOptions, JobStatus};
use crate::limits::ResourceLimits;
use crate::vfs::{VfsError, VirtualFileSystem};

/// Entry point invoked when a run does not name one.
pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Exit code reported when a run times out.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported when a module cannot be loaded.
pub const EXIT_LOAD_FAILURE: i32 = 126;

/// First process id handed out to runs that do not bring their own.
const FIRST_PROCESS_ID: u32 = 1000;

/// Errors surfaced by the kernel
#[derive(Debug, Error)]
pub enum KernelError {
    /// Module load or execution failed
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The job table refused the run
    #[error(transparent)]
    Job(#[from] JobError),
    /// File system error
    #[error(transparent)]
    Vfs(#[from] VfsError),
    /// Bad configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl KernelError {
    /// Shell exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            KernelError::Engine(EngineError::Timeout { .. }) => EXIT_TIMEOUT,
            KernelError::Engine(EngineError::Load { .. }) => EXIT_LOAD_FAILURE,
            _ => 1,
        }
    }
}

/// Inputs for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContext {
    /// Arguments, including the program name at index 0 by convention
    pub args: Vec<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Standard input
    pub stdin: String,
    /// Working directory
    pub working_directory: String,
    /// Process id the job is tracked under
    pub process_id: u32,
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecutionResult {
    /// Process id the job was tracked under
    pub process_id: u32,
    /// Command line as typed
    pub command: String,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code
    pub exit_code: i32,
    /// Wall clock time in milliseconds
    pub execution_time_ms: u64,
    /// Module that ran, if one was loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    /// Entry point that ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Linear memory size at the end of the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_usage: Option<u64>,
}

impl CommandExecutionResult {
    /// Result for an invocation that returned.
    pub fn from_execution(process_id: u32, command: &str, result: ExecutionResult) -> Self {
        Self {
            process_id,
            command: command.to_string(),
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            execution_time_ms: result.stats.wall_time_ms,
            module_name: Some(result.module_name),
            function_name: Some(result.function_name),
            peak_memory_usage: Some(result.stats.peak_memory_bytes),
        }
    }

    /// Result for a run that failed before or during execution.
    ///
    /// The error message goes to stderr and the exit code follows shell
    /// conventions: 124 for a timeout, 126 when the module cannot be loaded.
    pub fn from_error(process_id: u32, command: &str, error: &KernelError) -> Self {
        Self {
            process_id,
            command: command.to_string(),
            stdout: String::new(),
            stderr: format!("{}\n", error),
            exit_code: error.exit_code(),
            execution_time_ms: 0,
            module_name: None,
            function_name: None,
            peak_memory_usage: None,
        }
    }

    /// Whether the command exited with 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One module invocation to run through the kernel
#[derive(Clone)]
pub struct ModuleRun {
    /// Command line recorded on the job
    pub command: String,
    /// Module name, part of the cache key
    pub module_name: String,
    /// Binary module or WAT text
    pub bytes: Arc<[u8]>,
    /// Exported function to call
    pub entry_point: String,
    /// Inputs for the guest
    pub context: ExecutionContext,
    /// Limits for this module; the kernel default when unset
    pub limits: Option<ResourceLimits>,
}

impl fmt::Debug for ModuleRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRun")
            .field("command", &self.command)
            .field("module_name", &self.module_name)
            .field("byte_length", &self.bytes.len())
            .field("entry_point", &self.entry_point)
            .field("context", &self.context)
            .field("limits", &self.limits)
            .finish()
    }
}

impl ModuleRun {
    /// Run [`DEFAULT_ENTRY_POINT`] of `module_name`, recorded as that command.
    pub fn new(module_name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let module_name = module_name.into();
        Self {
            command: module_name.clone(),
            module_name,
            bytes: bytes.into(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            context: ExecutionContext::default(),
            limits: None,
        }
    }

    /// Set the command line recorded on the job.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Set the entry point.
    pub fn entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Set the guest inputs.
    pub fn context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Override the kernel's default limits.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// A background run: its job record and a handle to the final result
#[derive(Debug)]
pub struct SpawnedJob {
    /// Job as registered
    pub job: Job,
    /// Resolves when the run finishes
    pub handle: JoinHandle<CommandExecutionResult>,
}

/// Execution substrate for a browser-style shell session
pub struct Kernel {
    config: KernelConfig,
    vfs: Arc<VirtualFileSystem>,
    engine: Arc<ExecutionEngine>,
    jobs: Arc<JobController>,
    next_process_id: AtomicU32,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Create a kernel with a freshly seeded file system.
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        let engine = ExecutionEngine::new(config.cache_capacity)?;
        let jobs = JobController::new(config.jobs.clone());
        Ok(Self {
            config,
            vfs: Arc::new(VirtualFileSystem::new()),
            engine: Arc::new(engine),
            jobs: Arc::new(jobs),
            next_process_id: AtomicU32::new(FIRST_PROCESS_ID),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The session file system.
    pub fn vfs(&self) -> &Arc<VirtualFileSystem> {
        &self.vfs
    }

    /// The execution engine.
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// The job table.
    pub fn jobs(&self) -> &Arc<JobController> {
        &self.jobs
    }

    /// Start the periodic job sweeper. Must be called inside a tokio runtime.
    pub fn spawn_job_sweeper(&self) -> JoinHandle<()> {
        self.jobs.spawn_sweeper(self.config.jobs.sweep_interval)
    }

    /// Run a module in the foreground and wait for it.
    ///
    /// Only a refused job is an `Err`; load and execution failures are
    /// reported through the returned result and the job's status.
    pub async fn run_module(&self, run: ModuleRun) -> Result<CommandExecutionResult, KernelError> {
        let run = self.prepare(run);
        let limits = self.limits_for(&run);
        self.jobs.start_job(
            &run.command,
            run.context.process_id,
            JobOptions::foreground().with_timeout(limits.timeout),
        )?;
        Ok(execute_run(&self.engine, &self.jobs, run, limits).await)
    }

    /// Run a module on a background task and return its job immediately.
    pub fn spawn_module(&self, run: ModuleRun) -> Result<SpawnedJob, KernelError> {
        let run = self.prepare(run);
        let limits = self.limits_for(&run);
        let job = self.jobs.start_job(
            &run.command,
            run.context.process_id,
            JobOptions::background().with_timeout(limits.timeout),
        )?;

        let engine = Arc::clone(&self.engine);
        let jobs = Arc::clone(&self.jobs);
        let handle = tokio::spawn(async move { execute_run(&engine, &jobs, run, limits).await });
        Ok(SpawnedJob { job, handle })
    }

    /// Assign a process id and working directory when the caller left them unset.
    fn prepare(&self, mut run: ModuleRun) -> ModuleRun {
        if run.context.process_id == 0 {
            run.context.process_id = self.next_process_id.fetch_add(1, Ordering::Relaxed);
        }
        if run.context.working_directory.is_empty() {
            run.context.working_directory = self.vfs.current_directory();
        }
        run
    }

    fn limits_for(&self, run: &ModuleRun) -> ResourceLimits {
        run.limits
            .clone()
            .unwrap_or_else(|| self.config.limits.clone())
    }
}

async fn execute_run(
    engine: &ExecutionEngine,
    jobs: &JobController,
    run: ModuleRun,
    limits: ResourceLimits,
) -> CommandExecutionResult {
    let started = Instant::now();
    let process_id = run.context.process_id;
    let config = ModuleConfig::new(&run.module_name).with_limits(limits);

    let outcome = match engine.load(&run.bytes, &config).await {
        Ok(module) => engine.execute(&module, &run.entry_point, &run.context).await,
        Err(e) => Err(e),
    };

    let (status, result) = match outcome {
        Ok(execution) => {
            let result = CommandExecutionResult::from_execution(process_id, &run.command, execution);
            let status = if result.success() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            (status, result)
        }
        Err(e) => {
            let status = match e {
                EngineError::Timeout { .. } => JobStatus::Killed,
                _ => JobStatus::Failed,
            };
            tracing::warn!(process_id, command = %run.command, error = %e, "command failed");
            let mut result =
                CommandExecutionResult::from_error(process_id, &run.command, &KernelError::from(e));
            result.execution_time_ms = started.elapsed().as_millis() as u64;
            (status, result)
        }
    };

    jobs.update_job_status(
        process_id,
        status,
        Some(result.exit_code),
        Some(&result.stdout),
        Some(&result.stderr),
    );
    result
}
