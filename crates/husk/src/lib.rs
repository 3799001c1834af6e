//! Husk: the execution kernel of a browser-hosted shell
//!
//! Husk runs pre-compiled WebAssembly commands inside a sandbox with bounded
//! memory, bounded output and an enforced wall-clock timeout. Commands talk to
//! the host through a small fixed ABI (see [`engine::imports`]); the kernel
//! tracks every run as a shell job with signals and completion banners, and
//! keeps session files in an in-memory virtual file system.
//!
//! ```no_run
//! use husk::{ExecutionContext, Kernel, KernelConfig, ModuleRun};
//!
//! # async fn run(wasm: Vec<u8>) -> Result<(), husk::KernelError> {
//! let kernel = Kernel::new(KernelConfig::default())?;
//! let context = ExecutionContext {
//!     args: vec!["hello".into()],
//!     ..Default::default()
//! };
//! let result = kernel
//!     .run_module(ModuleRun::new("hello", wasm).context(context))
//!     .await?;
//! print!("{}", result.stdout);
//! # Ok(())
//! # }
//! ```

mod clock;
mod config;
pub mod engine;
pub mod jobs;
mod limits;
mod runtime;
pub mod vfs;

#[cfg(test)]
mod tests;

pub use config::{ConfigError, KernelConfig};
pub use engine::{
    CompiledModule, EngineError, ExecutionEngine, ExecutionResult, ExecutionStats, ModuleConfig,
};
pub use jobs::{Job, JobConfig, JobController, JobError, JobOptions, JobStatus, Signal};
pub use limits::{MIN_MEMORY_BYTES, ResourceLimits, WASM_PAGE_SIZE};
pub use runtime::{
    CommandExecutionResult, DEFAULT_ENTRY_POINT, EXIT_LOAD_FAILURE, EXIT_TIMEOUT,
    ExecutionContext, Kernel, KernelError, ModuleRun, SpawnedJob,
};
pub use vfs::{DirEntry, NodeKind, VfsError, VirtualFileSystem};
