//! Shell-style job control: a table of running, stopped and finished
//! commands, signals, completion banners and a periodic sweeper.

mod controller;
mod job;

pub use controller::{JobConfig, JobController, JobError, SweepReport};
pub use job::{Job, JobOptions, JobStatus, Signal, UnknownSignal};
