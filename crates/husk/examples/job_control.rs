//! Job control example.
//!
//! Starts a runaway command in the background, stops and resumes it, then
//! lets the timeout kill it and prints the shell banner.
//!
//! Run with: cargo run -p husk --example job_control

use std::time::Duration;

use husk::{Kernel, KernelConfig, ModuleRun, ResourceLimits, Signal};

const SPIN: &str = r#"
    (module
      (func (export "main") (loop $forever (br $forever))))
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _sweeper = kernel.spawn_job_sweeper();

    let limits = ResourceLimits {
        timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let spawned = kernel.spawn_module(
        ModuleRun::new("spin", SPIN.as_bytes())
            .command("spin &")
            .limits(limits),
    )?;
    let job_id = spawned.job.job_id;
    println!("[{}] {}", job_id, spawned.job.process_id);

    kernel.jobs().send_signal(job_id, Signal::Stop);
    println!("after SIGSTOP: {:?}", kernel.jobs().get_job(job_id).map(|j| j.status));
    kernel.jobs().send_signal_named(job_id, "CONT");
    println!("after SIGCONT: {:?}", kernel.jobs().get_job(job_id).map(|j| j.status));

    let result = spawned.handle.await?;
    println!("exit code: {}", result.exit_code);
    for banner in kernel.jobs().take_notifications() {
        println!("{}", banner);
    }

    Ok(())
}
