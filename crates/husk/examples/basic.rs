//! Basic kernel usage example.
//!
//! Runs an inline text module that echoes its arguments, then a `cat` that
//! reads a file from the virtual file system through stdin.
//!
//! Run with: cargo run -p husk --example basic

use husk::{ExecutionContext, Kernel, KernelConfig, ModuleRun};

const ECHO: &str = r#"
    (module
      (import "env" "shell_get_argc" (func $argc (result i32)))
      (import "env" "shell_get_arg" (func $arg (param i32 i32 i32) (result i32)))
      (import "env" "shell_write_stdout" (func $out (param i32 i32)))
      (import "env" "memory" (memory 1))
      (data (i32.const 0) " \n")
      (func (export "main")
        (local $i i32)
        (local $n i32)
        (local.set $i (i32.const 1))
        (block $done
          (loop $next
            (br_if $done (i32.ge_s (local.get $i) (call $argc)))
            (if (i32.gt_s (local.get $i) (i32.const 1))
              (then (call $out (i32.const 0) (i32.const 1))))
            (local.set $n (call $arg (local.get $i) (i32.const 64) (i32.const 256)))
            (call $out (i32.const 64) (local.get $n))
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br $next)))
        (call $out (i32.const 1) (i32.const 1))))
"#;

const CAT: &str = r#"
    (module
      (import "env" "shell_read_stdin" (func $read (param i32 i32) (result i32)))
      (import "env" "shell_write_stdout" (func $out (param i32 i32)))
      (import "env" "memory" (memory 1))
      (func (export "main")
        (local $n i32)
        (block $eof
          (loop $next
            (local.set $n (call $read (i32.const 0) (i32.const 1024)))
            (br_if $eof (i32.eqz (local.get $n)))
            (call $out (i32.const 0) (local.get $n))
            (br $next)))))
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = Kernel::new(KernelConfig::default())?;

    println!("=== echo ===");
    let context = ExecutionContext {
        args: vec!["echo".into(), "Hello".into(), "from".into(), "husk!".into()],
        ..Default::default()
    };
    let result = kernel
        .run_module(
            ModuleRun::new("echo", ECHO.as_bytes())
                .command("echo Hello from husk!")
                .context(context),
        )
        .await?;
    print!("stdout: {}", result.stdout);
    println!("exit code: {}\n", result.exit_code);

    println!("=== cat from the virtual file system ===");
    kernel
        .vfs()
        .write_file("/home/user/notes.txt", "hello world\nfoo bar\n")?;
    let context = ExecutionContext {
        args: vec!["cat".into(), "notes.txt".into()],
        stdin: kernel.vfs().read_file("notes.txt")?,
        ..Default::default()
    };
    let result = kernel
        .run_module(
            ModuleRun::new("cat", CAT.as_bytes())
                .command("cat notes.txt")
                .context(context),
        )
        .await?;
    print!("stdout: {}", result.stdout);
    println!("took {}ms\n", result.execution_time_ms);

    println!("=== jobs ===");
    for job in kernel.jobs().list_jobs() {
        println!("[{}] {:<10} {}", job.job_id, job.status, job.command);
    }

    Ok(())
}
