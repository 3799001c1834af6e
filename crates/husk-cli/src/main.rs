//! Husk CLI - run one guest module through the kernel
//!
//! Usage:
//!   husk hello.wasm                      Run `main` of a binary module
//!   husk tool.wat --entry run -- a b     Run `run` of a text module with args
//!   echo hi | husk cat.wasm --stdin      Feed standard input to the guest

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use husk::{ExecutionContext, Kernel, KernelConfig, ModuleRun};

#[derive(Parser, Debug)]
#[command(name = "husk")]
#[command(about = "Run a WebAssembly command in the husk sandbox")]
struct Args {
    /// Module file (binary `.wasm` or `.wat` text)
    module: PathBuf,

    /// Arguments passed to the guest after the program name
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Exported function to call
    #[arg(long, default_value = husk::DEFAULT_ENTRY_POINT)]
    entry: String,

    /// Module name used for caching and job display (defaults to the file stem)
    #[arg(long)]
    name: Option<String>,

    /// JSON kernel configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wall-clock timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Maximum guest memory in MiB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Environment variable for the guest, as KEY=VALUE (repeatable)
    #[arg(short = 'e', long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Pass this process's standard input to the guest
    #[arg(long)]
    stdin: bool,

    /// Run as a background job and report it like a shell would
    #[arg(long)]
    background: bool,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they never mix with guest stdout.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => KernelConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config.limits.timeout = Duration::from_millis(timeout_ms);
    }
    if let Some(memory_mb) = args.memory_mb {
        config.limits.max_memory_bytes = memory_mb * 1024 * 1024;
    }

    let bytes = std::fs::read(&args.module)
        .with_context(|| format!("reading {}", args.module.display()))?;
    let name = args.name.clone().unwrap_or_else(|| {
        args.module
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string())
    });

    let mut stdin = String::new();
    if args.stdin {
        io::stdin()
            .read_to_string(&mut stdin)
            .context("reading stdin")?;
    }

    let mut guest_args = vec![name.clone()];
    guest_args.extend(args.args.iter().cloned());
    let command = guest_args.join(" ");
    let context = ExecutionContext {
        args: guest_args,
        env: args.env.iter().cloned().collect::<HashMap<_, _>>(),
        stdin,
        ..Default::default()
    };

    let kernel = Kernel::new(config)?;
    let run = ModuleRun::new(name, bytes)
        .command(command)
        .entry_point(&args.entry)
        .context(context);

    tracing::debug!(?run, "running module");

    let result = if args.background {
        let spawned = kernel.spawn_module(run)?;
        eprintln!("[{}] {}", spawned.job.job_id, spawned.job.process_id);
        spawned.handle.await.context("background job panicked")?
    } else {
        kernel.run_module(run).await?
    };

    io::stdout().write_all(result.stdout.as_bytes()).ok();
    io::stderr().write_all(result.stderr.as_bytes()).ok();
    for banner in kernel.jobs().take_notifications() {
        tracing::info!("{}", banner);
        if args.background {
            eprintln!("{}", banner);
        }
    }
    io::stdout().flush().ok();

    std::process::exit(result.exit_code);
}
