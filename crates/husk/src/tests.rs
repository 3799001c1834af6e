//! Scenario tests across the engine, host ABI and job table.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::time::Duration;

use crate::engine::{EngineError, ExecutionEngine, ModuleConfig};
use crate::jobs::{JobController, JobOptions, JobStatus, Signal};
use crate::limits::ResourceLimits;
use crate::runtime::ExecutionContext;
use crate::vfs::VirtualFileSystem;

const SPIN: &str = r#"
    (module
      (func (export "main") (loop $forever (br $forever))))
"#;

const GET_ARG: &str = r#"
    (module
      (import "env" "shell_get_arg" (func $arg (param i32 i32 i32) (result i32)))
      (import "env" "shell_write_stdout" (func $out (param i32 i32)))
      (import "env" "shell_set_exit_code" (func $exit (param i32)))
      (import "env" "memory" (memory 1))
      (data (i32.const 104) "Z")
      (func (export "main")
        (call $exit (call $arg (i32.const 1) (i32.const 100) (i32.const 4)))
        (call $out (i32.const 100) (i32.const 5)))
      (func (export "missing")
        (call $exit (call $arg (i32.const 9) (i32.const 100) (i32.const 4)))))
"#;

const GET_ENV: &str = r#"
    (module
      (import "env" "shell_get_env" (func $env (param i32 i32 i32 i32) (result i32)))
      (import "env" "shell_write_stdout" (func $out (param i32 i32)))
      (import "env" "shell_set_exit_code" (func $exit (param i32)))
      (import "env" "memory" (memory 1))
      (data (i32.const 0) "HOME")
      (data (i32.const 8) "NOPE")
      (data (i32.const 206) "Z")
      (func (export "main")
        (call $exit (call $env (i32.const 0) (i32.const 4) (i32.const 200) (i32.const 6)))
        (call $out (i32.const 200) (i32.const 7)))
      (func (export "absent")
        (call $exit (call $env (i32.const 8) (i32.const 4) (i32.const 200) (i32.const 6)))
        (call $out (i32.const 200) (i32.const 1))))
"#;

const CAT: &str = r#"
    (module
      (import "env" "shell_read_stdin" (func $read (param i32 i32) (result i32)))
      (import "env" "shell_write_stdout" (func $out (param i32 i32)))
      (import "env" "shell_get_argc" (func $argc (result i32)))
      (import "env" "shell_set_exit_code" (func $exit (param i32)))
      (import "env" "memory" (memory 1))
      (func (export "main")
        (local $n i32)
        (local $chunks i32)
        (block $eof
          (loop $next
            (local.set $n (call $read (i32.const 0) (i32.const 6)))
            (br_if $eof (i32.eqz (local.get $n)))
            (call $out (i32.const 0) (local.get $n))
            (local.set $chunks (i32.add (local.get $chunks) (i32.const 1)))
            (br $next)))
        (call $exit (i32.add (i32.mul (local.get $chunks) (i32.const 10)) (call $argc)))))
"#;

fn context(args: &[&str]) -> ExecutionContext {
    ExecutionContext {
        args: args.iter().map(|arg| arg.to_string()).collect(),
        process_id: 1,
        working_directory: "/home/user".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_missing_entry_point_lists_exports() {
    let engine = ExecutionEngine::new(4).unwrap();
    let module = engine
        .load(
            br#"(module
                  (memory (export "memory") 1)
                  (global (export "version") i32 (i32.const 1))
                  (func (export "main")))"#,
            &ModuleConfig::new("tool"),
        )
        .await
        .unwrap();

    let err = engine
        .execute(&module, "start", &ExecutionContext::default())
        .await
        .unwrap_err();
    match err {
        EngineError::Execution { module, cause } => {
            assert_eq!(module, "tool");
            assert!(
                cause.contains("available exports: main, memory, version"),
                "cause: {}",
                cause
            );
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_quarantines_module() {
    let engine = ExecutionEngine::new(4).unwrap();
    let limits = ResourceLimits {
        timeout: Duration::from_millis(10),
        ..Default::default()
    };
    let config = ModuleConfig::new("spin").with_limits(limits);
    let module = engine.load(SPIN.as_bytes(), &config).await.unwrap();

    let err = engine
        .execute(&module, "main", &ExecutionContext::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::Timeout {
            module: "spin".into(),
            duration_ms: 10
        }
    );
    assert!(module.is_quarantined());

    // The stale handle refuses further calls.
    let err = engine
        .execute(&module, "main", &ExecutionContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Execution { .. }));

    // Loading again replaces the quarantined instance.
    let fresh = engine.load(SPIN.as_bytes(), &config).await.unwrap();
    assert!(!fresh.is_quarantined());
    assert!(!fresh.same_instance(&module));
    assert_eq!(engine.compile_count(), 2);
}

#[tokio::test]
async fn test_get_arg_truncates_inside_buffer() {
    let engine = ExecutionEngine::new(4).unwrap();
    let module = engine
        .load(GET_ARG.as_bytes(), &ModuleConfig::new("arg"))
        .await
        .unwrap();

    let result = engine
        .execute(&module, "main", &context(&["arg", "abcdef"]))
        .await
        .unwrap();
    // Three bytes plus the terminator fit in four; the byte after is untouched.
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, "abc\0Z");

    let result = engine
        .execute(&module, "missing", &context(&["arg"]))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn test_get_env_truncates_and_defaults_to_empty() {
    let engine = ExecutionEngine::new(4).unwrap();
    let module = engine
        .load(GET_ENV.as_bytes(), &ModuleConfig::new("env"))
        .await
        .unwrap();
    let mut ctx = context(&["env"]);
    ctx.env = HashMap::from([("HOME".to_string(), "/home/user".to_string())]);

    let result = engine.execute(&module, "main", &ctx).await.unwrap();
    assert_eq!(result.exit_code, 5);
    assert_eq!(result.stdout, "/home\0Z");

    let result = engine.execute(&module, "absent", &ctx).await.unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "\0");
}

#[tokio::test]
async fn test_read_stdin_advances_to_eof() {
    let engine = ExecutionEngine::new(4).unwrap();
    let module = engine
        .load(CAT.as_bytes(), &ModuleConfig::new("cat"))
        .await
        .unwrap();
    let mut ctx = context(&["cat", "-"]);
    ctx.stdin = "hello world".into();

    let result = engine.execute(&module, "main", &ctx).await.unwrap();
    assert_eq!(result.stdout, "hello world");
    // "hello", " worl", "d": three chunks, two args.
    assert_eq!(result.exit_code, 32);

    // The cursor starts over on the next invocation.
    ctx.stdin = "again".into();
    let result = engine.execute(&module, "main", &ctx).await.unwrap();
    assert_eq!(result.stdout, "again");
    assert_eq!(result.exit_code, 12);
}

#[tokio::test]
async fn test_lru_eviction_across_modules() {
    let engine = ExecutionEngine::new(2).unwrap();
    let wat = br#"(module (func (export "main")))"#;

    let a = engine.load(wat, &ModuleConfig::new("a")).await.unwrap();
    engine.load(wat, &ModuleConfig::new("b")).await.unwrap();
    // Touch "a" so "b" becomes least recently used.
    let a_again = engine.load(wat, &ModuleConfig::new("a")).await.unwrap();
    assert!(a.same_instance(&a_again));
    engine.load(wat, &ModuleConfig::new("c")).await.unwrap();

    let names: Vec<String> = engine
        .cached_keys()
        .await
        .into_iter()
        .map(|key| key.name)
        .collect();
    assert_eq!(names, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(engine.compile_count(), 3);

    engine.load(wat, &ModuleConfig::new("b")).await.unwrap();
    assert_eq!(engine.compile_count(), 4);

    // An evicted handle keeps working until dropped.
    let result = engine
        .execute(&a, "main", &ExecutionContext::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
}

#[test]
fn test_background_sleep_notifies_once() {
    let jobs = JobController::default();
    let job = jobs
        .start_job("sleep 10", 42, JobOptions::background())
        .unwrap();
    assert_eq!(job.job_id, 1);
    assert!(!job.foreground);

    assert!(jobs.update_job_status(42, JobStatus::Completed, Some(0), Some(""), Some("")));
    assert!(!jobs.update_job_status(42, JobStatus::Completed, Some(0), Some(""), Some("")));
    assert_eq!(jobs.notifications(), vec!["[1]+  Done    sleep 10".to_string()]);

    jobs.clear_notifications();
    assert!(jobs.notifications().is_empty());
    assert!(!jobs.send_signal(job.job_id, Signal::Term));
}

#[test]
fn test_capacity_error_leaves_table_unchanged() {
    let jobs = JobController::new(crate::jobs::JobConfig {
        max_jobs: 3,
        ..Default::default()
    });
    for pid in 1..=3 {
        jobs.start_job("sleep 1", pid, JobOptions::background())
            .unwrap();
    }
    let before = jobs.list_jobs();

    assert!(jobs.start_job("sleep 1", 4, JobOptions::background()).is_err());
    assert_eq!(jobs.list_jobs(), before);

    // The refused start did not consume an id.
    jobs.send_signal(1, Signal::Kill);
    assert_eq!(jobs.start_job("ls", 4, JobOptions::default()).unwrap().job_id, 4);
}

#[test]
fn test_tmp_file_roundtrip() {
    let vfs = VirtualFileSystem::new();
    vfs.write_file("/tmp/a.txt", "hello").unwrap();

    assert_eq!(vfs.read_file("/tmp/a.txt").unwrap(), "hello");
    assert_eq!(vfs.size("/tmp/a.txt").unwrap(), 5);

    vfs.change_directory("/tmp").unwrap();
    assert_eq!(vfs.read_file("a.txt").unwrap(), "hello");
    assert_eq!(vfs.read_file("../tmp/./a.txt").unwrap(), "hello");
    assert!(vfs.list_directory(".").unwrap().contains(&"a.txt".to_string()));
}
