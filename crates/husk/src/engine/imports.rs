//! Host functions exposed to guest modules.
//!
//! Every function lives in the `env` import namespace and works on `i32`
//! pointer/length pairs into the guest's linear memory. Each access is checked
//! against the memory's *current* length, since the guest can grow it between
//! calls. A bad pointer from the guest is logged and treated as a zero-length
//! access; it never traps the host.

use std::collections::HashMap;
use std::ops::Range;

use wasmtime::{Caller, Engine, Extern, Linker, Memory};

use crate::limits::{LimitedBuffer, ResourceLimits};
use crate::runtime::ExecutionContext;

/// Import namespace for host functions and the host-provided memory.
pub const IMPORT_NAMESPACE: &str = "env";

/// Name of the memory import and of a guest's own memory export.
pub const MEMORY: &str = "memory";

/// Host function names.
pub mod functions {
    /// `(ptr: i32, len: i32)` append to stdout
    pub const WRITE_STDOUT: &str = "shell_write_stdout";
    /// `(ptr: i32, len: i32)` append to stderr
    pub const WRITE_STDERR: &str = "shell_write_stderr";
    /// `(buf: i32, len: i32) -> i32` read stdin into a NUL-terminated buffer
    pub const READ_STDIN: &str = "shell_read_stdin";
    /// `() -> i32` number of arguments
    pub const GET_ARGC: &str = "shell_get_argc";
    /// `(index: i32, buf: i32, len: i32) -> i32` copy one argument
    pub const GET_ARG: &str = "shell_get_arg";
    /// `(key: i32, key_len: i32, buf: i32, len: i32) -> i32` copy an env value
    pub const GET_ENV: &str = "shell_get_env";
    /// `(code: i32)` set the exit code
    pub const SET_EXIT_CODE: &str = "shell_set_exit_code";
}

/// Per-invocation shell state visible to host functions.
///
/// One of these lives in each cached module's store and is reset at the start
/// of every invocation. It is scratch space shared by consecutive calls, not
/// per-call state, which is why invocations of one module are serialized.
#[derive(Debug, Default)]
pub(crate) struct ShellContext {
    pub(crate) args: Vec<String>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) stdin: Vec<u8>,
    stdin_pos: usize,
    pub(crate) working_directory: String,
    pub(crate) process_id: u32,
    pub(crate) stdout: LimitedBuffer,
    pub(crate) stderr: LimitedBuffer,
    pub(crate) exit_code: i32,
}

impl ShellContext {
    fn new(max_output_bytes: usize) -> Self {
        Self {
            stdout: LimitedBuffer::new(max_output_bytes),
            stderr: LimitedBuffer::new(max_output_bytes),
            ..Default::default()
        }
    }

    /// Clear output, exit code and stdin position, then copy in the caller's context.
    pub(crate) fn begin(&mut self, context: &ExecutionContext) {
        self.clear();
        self.args = context.args.clone();
        self.env = context.env.clone();
        self.stdin = context.stdin.clone().into_bytes();
        self.working_directory = context.working_directory.clone();
        self.process_id = context.process_id;
    }

    /// Drop all transient data from the last invocation.
    pub(crate) fn clear(&mut self) {
        self.args.clear();
        self.env.clear();
        self.stdin.clear();
        self.stdin_pos = 0;
        self.working_directory.clear();
        self.process_id = 0;
        self.stdout.clear();
        self.stderr.clear();
        self.exit_code = 0;
    }
}

/// State held by each module's store.
#[derive(Debug)]
pub(crate) struct HostState {
    pub(crate) context: ShellContext,
    /// Host-provided memory, used when the guest does not export its own.
    pub(crate) memory: Option<Memory>,
    limiter: StoreLimiter,
}

impl HostState {
    pub(crate) fn new(limits: &ResourceLimits) -> Self {
        Self {
            context: ShellContext::new(limits.max_output_bytes as usize),
            memory: None,
            limiter: StoreLimiter::new(limits.memory_ceiling()),
        }
    }

    pub(crate) fn limiter(&mut self) -> &mut StoreLimiter {
        &mut self.limiter
    }
}

/// Memory limiter enforcing the configured ceiling on every linear memory.
#[derive(Debug)]
pub(crate) struct StoreLimiter {
    max_memory: u64,
}

impl StoreLimiter {
    fn new(max_memory: u64) -> Self {
        Self { max_memory }
    }
}

impl wasmtime::ResourceLimiter for StoreLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired as u64 > self.max_memory {
            tracing::warn!(
                current,
                desired,
                max = self.max_memory,
                "rejected guest memory growth past ceiling"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Byte range `[ptr, ptr + len)` if it lies inside a memory of `memory_len` bytes.
///
/// Pointers and lengths are reinterpreted as unsigned, as wasm32 does.
pub(crate) fn guest_range(memory_len: usize, ptr: i32, len: i32) -> Option<Range<usize>> {
    let start = ptr as u32 as usize;
    let end = start.checked_add(len as u32 as usize)?;
    (end <= memory_len).then_some(start..end)
}

/// Borrow `len` bytes at `ptr`, or `None` (logged) if out of bounds.
pub(crate) fn read_guest<'a>(
    data: &'a [u8],
    ptr: i32,
    len: i32,
    function: &'static str,
) -> Option<&'a [u8]> {
    match guest_range(data.len(), ptr, len) {
        Some(range) => Some(&data[range]),
        None => {
            tracing::warn!(
                function,
                ptr,
                len,
                memory_len = data.len(),
                "guest read out of bounds"
            );
            None
        }
    }
}

/// Copy `value` into a guest buffer of `capacity` bytes at `ptr`, NUL-terminated.
///
/// At most `capacity - 1` bytes of `value` are copied so the terminator always
/// fits inside the buffer. Returns the number of value bytes written; a zero
/// capacity or an out-of-bounds buffer writes nothing and returns 0.
pub(crate) fn write_c_string(
    data: &mut [u8],
    ptr: i32,
    capacity: i32,
    value: &[u8],
    function: &'static str,
) -> usize {
    let Some(range) = guest_range(data.len(), ptr, capacity) else {
        tracing::warn!(
            function,
            ptr,
            capacity,
            memory_len = data.len(),
            "guest buffer out of bounds"
        );
        return 0;
    };
    if range.is_empty() {
        return 0;
    }

    let n = value.len().min(range.len() - 1);
    let start = range.start;
    data[start..start + n].copy_from_slice(&value[..n]);
    data[start + n] = 0;
    n
}

/// Memory the guest is using: its own `memory` export if any, else the host's.
fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    match caller.get_export(MEMORY) {
        Some(Extern::Memory(memory)) => Some(memory),
        _ => caller.data().memory,
    }
}

/// Build a linker with every host function registered.
///
/// The memory import is defined per store, after the memory is allocated.
pub(crate) fn shell_linker(engine: &Engine) -> anyhow::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);

    linker.func_wrap(
        IMPORT_NAMESPACE,
        functions::WRITE_STDOUT,
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
            let Some(memory) = guest_memory(&mut caller) else {
                tracing::warn!("shell_write_stdout called without a memory");
                return;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            if let Some(bytes) = read_guest(data, ptr, len, functions::WRITE_STDOUT) {
                state.context.stdout.write(bytes);
            }
        },
    )?;

    linker.func_wrap(
        IMPORT_NAMESPACE,
        functions::WRITE_STDERR,
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
            let Some(memory) = guest_memory(&mut caller) else {
                tracing::warn!("shell_write_stderr called without a memory");
                return;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            if let Some(bytes) = read_guest(data, ptr, len, functions::WRITE_STDERR) {
                state.context.stderr.write(bytes);
            }
        },
    )?;

    linker.func_wrap(
        IMPORT_NAMESPACE,
        functions::READ_STDIN,
        |mut caller: Caller<'_, HostState>, buf: i32, buf_len: i32| -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return 0;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let ctx = &mut state.context;
            let remaining = &ctx.stdin[ctx.stdin_pos..];
            let n = write_c_string(data, buf, buf_len, remaining, functions::READ_STDIN);
            ctx.stdin_pos += n;
            n as i32
        },
    )?;

    linker.func_wrap(
        IMPORT_NAMESPACE,
        functions::GET_ARGC,
        |caller: Caller<'_, HostState>| -> i32 { caller.data().context.args.len() as i32 },
    )?;

    linker.func_wrap(
        IMPORT_NAMESPACE,
        functions::GET_ARG,
        |mut caller: Caller<'_, HostState>, index: i32, buf: i32, buf_len: i32| -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return 0;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let Some(arg) = usize::try_from(index)
                .ok()
                .and_then(|i| state.context.args.get(i))
            else {
                return 0;
            };
            write_c_string(data, buf, buf_len, arg.as_bytes(), functions::GET_ARG) as i32
        },
    )?;

    linker.func_wrap(
        IMPORT_NAMESPACE,
        functions::GET_ENV,
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         buf: i32,
         buf_len: i32|
         -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return 0;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let Some(key) = read_guest(data, key_ptr, key_len, functions::GET_ENV)
                .map(|k| String::from_utf8_lossy(k).into_owned())
            else {
                return 0;
            };
            let value = state
                .context
                .env
                .get(&key)
                .map(String::as_bytes)
                .unwrap_or_default();
            write_c_string(data, buf, buf_len, value, functions::GET_ENV) as i32
        },
    )?;

    linker.func_wrap(
        IMPORT_NAMESPACE,
        functions::SET_EXIT_CODE,
        |mut caller: Caller<'_, HostState>, code: i32| {
            caller.data_mut().context.exit_code = code;
        },
    )?;

    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_range_bounds() {
        assert_eq!(guest_range(16, 0, 16), Some(0..16));
        assert_eq!(guest_range(16, 8, 8), Some(8..16));
        assert_eq!(guest_range(16, 8, 9), None);
        assert_eq!(guest_range(16, 16, 0), Some(16..16));
        assert_eq!(guest_range(16, 17, 0), None);
    }

    #[test]
    fn test_guest_range_negative_is_unsigned() {
        // -1 is 0xffff_ffff as a wasm32 pointer
        assert_eq!(guest_range(16, -1, 1), None);
        assert_eq!(guest_range(16, 0, -1), None);
    }

    #[test]
    fn test_read_guest() {
        let data = b"hello world";
        assert_eq!(read_guest(data, 6, 5, "test"), Some(&b"world"[..]));
        assert_eq!(read_guest(data, 6, 6, "test"), None);
    }

    #[test]
    fn test_write_c_string_fits() {
        let mut data = [0xAAu8; 16];
        let n = write_c_string(&mut data, 2, 8, b"abc", "test");
        assert_eq!(n, 3);
        assert_eq!(&data[2..6], b"abc\0");
        assert_eq!(data[1], 0xAA);
        assert_eq!(data[6], 0xAA);
    }

    #[test]
    fn test_write_c_string_truncates_within_buffer() {
        let mut data = [0xAAu8; 16];
        let n = write_c_string(&mut data, 4, 4, b"long-argument", "test");

        assert_eq!(n, 3);
        assert_eq!(&data[4..8], b"lon\0");
        // Nothing at or past ptr + len is touched
        assert!(data[8..].iter().all(|&b| b == 0xAA));
        assert!(data[..4].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_write_c_string_one_byte_buffer_only_terminates() {
        let mut data = [0xAAu8; 4];
        assert_eq!(write_c_string(&mut data, 1, 1, b"xyz", "test"), 0);
        assert_eq!(data, [0xAA, 0, 0xAA, 0xAA]);
    }

    #[test]
    fn test_write_c_string_rejects_bad_buffers() {
        let mut data = [0xAAu8; 8];
        assert_eq!(write_c_string(&mut data, 0, 0, b"x", "test"), 0);
        assert_eq!(write_c_string(&mut data, 6, 4, b"x", "test"), 0);
        assert_eq!(write_c_string(&mut data, -4, 4, b"x", "test"), 0);
        assert!(data.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_shell_context_begin_resets_previous_run() {
        let mut ctx = ShellContext::new(64);
        ctx.stdout.write(b"old");
        ctx.exit_code = 3;
        ctx.stdin_pos = 2;

        let context = ExecutionContext {
            args: vec!["prog".into(), "x".into()],
            stdin: "input".into(),
            working_directory: "/tmp".into(),
            process_id: 7,
            ..Default::default()
        };
        ctx.begin(&context);

        assert!(ctx.stdout.as_bytes().is_empty());
        assert_eq!(ctx.exit_code, 0);
        assert_eq!(ctx.stdin_pos, 0);
        assert_eq!(ctx.stdin, b"input");
        assert_eq!(ctx.args, vec!["prog", "x"]);
        assert_eq!(ctx.process_id, 7);
    }
}
