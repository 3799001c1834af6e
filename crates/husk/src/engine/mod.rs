//! WebAssembly execution engine for guest commands.
//!
//! This module handles compiling guest modules with wasmtime, instantiating
//! them against the shell host ABI (see [`imports`]) and invoking their entry
//! points with a wall-clock timeout.
//!
//! Instances are cached by name and byte length in an LRU [`ModuleCache`], so
//! running the same command again reuses the compiled module, its store and
//! its linear memory. The host context inside the store is reset before each
//! invocation.
//!
//! # Timeouts
//!
//! The engine enables epoch interruption and configures every store to yield
//! back to the async executor on each epoch tick. The epoch is advanced by a
//! dedicated OS thread owned by the engine, so ticks keep arriving even when
//! the guest occupies the only runtime thread. A guest stuck in a loop
//! therefore keeps yielding, which lets `tokio::time::timeout` observe the
//! deadline and drop the call. Start functions run under the same timeout
//! during `load`. Dropping a call mid-flight leaves the instance
//! in an unknown state, so the module is quarantined: later `execute` calls on
//! it fail immediately and the next `load` of the same key builds a fresh
//! instance.

mod cache;
pub mod imports;
mod module;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasmtime::{Config, Engine, ExternType, Memory, MemoryType, Module, Store, Val};

pub use cache::ModuleCache;
pub use module::{CacheKey, CompiledModule, ExportTable, GuestExport};

use imports::HostState;
use module::ModuleInstance;

use crate::limits::{ResourceLimits, MIN_MEMORY_BYTES, WASM_PAGE_SIZE};
use crate::runtime::ExecutionContext;

/// Number of compiled modules kept by default.
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

/// How often the epoch advances while a guest is running.
const EPOCH_TICK: Duration = Duration::from_millis(1);

/// How long the ticker thread sleeps between checks while no guest runs.
const IDLE_PARK: Duration = Duration::from_millis(100);

/// Largest page count a 32-bit linear memory can have.
const MAX_WASM32_PAGES: u64 = 65536;

/// Errors that can occur while loading or running guest modules
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The wasmtime engine itself could not be created
    #[error("engine initialization failed: {0}")]
    Init(String),
    /// Compiling or instantiating a module failed
    #[error("failed to load module '{module}': {cause}")]
    Load {
        /// Module name
        module: String,
        /// Underlying compile/link/instantiate error
        cause: String,
    },
    /// The entry point was missing, or the guest trapped
    #[error("execution of '{module}' failed: {cause}")]
    Execution {
        /// Module name
        module: String,
        /// What went wrong
        cause: String,
    },
    /// The entry point did not return within the configured timeout
    #[error("execution of '{module}' timed out after {duration_ms}ms")]
    Timeout {
        /// Module name
        module: String,
        /// Configured timeout in milliseconds
        duration_ms: u64,
    },
}

/// How to load a module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Module name, part of the cache key
    pub name: String,
    /// Memory, output and time limits for the instance
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl ModuleConfig {
    /// Config for `name` with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: ResourceLimits::default(),
        }
    }

    /// Replace the limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Statistics about one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Linear memory size when the call returned.
    ///
    /// This is the final size, not a sampled high-water mark. Guest memory
    /// never shrinks, so it is the largest size reached by the end of the call.
    pub peak_memory_bytes: u64,
}

/// Result of running one entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Module name
    pub module_name: String,
    /// Entry point that was invoked
    pub function_name: String,
    /// Exit code set by the guest (0 if never set)
    pub exit_code: i32,
    /// Standard output, decoded lossily as UTF-8
    pub stdout: String,
    /// Standard error, decoded lossily as UTF-8
    pub stderr: String,
    /// Whether output was truncated due to limits
    pub truncated: bool,
    /// Execution statistics
    pub stats: ExecutionStats,
}

/// Advances the engine epoch from its own thread while guest code runs.
struct EpochTicker {
    shared: Arc<TickerState>,
    thread: Option<thread::JoinHandle<()>>,
}

#[derive(Default)]
struct TickerState {
    running: AtomicUsize,
    stopped: AtomicBool,
}

impl EpochTicker {
    fn start(engine: Engine) -> std::io::Result<Self> {
        let shared = Arc::new(TickerState::default());
        let state = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("husk-epoch".to_string())
            .spawn(move || {
                while !state.stopped.load(Ordering::Acquire) {
                    if state.running.load(Ordering::Acquire) == 0 {
                        thread::park_timeout(IDLE_PARK);
                        continue;
                    }
                    thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Keep ticking until the returned guard is dropped.
    fn running(&self) -> TickGuard<'_> {
        self.shared.running.fetch_add(1, Ordering::AcqRel);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
        TickGuard(&self.shared)
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

struct TickGuard<'a>(&'a TickerState);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Compiles, caches and invokes guest modules.
pub struct ExecutionEngine {
    engine: Engine,
    linker: wasmtime::Linker<HostState>,
    cache: tokio::sync::Mutex<ModuleCache<CacheKey, CompiledModule>>,
    compile_count: AtomicUsize,
    ticker: EpochTicker,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("compile_count", &self.compile_count())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Create an engine caching up to `cache_capacity` modules.
    pub fn new(cache_capacity: usize) -> Result<Self, EngineError> {
        let engine = Self::create_engine()?;
        let linker =
            imports::shell_linker(&engine).map_err(|e| EngineError::Init(e.to_string()))?;
        let ticker = EpochTicker::start(engine.clone())
            .map_err(|e| EngineError::Init(format!("failed to start epoch thread: {}", e)))?;
        Ok(Self {
            engine,
            linker,
            cache: tokio::sync::Mutex::new(ModuleCache::new(cache_capacity)),
            compile_count: AtomicUsize::new(0),
            ticker,
        })
    }

    /// Create an engine with the appropriate configuration.
    fn create_engine() -> Result<Engine, EngineError> {
        let mut config = Config::new();
        config.async_support(true);
        // Epoch ticks make running guests yield so timeouts can fire
        config.epoch_interruption(true);
        Engine::new(&config).map_err(|e| EngineError::Init(e.to_string()))
    }

    /// Get a reference to the underlying engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Number of modules compiled so far (cache hits do not count).
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }

    /// Keys of cached modules, least recently used first.
    pub async fn cached_keys(&self) -> Vec<CacheKey> {
        self.cache.lock().await.keys()
    }

    /// Load a module, reusing the cached instance for the same name and size.
    ///
    /// `bytes` may be a binary module or WAT text. The cache lock is held while
    /// compiling, so concurrent loads of one key compile it only once; later
    /// callers wait and then hit the cache. A start function that does not
    /// return within the module's timeout fails the load.
    pub async fn load(
        &self,
        bytes: &[u8],
        config: &ModuleConfig,
    ) -> Result<CompiledModule, EngineError> {
        let key = CacheKey::new(&config.name, bytes.len());
        let mut cache = self.cache.lock().await;

        if let Some(module) = cache.get(&key).cloned() {
            if !module.is_quarantined() {
                tracing::debug!(module = %key, "module cache hit");
                return Ok(module);
            }
            tracing::warn!(module = %key, "replacing quarantined module");
            cache.remove(&key);
        }

        let module = self
            .instantiate(bytes, config, key.clone())
            .await
            .map_err(|e| EngineError::Load {
                module: config.name.clone(),
                cause: format!("{:#}", e),
            })?;
        tracing::info!(module = %key, exports = ?module.export_names(), "loaded module");

        if let Some((evicted, _)) = cache.insert(key, module.clone()) {
            tracing::debug!(module = %evicted, "evicted least recently used module");
        }
        Ok(module)
    }

    async fn instantiate(
        &self,
        bytes: &[u8],
        config: &ModuleConfig,
        key: CacheKey,
    ) -> anyhow::Result<CompiledModule> {
        let compiled = Module::new(&self.engine, bytes)?;
        self.compile_count.fetch_add(1, Ordering::Relaxed);

        let limits = config.limits.clone();
        let mut store = Store::new(&self.engine, HostState::new(&limits));
        store.limiter(|state| state.limiter());
        store.epoch_deadline_async_yield_and_update(1);

        let (min_pages, max_pages) = host_memory_pages(&compiled, &limits)?;
        let host_memory =
            Memory::new_async(&mut store, MemoryType::new(min_pages, Some(max_pages))).await?;
        store.data_mut().memory = Some(host_memory);

        let mut linker = self.linker.clone();
        linker.define(&store, imports::IMPORT_NAMESPACE, imports::MEMORY, host_memory)?;

        store.set_epoch_deadline(1);
        let instance = {
            let _ticking = self.ticker.running();
            tokio::time::timeout(limits.timeout, linker.instantiate_async(&mut store, &compiled))
                .await
                .map_err(|_| {
                    anyhow::anyhow!(
                        "start function did not return within {}ms",
                        limits.timeout.as_millis()
                    )
                })??
        };

        let exports = ExportTable::from_instance(&instance, &mut store);
        let memory = match exports.memory() {
            Some(memory) => {
                let floor = MIN_MEMORY_BYTES / WASM_PAGE_SIZE;
                let pages = memory.size(&store);
                if pages < floor {
                    memory
                        .grow_async(&mut store, floor - pages)
                        .await
                        .with_context(|| {
                            format!("exported memory cannot grow to the {} page floor", floor)
                        })?;
                }
                memory
            }
            None => host_memory,
        };

        Ok(CompiledModule::new(
            key,
            limits,
            ModuleInstance {
                store,
                exports,
                memory,
            },
        ))
    }

    /// Invoke `entry_point` with a fresh copy of `context`.
    ///
    /// Only one invocation of a given module runs at a time; concurrent callers
    /// wait their turn. A timeout quarantines the module (see the module docs).
    pub async fn execute(
        &self,
        module: &CompiledModule,
        entry_point: &str,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult, EngineError> {
        let execution_error = |cause: String| EngineError::Execution {
            module: module.name().to_string(),
            cause,
        };

        let mut instance = module.lock().await;
        if module.is_quarantined() {
            return Err(execution_error(
                "module is quarantined after a timed out call".to_string(),
            ));
        }

        instance.store.data_mut().context.begin(context);

        let Some(func) = instance.exports.function(entry_point) else {
            return Err(execution_error(format!(
                "no callable export named '{}' (available exports: {})",
                entry_point,
                module.export_names().join(", ")
            )));
        };

        let ty = func.ty(&instance.store);
        if ty.params().len() != 0 {
            return Err(execution_error(format!(
                "entry point '{}' takes {} parameters, expected none",
                entry_point,
                ty.params().len()
            )));
        }
        let mut results = vec![Val::I32(0); ty.results().len()];

        let timeout = module.limits().timeout;
        let start = Instant::now();
        instance.store.set_epoch_deadline(1);
        let outcome = {
            let _ticking = self.ticker.running();
            tokio::time::timeout(
                timeout,
                func.call_async(&mut instance.store, &[], &mut results),
            )
            .await
        };
        let wall_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Err(_) => {
                module.quarantine();
                tracing::warn!(
                    module = %module.key(),
                    entry_point,
                    timeout_ms = timeout.as_millis() as u64,
                    "guest call timed out; module quarantined"
                );
                return Err(EngineError::Timeout {
                    module: module.name().to_string(),
                    duration_ms: timeout.as_millis() as u64,
                });
            }
            Ok(Err(e)) => return Err(execution_error(format!("{:#}", e))),
            Ok(Ok(())) => {}
        }

        let peak_memory_bytes = instance.memory_size();
        let ctx = &instance.store.data().context;
        tracing::debug!(
            module = %module.key(),
            entry_point,
            exit_code = ctx.exit_code,
            wall_time_ms,
            "guest call returned"
        );

        Ok(ExecutionResult {
            module_name: module.name().to_string(),
            function_name: entry_point.to_string(),
            exit_code: ctx.exit_code,
            stdout: ctx.stdout.to_string_lossy(),
            stderr: ctx.stderr.to_string_lossy(),
            truncated: ctx.stdout.was_truncated() || ctx.stderr.was_truncated(),
            stats: ExecutionStats {
                wall_time_ms,
                peak_memory_bytes,
            },
        })
    }

    /// Clear the module's transient context (args, env, stdin, output).
    ///
    /// The module stays cached; eviction only happens under capacity pressure.
    pub async fn unload(&self, module: &CompiledModule) {
        let mut instance = module.lock().await;
        instance.store.data_mut().context.clear();
    }
}

/// Page bounds for the memory offered as `env.memory`.
///
/// The minimum is the floor, raised to the import's declared minimum; the
/// maximum is the ceiling, lowered to the import's declared maximum.
fn host_memory_pages(module: &Module, limits: &ResourceLimits) -> anyhow::Result<(u32, u32)> {
    let (floor, ceiling) = limits.memory_pages();
    let ceiling = ceiling.min(MAX_WASM32_PAGES);
    let declared = module.imports().find_map(|import| match import.ty() {
        ExternType::Memory(ty)
            if import.module() == imports::IMPORT_NAMESPACE && import.name() == imports::MEMORY =>
        {
            Some(ty)
        }
        _ => None,
    });
    let Some(declared) = declared else {
        return Ok((floor as u32, ceiling as u32));
    };

    let min = floor.max(declared.minimum());
    let max = declared.maximum().map_or(ceiling, |max| max.min(ceiling));
    if min > max {
        anyhow::bail!(
            "memory import needs {} pages (maximum {}), outside the {} to {} page limit",
            declared.minimum(),
            declared
                .maximum()
                .map_or_else(|| "none".to_string(), |max| max.to_string()),
            floor,
            ceiling
        );
    }
    Ok((min as u32, max as u32))
}
