//! Instantiated guest modules and their export tables.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use wasmtime::{Extern, Func, Instance, Memory, Store};

use super::imports::HostState;
use crate::limits::ResourceLimits;

/// Cache identity of a module: its name plus the length of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Module name from [`ModuleConfig`](super::ModuleConfig)
    pub name: String,
    /// Length of the module bytes
    pub byte_length: usize,
}

impl CacheKey {
    /// Build the key for `name` loaded from `byte_length` bytes.
    pub fn new(name: impl Into<String>, byte_length: usize) -> Self {
        Self {
            name: name.into(),
            byte_length,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.byte_length)
    }
}

/// One named export of a guest instance.
#[derive(Debug, Clone)]
pub enum GuestExport {
    /// A callable function
    Function(Func),
    /// A linear memory
    Memory(Memory),
    /// Globals, tables and anything else the host does not call
    Other,
}

/// Name to typed handle map, filled once at instantiation.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    entries: BTreeMap<String, GuestExport>,
}

impl ExportTable {
    pub(crate) fn from_instance(instance: &Instance, store: &mut Store<HostState>) -> Self {
        let entries = instance
            .exports(store)
            .map(|export| {
                let name = export.name().to_string();
                let handle = match export.into_extern() {
                    Extern::Func(func) => GuestExport::Function(func),
                    Extern::Memory(memory) => GuestExport::Memory(memory),
                    _ => GuestExport::Other,
                };
                (name, handle)
            })
            .collect();
        Self { entries }
    }

    /// Look up an export by name.
    pub fn get(&self, name: &str) -> Option<&GuestExport> {
        self.entries.get(name)
    }

    /// The function exported as `name`, if there is one.
    pub fn function(&self, name: &str) -> Option<Func> {
        match self.entries.get(name) {
            Some(GuestExport::Function(func)) => Some(*func),
            _ => None,
        }
    }

    /// First exported memory, preferring one named `memory`.
    pub fn memory(&self) -> Option<Memory> {
        if let Some(GuestExport::Memory(memory)) = self.entries.get(super::imports::MEMORY) {
            return Some(*memory);
        }
        self.entries.values().find_map(|export| match export {
            GuestExport::Memory(memory) => Some(*memory),
            _ => None,
        })
    }

    /// Every export name, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// A live instance: store, export table and the memory it reports on.
#[derive(Debug)]
pub(crate) struct ModuleInstance {
    pub(crate) store: Store<HostState>,
    pub(crate) exports: ExportTable,
    /// Guest-exported memory if any, otherwise the host-provided one.
    pub(crate) memory: Memory,
}

impl ModuleInstance {
    /// Current size of the active linear memory in bytes.
    pub(crate) fn memory_size(&self) -> u64 {
        self.memory.data_size(&self.store) as u64
    }
}

/// A compiled and instantiated guest module, shared through the cache.
///
/// Cloning is cheap; clones refer to the same instance. Invocations are
/// serialized on the instance lock because the host context inside the store
/// is shared scratch space.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    key: CacheKey,
    limits: ResourceLimits,
    export_names: Vec<String>,
    instance: tokio::sync::Mutex<ModuleInstance>,
    quarantined: AtomicBool,
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("key", &self.inner.key)
            .field("quarantined", &self.is_quarantined())
            .finish_non_exhaustive()
    }
}

impl CompiledModule {
    pub(crate) fn new(key: CacheKey, limits: ResourceLimits, instance: ModuleInstance) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                key,
                limits,
                export_names: instance.exports.names(),
                instance: tokio::sync::Mutex::new(instance),
                quarantined: AtomicBool::new(false),
            }),
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.inner.key.name
    }

    /// Cache key (name + byte length).
    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    /// Limits the module was instantiated with.
    pub fn limits(&self) -> &ResourceLimits {
        &self.inner.limits
    }

    /// Names of everything the guest exports, sorted.
    pub fn export_names(&self) -> &[String] {
        &self.inner.export_names
    }

    /// Whether a timed-out call has left this instance unusable.
    pub fn is_quarantined(&self) -> bool {
        self.inner.quarantined.load(Ordering::Acquire)
    }

    pub(crate) fn quarantine(&self) {
        self.inner.quarantined.store(true, Ordering::Release);
    }

    /// Whether two handles refer to the same instance.
    pub fn same_instance(&self, other: &CompiledModule) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ModuleInstance> {
        self.inner.instance.lock().await
    }
}
