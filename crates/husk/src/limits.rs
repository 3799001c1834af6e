//! Resource limits for guest module execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Size of one WebAssembly page.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Smallest linear memory handed to a guest: 256 pages (16 MiB).
///
/// Toolchain-produced guests reserve a 1 MiB shadow stack plus static data
/// and an initial heap before `main` runs; anything smaller fails at startup.
pub const MIN_MEMORY_BYTES: u64 = 256 * WASM_PAGE_SIZE;

/// Resource limits for a loaded module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum linear memory in bytes (raised to [`MIN_MEMORY_BYTES`] if lower)
    pub max_memory_bytes: u64,
    /// Maximum bytes captured per output stream (stdout and stderr each)
    pub max_output_bytes: u64,
    /// Wall-clock timeout for one entry point invocation
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024, // 64 MB
            max_output_bytes: 1024 * 1024,      // 1 MB output
            timeout: Duration::from_secs(30),   // 30 second wall clock
        }
    }
}

impl ResourceLimits {
    /// Memory ceiling in bytes after applying the startup floor.
    pub fn memory_ceiling(&self) -> u64 {
        self.max_memory_bytes.max(MIN_MEMORY_BYTES)
    }

    /// Memory floor and ceiling expressed in pages.
    pub fn memory_pages(&self) -> (u64, u64) {
        (
            MIN_MEMORY_BYTES / WASM_PAGE_SIZE,
            self.memory_ceiling() / WASM_PAGE_SIZE,
        )
    }
}

/// Helper for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Same as [`duration_ms`] for optional durations.
pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// Buffer that limits how much data can be written
#[derive(Debug, Clone, Default)]
pub(crate) struct LimitedBuffer {
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        let remaining = self.limit.saturating_sub(self.buffer.len());
        if remaining == 0 {
            self.truncated = true;
            return data.len(); // Pretend we wrote it
        }

        let to_write = data.len().min(remaining);
        self.buffer.extend_from_slice(&data[..to_write]);

        if to_write < data.len() {
            self.truncated = true;
            self.buffer
                .extend_from_slice(b"\n... [output truncated] ...\n");
        }

        data.len()
    }

    /// Drop buffered data, keeping the limit.
    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
        self.truncated = false;
    }

    pub(crate) fn was_truncated(&self) -> bool {
        self.truncated
    }

    #[cfg(test)]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Best-effort UTF-8 view of the captured bytes.
    pub(crate) fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}
