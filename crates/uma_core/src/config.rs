//! # Allocator Configuration
//!
//! Sizing and compaction policy, loaded once at startup from TOML.
//!
//! ```toml
//! arena_bytes = 4194304
//! handle_count = 4096
//! fragmentation_threshold = 0.3
//! zero_on_free = false
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, AllocResult};

/// Default arena size (1 MiB).
pub const DEFAULT_ARENA_BYTES: usize = 1024 * 1024;

/// Default handle slot count, including the reserved slot 0.
pub const DEFAULT_HANDLE_COUNT: u32 = 1024;

/// Default fragmentation ratio above which `defragment_if_needed` compacts.
pub const DEFAULT_FRAGMENTATION_THRESHOLD: f32 = 0.25;

/// Configuration for a [`DefragAllocator`](crate::DefragAllocator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Arena capacity in bytes.
    pub arena_bytes: usize,
    /// Total handle slots. Slot 0 is reserved, so `handle_count - 1` are usable.
    pub handle_count: u32,
    /// Fragmentation ratio in `[0, 1]` that triggers compaction.
    pub fragmentation_threshold: f32,
    /// Scrub freed payload bytes with zeroes.
    pub zero_on_free: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            arena_bytes: DEFAULT_ARENA_BYTES,
            handle_count: DEFAULT_HANDLE_COUNT,
            fragmentation_threshold: DEFAULT_FRAGMENTATION_THRESHOLD,
            zero_on_free: false,
        }
    }
}

impl AllocatorConfig {
    /// Builds a config with the given sizes and default policy.
    #[must_use]
    pub fn new(arena_bytes: usize, handle_count: u32) -> Self {
        Self {
            arena_bytes,
            handle_count,
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] on malformed TOML or on
    /// values rejected by [`validate`](Self::validate).
    pub fn from_toml_str(source: &str) -> AllocResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| AllocError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes this config back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> AllocResult<String> {
        toml::to_string(self).map_err(|e| AllocError::InvalidConfig(e.to_string()))
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> AllocResult<()> {
        if self.arena_bytes == 0 {
            return Err(AllocError::InvalidConfig("arena_bytes must be > 0".into()));
        }
        if self.handle_count < 2 {
            return Err(AllocError::InvalidConfig(
                "handle_count must be >= 2 (slot 0 is reserved)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fragmentation_threshold) {
            return Err(AllocError::InvalidConfig(format!(
                "fragmentation_threshold {} outside [0, 1]",
                self.fragmentation_threshold
            )));
        }
        Ok(())
    }
}
