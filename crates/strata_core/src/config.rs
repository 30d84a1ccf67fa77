//! # Allocator Configuration
//!
//! Sizing for the world arena and its block table. Loaded once at startup,
//! either built in code or parsed from a TOML file:
//!
//! ```toml
//! total_size = 67108864
//! max_blocks = 4096
//! defrag_policy = "on_exhaustion"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, AllocResult};
use crate::memory::ALIGNMENT;

/// Default arena size: 1 MB.
pub const DEFAULT_TOTAL_SIZE: usize = 1024 * 1024;

/// Default block table capacity.
pub const DEFAULT_MAX_BLOCKS: usize = 1024;

/// When the allocator coalesces adjacent free blocks during allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefragPolicy {
    /// Coalesce before every first-fit search.
    Eager,
    /// Search first; coalesce and retry only when no block fits.
    #[default]
    OnExhaustion,
}

/// Configuration for a [`WorldAllocator`](crate::WorldAllocator).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Arena size in bytes. Fixed for the allocator's lifetime.
    pub total_size: usize,
    /// Capacity of the block table.
    pub max_blocks: usize,
    /// Coalescing policy on the allocation path.
    pub defrag_policy: DefragPolicy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_size: DEFAULT_TOTAL_SIZE,
            max_blocks: DEFAULT_MAX_BLOCKS,
            defrag_policy: DefragPolicy::OnExhaustion,
        }
    }
}

impl AllocatorConfig {
    /// Small world: 64 KB arena, 256 blocks. Suited to tests and tools.
    #[must_use]
    pub const fn small_world() -> Self {
        Self {
            total_size: 64 * 1024,
            max_blocks: 256,
            defrag_policy: DefragPolicy::OnExhaustion,
        }
    }

    /// Large world: 256 MB arena, 65536 blocks.
    ///
    /// Defragmentation cost grows with the block table, so every caller
    /// contending on the spinlock pays for it. Keep `max_blocks` bounded.
    #[must_use]
    pub const fn large_world() -> Self {
        Self {
            total_size: 256 * 1024 * 1024,
            max_blocks: 65_536,
            defrag_policy: DefragPolicy::OnExhaustion,
        }
    }

    /// Config with a custom arena size.
    #[must_use]
    pub fn with_total_size(mut self, total_size: usize) -> Self {
        self.total_size = total_size;
        self
    }

    /// Config with a custom block table capacity.
    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    /// Config with a custom coalescing policy.
    #[must_use]
    pub fn with_defrag_policy(mut self, policy: DefragPolicy) -> Self {
        self.defrag_policy = policy;
        self
    }

    /// Checks the configuration against the arena's hard limits.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if the arena is empty, not a
    /// multiple of the block alignment, larger than `i32::MAX`, or the
    /// block table has no capacity.
    pub fn validate(&self) -> AllocResult<()> {
        if self.total_size == 0 {
            return Err(AllocError::InvalidConfig(
                "total_size must be greater than zero".to_string(),
            ));
        }
        if self.total_size % ALIGNMENT != 0 {
            return Err(AllocError::InvalidConfig(format!(
                "total_size {} is not a multiple of {ALIGNMENT}",
                self.total_size
            )));
        }
        if i32::try_from(self.total_size).is_err() {
            return Err(AllocError::InvalidConfig(format!(
                "total_size {} exceeds {}",
                self.total_size,
                i32::MAX
            )));
        }
        if self.max_blocks == 0 {
            return Err(AllocError::InvalidConfig(
                "max_blocks must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses a configuration from TOML text. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] on malformed TOML or a config
    /// that fails [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> AllocResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| AllocError::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::FileNotFound`] or [`AllocError::Io`] if the file
    /// cannot be read, otherwise as [`from_toml_str`](Self::from_toml_str).
    pub fn from_toml_file(path: impl AsRef<Path>) -> AllocResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AllocError::FileNotFound(path.to_path_buf()),
            _ => AllocError::Io(format!("failed to read {}: {e}", path.display())),
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(AllocatorConfig::default().validate().is_ok());
        assert!(AllocatorConfig::small_world().validate().is_ok());
        assert!(AllocatorConfig::large_world().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let config = AllocatorConfig::default().with_total_size(0);
        assert!(matches!(config.validate(), Err(AllocError::InvalidConfig(_))));

        let config = AllocatorConfig::default().with_total_size(1000);
        assert!(matches!(config.validate(), Err(AllocError::InvalidConfig(_))));

        let config = AllocatorConfig::default().with_max_blocks(0);
        assert!(matches!(config.validate(), Err(AllocError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_toml() {
        let config = AllocatorConfig::from_toml_str(
            r#"
            total_size = 4096
            max_blocks = 8
            defrag_policy = "eager"
            "#,
        )
        .unwrap();

        assert_eq!(config.total_size, 4096);
        assert_eq!(config.max_blocks, 8);
        assert_eq!(config.defrag_policy, DefragPolicy::Eager);
    }

    #[test]
    fn test_from_toml_partial_uses_defaults() {
        let config = AllocatorConfig::from_toml_str("total_size = 2048").unwrap();
        assert_eq!(config.total_size, 2048);
        assert_eq!(config.max_blocks, DEFAULT_MAX_BLOCKS);
        assert_eq!(config.defrag_policy, DefragPolicy::OnExhaustion);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(AllocatorConfig::from_toml_str("total_size = \"big\"").is_err());
        assert!(AllocatorConfig::from_toml_str("total_size = 1001").is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = AllocatorConfig::from_toml_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(AllocError::FileNotFound(_))));
    }
}
