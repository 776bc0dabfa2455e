//! Common types and error definitions for flashmap
//!
//! This module contains the address sentinel, the configuration struct, and
//! the error type shared by the device, log store, and cache layers.

use std::path::PathBuf;

use thiserror::Error;

/// Byte offset into the flash device. Logical page numbers and physical
/// addresses handed to `update`/`lookup` share this representation.
pub type Address = u64;

/// Sentinel for "no address": the value an unallocated mapping slot holds,
/// and (bit-for-bit) what an erased flash word reads back as.
pub const INVALID_ADDRESS: Address = u64::MAX;

/// Error types for flashmap operations
#[derive(Error, Debug)]
pub enum FlashMapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Logical address outside the configured mapping space
    #[error("logical address {logical} outside mapped space of {limit} pages")]
    OutOfRange { logical: u64, limit: u64 },

    /// Persisted segment metadata disagrees with the caller's parameters
    #[error("persisted geometry mismatch: {message}")]
    GeometryMismatch { message: String },

    /// Recovery found no checkpointed segment on the device
    #[error("no checkpointed segment found; storage is uninitialized")]
    Uninitialized,

    /// Tail cleaning could not open enough distance between head and tail
    #[error("log space exhausted: tail cleaning gave up after {attempts} attempts")]
    SpaceExhausted { attempts: u32 },

    /// Every cache entry is pinned; the cache was sized too small
    #[error("page cache exhausted: all {capacity} entries are pinned")]
    CacheExhausted { capacity: u32 },

    /// Internal consistency check failed
    #[error("invariant violated: {message}")]
    InvariantViolated { message: String },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Segment metadata failed to encode or decode
    #[error("segment metadata codec error: {0}")]
    MetaCodec(#[from] bincode::Error),
}

impl FlashMapError {
    /// Whether the error leaves the translator in an unusable state.
    /// Parameter errors are reported and leave no side effects; everything
    /// else aborts the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FlashMapError::OutOfRange { .. } | FlashMapError::Config { .. }
        )
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            FlashMapError::Io(_) => "io",
            FlashMapError::OutOfRange { .. } => "addressing",
            FlashMapError::GeometryMismatch { .. } => "geometry",
            FlashMapError::Uninitialized => "recovery",
            FlashMapError::SpaceExhausted { .. } => "space",
            FlashMapError::CacheExhausted { .. } => "cache",
            FlashMapError::InvariantViolated { .. } => "invariant",
            FlashMapError::Config { .. } => "configuration",
            FlashMapError::MetaCodec(_) => "codec",
        }
    }
}

/// Result type alias for flashmap operations
pub type Result<T> = std::result::Result<T, FlashMapError>;

/// Configuration for a translator instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing file for the flash simulator
    pub path: PathBuf,
    /// Number of logical page mappings the translator exposes
    pub npage_mappings: u32,
    /// On-flash block size; equals the device write granularity in this release
    pub block_size: u32,
    /// Total page-cache capacity, shared between the writer cache, the
    /// reader cache, and the always-resident root
    pub cache_capacity: u32,
    /// Erase unit size; a multiple of `block_size`
    pub segment_size: u32,
    /// Number of erase segments on the device
    pub segment_count: u32,
    /// Format the device instead of recovering an existing log
    pub create: bool,
}

impl Config {
    /// Configuration with the default device geometry.
    pub fn new<P: Into<PathBuf>>(
        path: P,
        npage_mappings: u32,
        block_size: u32,
        cache_capacity: u32,
        create: bool,
    ) -> Self {
        Self {
            path: path.into(),
            npage_mappings,
            block_size,
            cache_capacity,
            segment_size: crate::device::DEFAULT_SEGMENT_SIZE,
            segment_count: crate::device::DEFAULT_SEGMENT_COUNT,
            create,
        }
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 16 {
            return Err(FlashMapError::Config {
                message: "block size must be at least 16 bytes".to_string(),
            });
        }

        let payload = self.block_size as usize - crate::block::BLOCK_HEADER_SIZE;
        if payload / std::mem::size_of::<Address>() < 2 {
            return Err(FlashMapError::Config {
                message: format!(
                    "block size {} leaves room for fewer than two mapping entries",
                    self.block_size
                ),
            });
        }

        if self.npage_mappings == 0 {
            return Err(FlashMapError::Config {
                message: "mapping space must hold at least one page".to_string(),
            });
        }

        if self.segment_size == 0 || self.segment_size % self.block_size != 0 {
            return Err(FlashMapError::Config {
                message: format!(
                    "segment size {} is not a multiple of block size {}",
                    self.segment_size, self.block_size
                ),
            });
        }

        if self.segment_count < 4 {
            return Err(FlashMapError::Config {
                message: "the circular log needs at least four segments".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::new("/tmp/flashmap-test.dbf", 64, 64, 10, true)
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_block_size_too_small() {
        let mut config = base_config();
        config.block_size = 8;
        assert!(matches!(
            config.validate(),
            Err(FlashMapError::Config { .. })
        ));
    }

    #[test]
    fn test_segment_alignment() {
        let mut config = base_config();
        config.segment_size = 100;
        assert!(matches!(
            config.validate(),
            Err(FlashMapError::Config { .. })
        ));
    }

    #[test]
    fn test_error_classification() {
        let err = FlashMapError::OutOfRange {
            logical: 99,
            limit: 64,
        };
        assert!(!err.is_fatal());
        assert_eq!(err.category(), "addressing");

        let err = FlashMapError::SpaceExhausted { attempts: 11 };
        assert!(err.is_fatal());
        assert_eq!(err.category(), "space");
    }
}
