//! # flashmap: a persistent page-address translator for flash
//!
//! `flashmap` maps a stable logical page space onto a flash device that only
//! supports out-of-place writes and whole-segment erases. It keeps the
//! logical-to-physical table as a fixed-fanout tree stored mostly on flash,
//! with three tightly coupled pieces doing the real work:
//!
//! - **Mapping table**: point `update`/`lookup` over a padded logical space
//! - **Page cache**: pinned tree paths, dirty tracking, LRU eviction, and a
//!   writer/reader cache pair that shares live pages
//! - **Log-structured store**: a circular append log with segment-granular
//!   tail cleaning, block relocation, and checkpoint-based recovery
//!
//! ## Example
//!
//! ```rust,no_run
//! use flashmap::{Config, MappingTable};
//!
//! fn main() -> flashmap::Result<()> {
//!     let config = Config::new("translate.dbf", 64, 64, 10, true);
//!     let mut table = MappingTable::open(config)?;
//!
//!     table.update(10, 5555)?;
//!     assert_eq!(table.lookup(10)?, Some(5555));
//!
//!     table.close()
//! }
//! ```

pub mod block;
pub mod common;
pub mod device;
pub mod lss;
pub mod mapping_table;
pub mod page_cache;

// Re-export commonly used types
pub use common::{Address, Config, FlashMapError, Result, INVALID_ADDRESS};
pub use device::{FileFlash, FlashDevice};
pub use lss::LogAnalysis;
pub use mapping_table::{MappingTable, Stats};
