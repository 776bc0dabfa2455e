//! End-to-end scenarios for the translator
//!
//! Drives the public API the way a storage engine would: point updates and
//! lookups at varying scales, overwrites, unmapped probes, and repeated
//! close/reopen cycles verified against an in-memory shadow mirror.

use std::path::PathBuf;

use flashmap::{Config, FlashMapError, MappingTable};
use tempfile::{tempdir, TempDir};

const NMAP: u32 = 64;
const BLOCK_SIZE: u32 = 64;
const CACHE_CAP: u32 = 10;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn device_path(dir: &TempDir) -> PathBuf {
    dir.path().join("translate.dbf")
}

fn create_table(dir: &TempDir) -> MappingTable {
    init_logging();
    MappingTable::open(Config::new(device_path(dir), NMAP, BLOCK_SIZE, CACHE_CAP, true)).unwrap()
}

fn reopen_table(dir: &TempDir) -> MappingTable {
    MappingTable::open(Config::new(device_path(dir), NMAP, BLOCK_SIZE, CACHE_CAP, false)).unwrap()
}

/// Small deterministic generator (xorshift64*), so stress runs are
/// reproducible without extra dependencies.
struct SeededRng(u64);

impl SeededRng {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

#[test]
fn basic_update_and_lookup() {
    let dir = tempdir().unwrap();
    let mut table = create_table(&dir);

    table.update(10, 5555).unwrap();
    assert_eq!(table.lookup(10).unwrap(), Some(5555));
    table.self_check().unwrap();
    table.close().unwrap();
}

#[test]
fn overwrite_replaces_mapping() {
    let dir = tempdir().unwrap();
    let mut table = create_table(&dir);

    table.update(10, 5555).unwrap();
    table.update(10, 7777).unwrap();
    assert_eq!(table.lookup(10).unwrap(), Some(7777));
    table.close().unwrap();
}

#[test]
fn unmapped_and_out_of_range_lookups() {
    let dir = tempdir().unwrap();
    let mut table = create_table(&dir);

    // beyond the logical space: rejected without touching the tree
    assert!(matches!(
        table.lookup(999_999),
        Err(FlashMapError::OutOfRange { .. })
    ));
    assert!(matches!(
        table.update(999_999, 1),
        Err(FlashMapError::OutOfRange { .. })
    ));

    // inside the space but never mapped: a distinct non-error outcome
    assert_eq!(table.lookup(63).unwrap(), None);
    table.self_check().unwrap();
    table.close().unwrap();
}

#[test]
fn absent_entries_survive_neighbor_updates() {
    let dir = tempdir().unwrap();
    let mut table = create_table(&dir);

    for logical in (0..u64::from(NMAP)).step_by(2) {
        table.update(logical, logical + 100).unwrap();
    }
    for logical in 0..u64::from(NMAP) {
        let expected = (logical % 2 == 0).then_some(logical + 100);
        assert_eq!(table.lookup(logical).unwrap(), expected);
    }
    table.close().unwrap();
}

#[test]
fn saturate_whole_logical_space() {
    let dir = tempdir().unwrap();
    let mut table = create_table(&dir);

    for i in 0..u64::from(NMAP) {
        table.update(i, 1000 * i + 42).unwrap();
    }
    for i in 0..u64::from(NMAP) {
        assert_eq!(table.lookup(i).unwrap(), Some(1000 * i + 42), "logical {i}");
    }

    // enough churn ran through the log to wrap it; the cleaned tail keeps
    // two segments of slack
    let stats = table.stats();
    assert!(
        stats.used_space <= stats.device_size - 2 * u64::from(stats.segment_size),
        "used {} of {}",
        stats.used_space,
        stats.device_size
    );
    table.self_check().unwrap();
    table.close().unwrap();
}

#[test]
fn mappings_survive_reopen() {
    let dir = tempdir().unwrap();

    {
        let mut table = create_table(&dir);
        for i in 0..u64::from(NMAP) {
            table.update(i, 1000 * i + 42).unwrap();
        }
        for i in 0..u64::from(NMAP) {
            assert_eq!(table.lookup(i).unwrap(), Some(1000 * i + 42));
        }
        table.close().unwrap();
    }

    let mut table = reopen_table(&dir);
    for i in 0..u64::from(NMAP) {
        assert_eq!(
            table.lookup(i).unwrap(),
            Some(1000 * i + 42),
            "logical {i} lost across reopen"
        );
    }
    table.close().unwrap();
}

#[test]
fn repeated_reopen_with_random_updates() {
    const ROUNDS: usize = 20;
    const OPS_PER_ROUND: usize = 200;

    let dir = tempdir().unwrap();
    let mut rng = SeededRng::new(5006);
    let mut mirror: Vec<Option<u64>> = vec![None; NMAP as usize];

    {
        let mut table = create_table(&dir);
        for i in 0..u64::from(NMAP) {
            let physical = (i + 1) * 111;
            table.update(i, physical).unwrap();
            mirror[i as usize] = Some(physical);
        }
        table.close().unwrap();
    }

    for round in 0..ROUNDS {
        let mut table = reopen_table(&dir);

        for (logical, expected) in mirror.iter().enumerate() {
            assert_eq!(
                table.lookup(logical as u64).unwrap(),
                *expected,
                "round {round}: logical {logical} disagrees with the mirror after reopen"
            );
        }

        for _ in 0..OPS_PER_ROUND {
            let logical = rng.next_u64() % u64::from(NMAP);
            let physical = rng.next_u64();
            table.update(logical, physical).unwrap();
            mirror[logical as usize] = Some(physical);
        }

        for (logical, expected) in mirror.iter().enumerate() {
            assert_eq!(table.lookup(logical as u64).unwrap(), *expected);
        }
        table.self_check().unwrap();
        table.close().unwrap();
    }

    let mut table = reopen_table(&dir);
    for (logical, expected) in mirror.iter().enumerate() {
        assert_eq!(table.lookup(logical as u64).unwrap(), *expected);
    }
    table.close().unwrap();
}

#[test]
fn wider_logical_space_stress() {
    // a taller tree than the default scenario geometry exercises deeper
    // descents and more leaf pages per segment
    const WIDE_NMAP: u32 = 128;

    let dir = tempdir().unwrap();
    init_logging();
    let path = dir.path().join("wide.dbf");
    let mut rng = SeededRng::new(97);
    let mut mirror: Vec<Option<u64>> = vec![None; WIDE_NMAP as usize];

    {
        let mut table =
            MappingTable::open(Config::new(&path, WIDE_NMAP, BLOCK_SIZE, CACHE_CAP, true))
                .unwrap();
        for _ in 0..500 {
            let logical = rng.next_u64() % u64::from(WIDE_NMAP);
            let physical = rng.next_u64();
            table.update(logical, physical).unwrap();
            mirror[logical as usize] = Some(physical);
        }
        for (logical, expected) in mirror.iter().enumerate() {
            assert_eq!(table.lookup(logical as u64).unwrap(), *expected);
        }
        table.self_check().unwrap();
        table.close().unwrap();
    }

    let mut table =
        MappingTable::open(Config::new(&path, WIDE_NMAP, BLOCK_SIZE, CACHE_CAP, false)).unwrap();
    for (logical, expected) in mirror.iter().enumerate() {
        assert_eq!(table.lookup(logical as u64).unwrap(), *expected);
    }
    table.close().unwrap();
}

#[test]
fn reopen_rejects_mismatched_geometry() {
    let dir = tempdir().unwrap();

    {
        let mut table = create_table(&dir);
        table.update(1, 2).unwrap();
        table.close().unwrap();
    }

    // same device, different logical space
    let config = Config::new(device_path(&dir), 2 * NMAP, BLOCK_SIZE, CACHE_CAP, false);
    assert!(matches!(
        MappingTable::open(config),
        Err(FlashMapError::GeometryMismatch { .. })
    ));
}

#[test]
fn reopen_of_blank_device_is_uninitialized() {
    let dir = tempdir().unwrap();
    init_logging();

    // never formatted: recovery finds no checkpointed segment
    let config = Config::new(device_path(&dir), NMAP, BLOCK_SIZE, CACHE_CAP, false);
    assert!(matches!(
        MappingTable::open(config),
        Err(FlashMapError::Uninitialized)
    ));
}

#[test]
fn close_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut table = create_table(&dir);

    table.update(3, 33).unwrap();
    table.close().unwrap();
    table.close().unwrap();
    drop(table);

    let mut table = reopen_table(&dir);
    assert_eq!(table.lookup(3).unwrap(), Some(33));
    table.close().unwrap();
}

#[test]
fn drop_without_close_still_checkpoints() {
    let dir = tempdir().unwrap();

    {
        let mut table = create_table(&dir);
        table.update(4, 44).unwrap();
        // no close(): the Drop impl runs the same sequence best-effort
    }

    let mut table = reopen_table(&dir);
    assert_eq!(table.lookup(4).unwrap(), Some(44));
    table.close().unwrap();
}
