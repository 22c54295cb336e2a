//! # Atomic Map File Integration Tests
//!
//! The serialized backend shares the growth engine and facade with the
//! parallel one, so these tests focus on the contracts that differ: writer
//! zones as serialization points, plus mirrored coverage of the append,
//! growth and guard-rail scenarios.

use std::sync::Barrier;
use std::thread;

use mapfile::{page_size, AtomicMapFile, Error, OpenFlags, StorageFile};
use tempfile::tempdir;

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

#[test]
fn contended_appends_receive_disjoint_covering_offsets() {
    const THREADS: usize = 8;
    const APPENDS_PER_THREAD: usize = 256;
    const RECORD_SIZE: usize = 64;

    let dir = tempdir().unwrap();
    let file = AtomicMapFile::new();
    file.open(&dir.path().join("race.db"), true, OpenFlags::default())
        .unwrap();

    let barrier = Barrier::new(THREADS);
    let mut offsets: Vec<u64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|thread_id| {
                let file = &file;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    (0..APPENDS_PER_THREAD)
                        .map(|_| file.append(&[thread_id as u8; RECORD_SIZE]).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let total = THREADS * APPENDS_PER_THREAD;
    assert_eq!(file.get_size().unwrap(), (total * RECORD_SIZE) as u64);

    offsets.sort_unstable();
    for (index, off) in offsets.iter().enumerate() {
        assert_eq!(*off, (index * RECORD_SIZE) as u64);
    }

    // Every record is a run of a single byte value: torn writes would mix.
    for off in offsets {
        let record = file.read_simple(off, RECORD_SIZE);
        assert_eq!(record.len(), RECORD_SIZE);
        assert!(record.iter().all(|&b| b == record[0]));
    }

    file.close().unwrap();
}

#[test]
fn writer_zones_serialize_read_modify_write() {
    const THREADS: usize = 4;
    const INCREMENTS: usize = 250;

    let dir = tempdir().unwrap();
    let file = AtomicMapFile::new();
    file.open(&dir.path().join("counter.db"), true, OpenFlags::default())
        .unwrap();
    file.write(0, &0u64.to_le_bytes()).unwrap();

    let barrier = Barrier::new(THREADS);
    thread::scope(|scope| {
        for _ in 0..THREADS {
            let file = &file;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..INCREMENTS {
                    let mut zone = file.make_zone(true, Some(0), 8).unwrap();
                    let current = u64::from_le_bytes(zone.as_slice().try_into().unwrap());
                    zone.as_mut_slice()
                        .copy_from_slice(&(current + 1).to_le_bytes());
                }
            });
        }
    });

    // The exclusive zone makes every increment atomic: no lost updates.
    let total = u64::from_le_bytes(file.read_simple(0, 8).try_into().unwrap());
    assert_eq!(total, (THREADS * INCREMENTS) as u64);
    file.close().unwrap();
}

#[test]
fn growth_follows_the_allocation_strategy() {
    let dir = tempdir().unwrap();
    let page = page_size();

    let file = AtomicMapFile::new();
    file.set_allocation_strategy(4096, 2.0).unwrap();
    file.open(&dir.path().join("growth.db"), true, OpenFlags::default())
        .unwrap();

    let initial_map = align_up(4096, page);
    assert_eq!(file.map_size().unwrap(), initial_map);

    file.append(&vec![0xCD; 6000]).unwrap();
    file.append(&vec![0xCD; 6000]).unwrap();
    assert_eq!(file.get_size().unwrap(), 12000);

    let map = file.map_size().unwrap();
    assert_eq!(map % page, 0);
    assert!(map >= 12000);

    let data = file.read_simple(0, 12000);
    assert!(data.iter().all(|&b| b == 0xCD));
    file.close().unwrap();
}

#[test]
fn read_only_files_reject_every_mutation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("readonly.db");

    let writer = AtomicMapFile::new();
    writer.open(&path, true, OpenFlags::default()).unwrap();
    writer.write(0, b"XYZ").unwrap();
    writer.close().unwrap();

    let reader = AtomicMapFile::new();
    reader.open(&path, false, OpenFlags::default()).unwrap();

    assert!(matches!(
        reader.write(0, b"no").unwrap_err(),
        Error::Precondition(_)
    ));
    assert!(matches!(
        reader.make_zone(true, None, 1).unwrap_err(),
        Error::Precondition(_)
    ));

    let mut buf = [0u8; 3];
    reader.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"XYZ");
    reader.close().unwrap();
}

#[test]
fn fake_truncation_is_bounded_by_the_backing_allocation() {
    let dir = tempdir().unwrap();
    let file = AtomicMapFile::new();
    file.set_allocation_strategy(4096, 2.0).unwrap();
    file.open(&dir.path().join("fake.db"), true, OpenFlags::default())
        .unwrap();

    file.append(&vec![1u8; 9000]).unwrap();
    let map = file.map_size().unwrap();

    file.truncate_fakely(map).unwrap();
    assert_eq!(file.get_size().unwrap(), map);

    assert!(matches!(
        file.truncate_fakely(map + 1).unwrap_err(),
        Error::Infeasible(_)
    ));
    assert_eq!(file.get_size().unwrap(), map);

    file.truncate_fakely(9000).unwrap();
    assert_eq!(file.get_size().unwrap(), 9000);
    file.close().unwrap();
}

#[test]
fn close_sheds_the_over_allocation_and_reopens_cleanly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shed.db");

    let file = AtomicMapFile::new();
    file.open(&path, true, OpenFlags::default()).unwrap();
    file.append(&vec![9u8; 3000]).unwrap();
    file.close().unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 3000);

    let reopened = AtomicMapFile::new();
    reopened.open(&path, true, OpenFlags::default()).unwrap();
    assert_eq!(reopened.get_size().unwrap(), 3000);
    assert_eq!(reopened.read_simple(0, 3000), vec![9u8; 3000]);
    reopened.close().unwrap();
}

#[test]
fn hard_synchronize_sheds_and_flushes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sync.db");

    let file = AtomicMapFile::new();
    file.open(&path, true, OpenFlags::default()).unwrap();
    file.append(b"abcdefgh").unwrap();

    file.synchronize(true, 0, 0).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    assert_eq!(file.map_size().unwrap(), 8);

    // Subrange flushes are accepted after the shed as well.
    file.append(b"tail").unwrap();
    file.synchronize(true, 8, 4).unwrap();
    assert_eq!(file.read_simple(0, 12), b"abcdefghtail");
    file.close().unwrap();
}

#[test]
fn rename_and_path_disabling_mirror_the_parallel_backend() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("a.db");
    let second = dir.path().join("b.db");

    let file = AtomicMapFile::new();
    file.open(&first, true, OpenFlags::default()).unwrap();
    file.rename(&second).unwrap();
    assert_eq!(file.get_path().unwrap(), second);

    file.disable_path_operations().unwrap();
    assert!(matches!(
        file.get_path().unwrap_err(),
        Error::Precondition(_)
    ));
    file.append(b"still writable").unwrap();
    file.close().unwrap();
}

#[test]
fn works_through_the_trait_object_facade() {
    let dir = tempdir().unwrap();
    let file: Box<dyn StorageFile> = Box::new(AtomicMapFile::new());
    file.open(&dir.path().join("dyn.db"), true, OpenFlags::default())
        .unwrap();
    let off = file.append(b"boxed").unwrap();
    assert_eq!(file.read_simple(off, 5), b"boxed");
    file.close().unwrap();
}

#[test]
fn properties_copy_across_backend_variants() {
    let dir = tempdir().unwrap();
    let page = page_size();

    let source = AtomicMapFile::new();
    source.set_allocation_strategy(4 * page, 2.5).unwrap();

    let target = mapfile::ParallelMapFile::new();
    source.copy_properties(&target).unwrap();

    target
        .open(&dir.path().join("cross.db"), true, OpenFlags::default())
        .unwrap();
    assert_eq!(target.map_size().unwrap(), 4 * page);
    target.close().unwrap();
}
