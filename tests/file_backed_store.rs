//! Integration test against a real file-backed `FragmentStore`, to
//! exercise the read/combine dataflow end to end with actual disk I/O
//! instead of the in-memory test double `engine` unit tests use.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use pagestore::config::StorageConfig;
use pagestore::engine::{FragmentStore, StorageEngine};
use pagestore::page::IndexType;

/// Writes each fragment as its own file under `dir`, named by its offset.
/// A real deployment would instead pack fragments into a shared data
/// file at sequential offsets (spec.md §6); this stands in for that
/// layout while still exercising genuine file I/O for every read/write.
struct FileBackedFragmentStore {
    dir: PathBuf,
    next_offset: AtomicI64,
}

impl FileBackedFragmentStore {
    fn new(dir: PathBuf) -> Arc<FileBackedFragmentStore> {
        Arc::new(FileBackedFragmentStore {
            dir,
            next_offset: AtomicI64::new(0),
        })
    }

    fn path_for(&self, page_key: i64) -> PathBuf {
        self.dir.join(format!("fragment-{page_key}.bin"))
    }
}

impl FragmentStore for FileBackedFragmentStore {
    fn write_fragment(&self, _resource_id: u64, _record_page_key: i64, bytes: &[u8]) -> i64 {
        let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);
        fs::write(self.path_for(offset), bytes).expect("write fragment file");
        offset
    }

    fn read_fragment(&self, page_key: i64) -> Vec<u8> {
        fs::read(self.path_for(page_key)).expect("read fragment file")
    }
}

#[test]
fn commit_and_read_round_trip_through_real_files() {
    let dir = camino_tempfile::tempdir().expect("tempdir");
    let store = FileBackedFragmentStore::new(dir.path().as_std_path().to_path_buf());
    let engine = StorageEngine::new(StorageConfig::default(), store);
    let resource = engine.open_resource(1, 7, IndexType::Document);

    let writer = resource.begin_write().unwrap();
    let modified = writer.prepare_record_page(100);
    modified.set_slot(0, b"hello").unwrap();
    modified.set_slot(1, b"world").unwrap();
    writer.commit();

    let reader = resource.begin_read().unwrap();
    assert_eq!(reader.get_record(100, 0).unwrap(), b"hello");
    assert_eq!(reader.get_record(100, 1).unwrap(), b"world");
}

#[test]
fn successive_commits_each_produce_a_readable_fragment_file() {
    let dir = camino_tempfile::tempdir().expect("tempdir");
    let store = FileBackedFragmentStore::new(dir.path().as_std_path().to_path_buf());
    let engine = StorageEngine::new(StorageConfig::default(), store);
    let resource = engine.open_resource(1, 7, IndexType::Document);

    for round in 0..3u8 {
        let writer = resource.begin_write().unwrap();
        let modified = writer.prepare_record_page(5);
        modified.set_slot(0, &[round]).unwrap();
        writer.commit();
    }

    let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 3, "one fragment file per commit");

    let reader = resource.begin_read().unwrap();
    assert_eq!(reader.get_record(5, 0).unwrap(), vec![2]);
}
