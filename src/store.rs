//! The store: owns the directory, the log files, the key index, and
//! orchestrates open/recovery, point operations, rotation, and merge
//! compaction. This is the crate's public surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::keydir::KeyDir;
use crate::lock::DirLock;
use crate::logfile::{filename_from_file_id, hint_path_for, is_data_filename, FileId, HintFile, LogFile};

/// Default threshold at which the active file is sealed and a new one
/// started.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Reserves the low 32 bits of a file id for ids minted during a merge, so
/// that alphabetic filename order (and therefore numeric file-id order)
/// stays consistent regardless of whether rotation or merge produced a
/// given file.
const FILE_ID_INCREMENT: u64 = 1 << 32;
const FILE_ID_MASK: u64 = 0xFFFF_FFFF_0000_0000;

#[derive(Debug)]
struct FileTable {
    files: BTreeMap<FileId, Arc<LogFile>>,
    max_file_size: u64,
}

impl FileTable {
    fn active(&self) -> (FileId, Arc<LogFile>) {
        let (id, log) = self.files.last_key_value().expect("store always has an active file");
        (*id, log.clone())
    }
}

/// An open Bitcask-model store. Only one `Store` may have a given
/// directory open at a time (enforced by the directory lock); multiple
/// threads may share one `Store` freely.
#[derive(Debug)]
pub struct Store {
    directory: PathBuf,
    _lock: DirLock,
    files: RwLock<FileTable>,
    index: KeyDir,
    merge_lock: Mutex<()>,
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(Error::NotADirectory { path: path.to_path_buf() });
        }
    } else {
        std::fs::create_dir_all(path).map_err(|e| Error::io("create_dir_all", path, e))?;
    }
    Ok(())
}

fn scan_data_filenames(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io("read_dir", dir, e))? {
        let entry = entry.map_err(|e| Error::io("read_dir", dir, e))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_data_filename(&name) {
                names.push(name);
            }
        }
    }
    // Filenames are zero-padded hex, so string order equals numeric id order.
    names.sort();
    Ok(names)
}

impl Store {
    /// Opens (creating if missing) the store directory, acquiring the
    /// cross-process directory lock and rebuilding the key index from the
    /// log files and their hint files.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        ensure_directory(&directory)?;
        let lock = DirLock::acquire(&directory)?;

        let names = scan_data_filenames(&directory)?;
        let mut files = BTreeMap::new();
        let last_index = names.len().checked_sub(1);
        for (i, name) in names.iter().enumerate() {
            let path = directory.join(name);
            let writable = Some(i) == last_index;
            let log = LogFile::open(path, writable)?;
            files.insert(log.id(), Arc::new(log));
        }
        if files.is_empty() {
            let path = directory.join(filename_from_file_id(0));
            let log = LogFile::open(path, true)?;
            files.insert(0, Arc::new(log));
        }

        let index = KeyDir::new();
        for log in files.values() {
            log.build_index(&index)?;
        }

        log::info!(
            "opened store at {} with {} file(s), {} live key(s)",
            directory.display(),
            files.len(),
            index.len()
        );

        Ok(Store {
            directory,
            _lock: lock,
            files: RwLock::new(FileTable { files, max_file_size: DEFAULT_MAX_FILE_SIZE }),
            index,
            merge_lock: Mutex::new(()),
        })
    }

    pub fn max_file_size(&self) -> u64 {
        self.files.read().expect("store lock poisoned").max_file_size
    }

    pub fn set_max_file_size(&self, size: u64) {
        self.files.write().expect("store lock poisoned").max_file_size = size;
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Looks up `key`, returning its current value if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entry = match self.index.get(key) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let log = {
            let files = self.files.read().expect("store lock poisoned");
            files
                .files
                .get(&entry.file_id)
                .cloned()
                .ok_or_else(|| Error::DanglingReference { path: self.directory.clone(), file_id: entry.file_id })?
        };
        Ok(Some(log.read_value(&entry)?))
    }

    /// Writes `key` = `value`. Returns `true` if the key was newly inserted.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let version = self.index.next_version();
        let entry = self.with_active_file_for_write(|log| log.append_put(key, value, version))?;
        Ok(self.index.put(key.to_vec(), entry))
    }

    /// Deletes `key`. Returns `true` if it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let version = self.index.next_version();
        self.with_active_file_for_write(|log| log.append_delete(key, version))?;
        Ok(self.index.del(key))
    }

    /// Runs `f` against the active file under a single write-lock critical
    /// section spanning both the rotation check and `f` itself, so a
    /// rotation started by another thread can never seal the file `f` is
    /// about to append to out from under it.
    fn with_active_file_for_write<T>(&self, f: impl FnOnce(&LogFile) -> Result<T>) -> Result<T> {
        let mut files = self.files.write().expect("store lock poisoned");
        let max_file_size = files.max_file_size;
        let (active_id, active) = files.active();

        let target = if active.size()? > max_file_size {
            active.reopen(false)?;
            let new_id = (active_id.wrapping_add(FILE_ID_INCREMENT)) & FILE_ID_MASK;
            let path = self.directory.join(filename_from_file_id(new_id));
            let new_log = Arc::new(LogFile::open(path, true)?);
            files.files.insert(new_id, new_log.clone());
            log::info!("rotated active file {active_id:016x} -> {new_id:016x}");
            new_log
        } else {
            active
        };

        f(&target)
    }

    /// Visits every key currently in the index with its current value.
    /// Stops early if `callback` returns `false`, returning `false` in that
    /// case; returns `true` if every key was visited.
    pub fn traverse(&self, mut callback: impl FnMut(&[u8], &[u8]) -> bool) -> Result<bool> {
        // Held for the whole traversal so a concurrent rotation/merge can't
        // invalidate `entry.file_id` partway through (store lock, then
        // index lock, per the declared acquisition order).
        let files = self.files.read().expect("store lock poisoned");
        let mut io_err: Option<Error> = None;

        let completed = self.index.traverse(|key, entry| {
            if io_err.is_some() {
                return false;
            }
            let log = match files.files.get(&entry.file_id) {
                Some(log) => log,
                None => {
                    io_err = Some(Error::DanglingReference { path: self.directory.clone(), file_id: entry.file_id });
                    return false;
                }
            };
            match log.read_value(entry) {
                Ok(value) => callback(key, &value),
                Err(e) => {
                    io_err = Some(e);
                    false
                }
            }
        });

        drop(files);
        if let Some(e) = io_err {
            return Err(e);
        }
        Ok(completed)
    }

    /// Compacts all immutable files into a (typically smaller) set of new
    /// files plus their hint files, then removes the originals. A no-op if
    /// fewer than two files exist. At most one merge runs at a time.
    pub fn merge(&self) -> Result<()> {
        let _merge_guard = self.merge_lock.lock().expect("merge lock poisoned");

        let immutable: Vec<Arc<LogFile>> = {
            let files = self.files.read().expect("store lock poisoned");
            if files.files.len() < 2 {
                return Ok(());
            }
            let (active_id, _) = files.active();
            files.files.iter().filter(|(id, _)| **id != active_id).map(|(_, log)| log.clone()).collect()
        };

        let max_file_size = self.files.read().expect("store lock poisoned").max_file_size;
        let mut last_immutable_id = immutable.iter().map(|f| f.id()).max().unwrap();
        let mut dest: Option<(Arc<LogFile>, Arc<HintFile>)> = None;

        log::info!("merge starting: {} immutable file(s)", immutable.len());

        for src in &immutable {
            let mut first_err: Option<Error> = None;

            src.scan(|rec| {
                if first_err.is_some() {
                    return;
                }
                let Some(value) = rec.value else { return };
                let key = rec.key;

                // Cheap pre-check; the authoritative check happens inside
                // `with_mut_entry` below, atomically with the relocation.
                let Some(existing) = self.index.get(&key) else { return };
                if existing.version != value.version {
                    return;
                }

                if dest.is_none() {
                    last_immutable_id += 1;
                    let new_id = last_immutable_id;
                    let path = self.directory.join(filename_from_file_id(new_id));
                    let new_log = match LogFile::open(path, true) {
                        Ok(l) => Arc::new(l),
                        Err(e) => {
                            first_err = Some(e);
                            return;
                        }
                    };
                    let new_hint = match HintFile::create(new_log.hint_path()) {
                        Ok(h) => Arc::new(h),
                        Err(e) => {
                            first_err = Some(e);
                            return;
                        }
                    };
                    self.files.write().expect("store lock poisoned").files.insert(new_id, new_log.clone());
                    log::debug!("merge: opened destination file {new_id:016x}");
                    dest = Some((new_log, new_hint));
                }
                let (dest_log, dest_hint) = dest.as_ref().unwrap();

                self.index.with_mut_entry(&key, |entry| {
                    if entry.version != value.version {
                        return; // superseded since the pre-check above
                    }
                    let new_entry = match dest_log.append_put(&key, &value.value, value.version) {
                        Ok(e) => e,
                        Err(e) => {
                            first_err = Some(e);
                            return;
                        }
                    };
                    if let Err(e) = dest_hint.append(&key, &new_entry) {
                        first_err = Some(e);
                        return;
                    }
                    *entry = new_entry;
                });

                if first_err.is_none() {
                    match dest_log.size() {
                        Ok(size) if size > max_file_size => {
                            if let Err(e) = dest_log.reopen(false) {
                                first_err = Some(e);
                            } else {
                                dest = None;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => first_err = Some(e),
                    }
                }
            })?;

            if let Some(e) = first_err {
                return Err(e);
            }

            {
                let mut files = self.files.write().expect("store lock poisoned");
                files.files.remove(&src.id());
            }
            let _ = std::fs::remove_file(src.path());
            let _ = std::fs::remove_file(src.hint_path());
            log::debug!("merge: removed source file {:016x}", src.id());
        }

        log::info!("merge finished");
        Ok(())
    }

    /// Removes every data file and hint file in `directory`. Intended for
    /// maintenance when no `Store` has the directory open; a no-op if
    /// `directory` does not exist or is not a directory.
    pub fn clear(directory: impl AsRef<Path>) -> Result<()> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            return Ok(());
        }
        let _lock = DirLock::acquire(directory)?;

        for entry in std::fs::read_dir(directory).map_err(|e| Error::io("read_dir", directory, e))? {
            let entry = entry.map_err(|e| Error::io("read_dir", directory, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_data_filename(&name) {
                let path = entry.path();
                let _ = std::fs::remove_file(&path);
                let _ = std::fs::remove_file(hint_path_for(&path));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    /// Tests the `(id + INCREMENT) & MASK` rotation id arithmetic in
    /// isolation, including the wraparound case.
    #[test_case(0 => 1 << 32; "first rotation from id zero")]
    #[test_case(1 << 32 => 2 << 32; "second rotation")]
    #[test_case(0xFFFF_FFFF => 1 << 32; "low 32 bits are masked away")]
    #[test_case(0xFFFF_FFFF_0000_0000 => 0; "wraps around at u64::MAX")]
    fn rotation_id_arithmetic(active_id: FileId) -> FileId {
        (active_id.wrapping_add(FILE_ID_INCREMENT)) & FILE_ID_MASK
    }

    #[test]
    fn basic_put_get_del() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert!(store.put(b"k1", b"v1").unwrap());
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(!store.put(b"k1", b"v2").unwrap());
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v2".to_vec()));
        assert!(store.delete(b"k1").unwrap());
        assert_eq!(store.get(b"k1").unwrap(), None);
        assert!(!store.delete(b"k1").unwrap());
    }

    #[test]
    fn rotation_creates_multiple_files_and_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.set_max_file_size(1024);

        for i in 0..20 {
            store.put(format!("k{i}").as_bytes(), &vec![b'x'; 200]).unwrap();
        }

        let data_files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_data_filename(&e.file_name().to_string_lossy()))
            .count();
        assert!(data_files >= 4, "expected at least 4 data files, got {data_files}");

        for i in 0..20 {
            assert_eq!(store.get(format!("k{i}").as_bytes()).unwrap(), Some(vec![b'x'; 200]));
        }
    }

    #[test]
    fn recovery_reconstructs_index_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            for i in 0..100 {
                store.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
            }
        }
        let store = Store::open(dir.path()).unwrap();
        for i in 0..100 {
            assert_eq!(store.get(format!("k{i}").as_bytes()).unwrap(), Some(format!("v{i}").into_bytes()));
        }
    }

    #[test]
    fn merge_compacts_and_preserves_latest_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.set_max_file_size(4096);

        let value = "V".repeat(80);
        for _ in 0..2000 {
            store.put(b"K", value.as_bytes()).unwrap();
        }

        let before_files = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(before_files >= 5);

        store.merge().unwrap();

        assert_eq!(store.get(b"K").unwrap(), Some(value.clone().into_bytes()));

        // Reopen to make sure the merged + hint files reconstruct correctly.
        drop(store);
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get(b"K").unwrap(), Some(value.into_bytes()));
    }

    #[test]
    fn merge_with_only_active_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put(b"k", b"v").unwrap();
        store.merge().unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn clear_on_empty_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        Store::clear(dir.path()).unwrap();
        Store::clear(dir.path()).unwrap();
    }

    #[test]
    fn clear_removes_all_store_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.set_max_file_size(256);
            for i in 0..50 {
                store.put(format!("k{i}").as_bytes(), &vec![b'y'; 20]).unwrap();
            }
        }
        Store::clear(dir.path()).unwrap();
        let remaining = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_data_filename(&e.file_name().to_string_lossy()))
            .count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn second_open_of_same_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(matches!(Store::open(dir.path()), Err(Error::AlreadyOpen { .. })));
        drop(store);
        assert!(Store::open(dir.path()).is_ok());
    }

    #[test]
    fn traverse_visits_every_live_key_and_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for i in 0..10 {
            store.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        store.delete(b"k5").unwrap();

        let mut seen = Vec::new();
        let completed = store
            .traverse(|k, v| {
                seen.push((k.to_vec(), v.to_vec()));
                true
            })
            .unwrap();
        assert!(completed);
        assert_eq!(seen.len(), 9);
        assert!(!seen.iter().any(|(k, _)| k == b"k5"));

        let mut count = 0;
        let completed = store
            .traverse(|_, _| {
                count += 1;
                count < 3
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(count, 3);
    }

    #[test]
    fn hint_file_is_used_then_falls_back_when_deleted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.set_max_file_size(4096);
            for i in 0..2000 {
                store.put(format!("k{i}").as_bytes(), b"v").unwrap();
            }
            store.merge().unwrap();
        }

        // Reopening should succeed using the hint file.
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get(b"k0").unwrap(), Some(b"v".to_vec()));
        drop(store);

        // Delete every hint file and reopen: must still recover correctly
        // by falling back to a full data-file scan.
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".d.h") {
                std::fs::remove_file(entry.path()).unwrap();
            }
        }
        let store = Store::open(dir.path()).unwrap();
        for i in 0..2000 {
            assert_eq!(store.get(format!("k{i}").as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
    }

    #[test]
    fn max_file_size_accessor_does_not_retroactively_seal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.max_file_size(), DEFAULT_MAX_FILE_SIZE);
        store.set_max_file_size(123);
        assert_eq!(store.max_file_size(), 123);
    }
}
