//! A single data file (or its companion hint file) on disk.
//!
//! A [`LogFile`] is mutable (the active file) or immutable (everything
//! else), identified by a [`FileId`] parsed out of its filename. It offers
//! append, positioned read, full scan, and index building either from its
//! hint file or by scanning the data itself.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use regex::Regex;

use crate::codec::{
    check_key_len, check_value_len, data_crc, hint_crc, DataHeader, HintHeader, DATA_HEADER_SIZE,
    DELETED_VSZ, HINT_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::keydir::{IndexEntry, KeyDir};

pub type FileId = u64;

const FILENAME_PREFIX: &str = "bc";
const FILENAME_SUFFIX: &str = ".d";
const FILE_ID_NIBBLES: usize = 16;

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^bc[0-9a-f]{16}\.d$").expect("static regex is valid"))
}

/// True if `name` matches the expected data-file filename pattern.
pub fn is_data_filename(name: &str) -> bool {
    name_regex().is_match(name)
}

/// Encodes a file id as the lowercase, zero-padded hex filename of its
/// data file.
pub fn filename_from_file_id(id: FileId) -> String {
    format!("{FILENAME_PREFIX}{id:0width$x}{FILENAME_SUFFIX}", width = FILE_ID_NIBBLES)
}

/// Parses a file id out of a data-file filename, failing with
/// `Error::BadFilename` if it does not match `bc[0-9a-f]{16}\.d`.
pub fn file_id_from_filename(path: &Path) -> Result<FileId> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if !is_data_filename(name) {
        return Err(Error::BadFilename { path: path.to_path_buf() });
    }
    let hex = &name[FILENAME_PREFIX.len()..FILENAME_PREFIX.len() + FILE_ID_NIBBLES];
    u64::from_str_radix(hex, 16).map_err(|_| Error::BadFilename { path: path.to_path_buf() })
}

/// Returns the companion hint file path for a data file path.
pub fn hint_path_for(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_os_string();
    s.push(".h");
    PathBuf::from(s)
}

/// One live (non-tombstone) record read back from a data file scan.
#[derive(Debug)]
pub struct DataValue {
    pub value_pos: i64,
    pub value: Vec<u8>,
    pub version: u64,
}

#[derive(Debug)]
pub struct DataRecord {
    pub key: Vec<u8>,
    pub value: Option<DataValue>,
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Reads one data record header at `pos`. Returns `Ok(None)` at a clean
/// end-of-file. A torn trailing write — a partial header, or a complete
/// header whose declared key+value would run past `file_len` — is
/// reported as `Error::UnexpectedEof`, which `scan` catches and treats as
/// a truncation boundary rather than propagating (see `SPEC_FULL.md` §7 /
/// `DESIGN.md`'s resolution of the torn-write question).
fn read_data_header(file: &mut File, path: &Path, pos: u64, file_len: u64) -> Result<Option<DataHeader>> {
    let mut buf = [0u8; DATA_HEADER_SIZE];
    let n = read_up_to(file, &mut buf).map_err(|e| Error::io("read", path, e))?;
    if n == 0 {
        return Ok(None);
    }
    if n < buf.len() {
        return Err(Error::UnexpectedEof { path: path.to_path_buf(), offset: pos });
    }

    let header = DataHeader::from_bytes(&buf);
    let vsz = if header.is_tombstone() { 0 } else { header.vsz as u64 };
    let record_len = DATA_HEADER_SIZE as u64 + header.ksz as u64 + vsz;
    if pos + record_len > file_len {
        return Err(Error::UnexpectedEof { path: path.to_path_buf(), offset: pos });
    }
    Ok(Some(header))
}

/// Logs and best-effort truncates a file at `pos`, treating an incomplete
/// trailing record as a clean boundary rather than corruption (see
/// `SPEC_FULL.md` §7 / `DESIGN.md`'s resolution of the torn-write question).
fn truncate_torn_write(path: &Path, file: &mut File, pos: u64) {
    match file.set_len(pos) {
        Ok(()) => log::warn!("{}: truncated incomplete trailing record at offset {pos}", path.display()),
        Err(e) => log::warn!("{}: incomplete trailing record at offset {pos}, could not truncate: {e}", path.display()),
    }
}

#[derive(Debug)]
pub struct LogFile {
    id: FileId,
    path: PathBuf,
    inner: Mutex<File>,
}

impl LogFile {
    /// Opens an existing or new data file at `path`. `path`'s filename must
    /// match the data-file pattern; the file id is parsed from it.
    pub fn open(path: PathBuf, writable: bool) -> Result<Self> {
        let id = file_id_from_filename(&path)?;
        let mut opts = OpenOptions::new();
        opts.read(true);
        if writable {
            opts.write(true).create(true);
        }
        let file = opts.open(&path).map_err(|e| Error::io("open", &path, e))?;
        Ok(LogFile { id, path, inner: Mutex::new(file) })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hint_path(&self) -> PathBuf {
        hint_path_for(&self.path)
    }

    /// Atomically transitions this file between writable and read-only by
    /// closing and reopening its descriptor.
    pub fn reopen(&self, writable: bool) -> Result<()> {
        let mut guard = self.inner.lock().expect("log file mutex poisoned");
        let mut opts = OpenOptions::new();
        opts.read(true);
        if writable {
            opts.write(true).create(true);
        }
        let file = opts.open(&self.path).map_err(|e| Error::io("open", &self.path, e))?;
        *guard = file;
        Ok(())
    }

    pub fn size(&self) -> Result<u64> {
        let mut file = self.inner.lock().expect("log file mutex poisoned");
        file.seek(SeekFrom::End(0)).map_err(|e| Error::io("seek", &self.path, e))
    }

    /// Appends a data record and returns the index entry pointing at it.
    pub fn append_put(&self, key: &[u8], value: &[u8], version: u64) -> Result<IndexEntry> {
        check_key_len(key)?;
        check_value_len(value)?;

        let ksz = key.len() as u32;
        let vsz = value.len() as u32;
        let crc = data_crc(version, ksz, vsz, key, value);
        let header = DataHeader { crc, version, ksz, vsz };

        let mut file = self.inner.lock().expect("log file mutex poisoned");
        let pos = file.seek(SeekFrom::End(0)).map_err(|e| Error::io("seek", &self.path, e))?;
        file.write_all(&header.to_bytes()).map_err(|e| Error::io("write", &self.path, e))?;
        file.write_all(key).map_err(|e| Error::io("write", &self.path, e))?;
        let value_pos = pos + DATA_HEADER_SIZE as u64 + ksz as u64;
        file.write_all(value).map_err(|e| Error::io("write", &self.path, e))?;

        Ok(IndexEntry { file_id: self.id, value_sz: vsz, value_pos: value_pos as i64, version })
    }

    /// Appends a tombstone record. Produces no index entry.
    pub fn append_delete(&self, key: &[u8], version: u64) -> Result<()> {
        check_key_len(key)?;

        let ksz = key.len() as u32;
        let crc = data_crc(version, ksz, DELETED_VSZ, key, &[]);
        let header = DataHeader { crc, version, ksz, vsz: DELETED_VSZ };

        let mut file = self.inner.lock().expect("log file mutex poisoned");
        file.seek(SeekFrom::End(0)).map_err(|e| Error::io("seek", &self.path, e))?;
        file.write_all(&header.to_bytes()).map_err(|e| Error::io("write", &self.path, e))?;
        file.write_all(key).map_err(|e| Error::io("write", &self.path, e))?;
        Ok(())
    }

    /// Reads the value pointed at by an index entry.
    pub fn read_value(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        if entry.value_sz == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; entry.value_sz as usize];
        let mut file = self.inner.lock().expect("log file mutex poisoned");
        file.seek(SeekFrom::Start(entry.value_pos as u64)).map_err(|e| Error::io("seek", &self.path, e))?;
        file.read_exact(&mut buf).map_err(|e| Error::io("read", &self.path, e))?;
        Ok(buf)
    }

    /// Iterates records in file order, invoking `callback` for each. Stops
    /// cleanly (no error) at a torn trailing write; fails with
    /// `Error::CorruptRecord` at the offset of the first CRC mismatch among
    /// fully-read records.
    pub fn scan(&self, mut callback: impl FnMut(DataRecord)) -> Result<()> {
        let mut file = self.inner.lock().expect("log file mutex poisoned");
        let file_len = file.seek(SeekFrom::End(0)).map_err(|e| Error::io("seek", &self.path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| Error::io("seek", &self.path, e))?;

        let mut pos = 0u64;
        while pos < file_len {
            let header = match read_data_header(&mut file, &self.path, pos, file_len) {
                Ok(None) => break,
                Ok(Some(h)) => h,
                Err(Error::UnexpectedEof { offset, .. }) => {
                    truncate_torn_write(&self.path, &mut file, offset);
                    break;
                }
                Err(e) => return Err(e),
            };
            let is_tombstone = header.is_tombstone();
            let vsz = if is_tombstone { 0 } else { header.vsz as u64 };
            let record_len = DATA_HEADER_SIZE as u64 + header.ksz as u64 + vsz;

            let mut key = vec![0u8; header.ksz as usize];
            file.read_exact(&mut key).map_err(|e| Error::io("read", &self.path, e))?;

            let value_pos = pos + DATA_HEADER_SIZE as u64 + header.ksz as u64;
            let value = if is_tombstone {
                None
            } else {
                let mut v = vec![0u8; header.vsz as usize];
                file.read_exact(&mut v).map_err(|e| Error::io("read", &self.path, e))?;
                Some(v)
            };

            let crc = data_crc(header.version, header.ksz, header.vsz, &key, value.as_deref().unwrap_or(&[]));
            if crc != header.crc {
                return Err(Error::CorruptRecord { path: self.path.clone(), offset: pos });
            }

            callback(DataRecord {
                key,
                value: value.map(|value| DataValue { value_pos: value_pos as i64, value, version: header.version }),
            });

            pos += record_len;
        }

        Ok(())
    }

    /// Builds the key index from this file's hint file if present and
    /// uncorrupted, otherwise scans the data file directly. A corrupt hint
    /// file is deleted and the data file is scanned instead.
    pub fn build_index(&self, index: &KeyDir) -> Result<()> {
        let hint_path = self.hint_path();
        if hint_path.exists() {
            log::debug!("{}: indexing from hint file", self.path.display());
            match HintFile::open_read(hint_path.clone()) {
                Ok(hints) => match self.build_index_from_hints(&hints, index) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        log::warn!("{}: hint file corrupt ({e}), falling back to full scan", hint_path.display());
                    }
                },
                Err(e) => {
                    log::warn!("{}: could not open hint file ({e}), falling back to full scan", hint_path.display());
                }
            }
            let _ = std::fs::remove_file(&hint_path);
        } else {
            log::debug!("{}: indexing by full scan", self.path.display());
        }

        self.scan(|rec| match rec.value {
            Some(v) => {
                index.put(rec.key, IndexEntry { file_id: self.id, value_sz: v.value.len() as u32, value_pos: v.value_pos, version: v.version });
            }
            None => {
                index.del(&rec.key);
            }
        })
    }

    fn build_index_from_hints(&self, hints: &HintFile, index: &KeyDir) -> Result<()> {
        let file_id = self.id;
        hints.scan(|rec| {
            index.put(rec.key, IndexEntry { file_id, value_sz: rec.value_sz, value_pos: rec.value_pos, version: rec.version });
        })
    }
}

/// One live-key entry in a hint file.
#[derive(Debug)]
pub struct HintRecord {
    pub key: Vec<u8>,
    pub value_sz: u32,
    pub value_pos: i64,
    pub version: u64,
}

/// A companion hint file: a shortcut index of a data file's live records,
/// skipping values entirely so recovery does not have to read them.
pub struct HintFile {
    path: PathBuf,
    inner: Mutex<File>,
}

impl HintFile {
    /// Creates a fresh hint file, truncating any existing content.
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path).map_err(|e| Error::io("open", &path, e))?;
        Ok(HintFile { path, inner: Mutex::new(file) })
    }

    pub fn open_read(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path).map_err(|e| Error::io("open", &path, e))?;
        Ok(HintFile { path, inner: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, key: &[u8], entry: &IndexEntry) -> Result<()> {
        check_key_len(key)?;

        let ksz = key.len() as u32;
        let crc = hint_crc(entry.version, ksz, entry.value_sz, entry.value_pos, key);
        let header = HintHeader { crc, version: entry.version, ksz, vsz: entry.value_sz, value_pos: entry.value_pos };

        let mut file = self.inner.lock().expect("hint file mutex poisoned");
        file.seek(SeekFrom::End(0)).map_err(|e| Error::io("seek", &self.path, e))?;
        file.write_all(&header.to_bytes()).map_err(|e| Error::io("write", &self.path, e))?;
        file.write_all(key).map_err(|e| Error::io("write", &self.path, e))?;
        Ok(())
    }

    /// Iterates hint records in file order. A torn trailing write ends the
    /// scan cleanly; a CRC mismatch fails the whole hint file, since the
    /// caller's contract is "rebuild from the data file on any doubt".
    pub fn scan(&self, mut callback: impl FnMut(HintRecord)) -> Result<()> {
        let mut file = self.inner.lock().expect("hint file mutex poisoned");
        let file_len = file.seek(SeekFrom::End(0)).map_err(|e| Error::io("seek", &self.path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| Error::io("seek", &self.path, e))?;

        let mut pos = 0u64;
        while pos < file_len {
            let mut header_buf = [0u8; HINT_HEADER_SIZE];
            let n = read_up_to(&mut file, &mut header_buf).map_err(|e| Error::io("read", &self.path, e))?;
            if n < header_buf.len() {
                break; // clean EOF or torn trailing record: either way, stop here
            }

            let header = HintHeader::from_bytes(&header_buf);
            let record_len = HINT_HEADER_SIZE as u64 + header.ksz as u64;
            if pos + record_len > file_len {
                break;
            }

            let mut key = vec![0u8; header.ksz as usize];
            file.read_exact(&mut key).map_err(|e| Error::io("read", &self.path, e))?;

            let crc = hint_crc(header.version, header.ksz, header.vsz, header.value_pos, &key);
            if crc != header.crc {
                return Err(Error::CorruptRecord { path: self.path.clone(), offset: pos });
            }

            callback(HintRecord { key, value_sz: header.vsz, value_pos: header.value_pos, version: header.version });
            pos += record_len;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    /// Tests that `filename_from_file_id` and `file_id_from_filename` round
    /// trip through the exact expected filename.
    #[test_case(0, "bc0000000000000000.d"; "id zero")]
    #[test_case(1, "bc0000000000000001.d"; "id one")]
    #[test_case(0xdead_beef, "bc00000000deadbeef.d"; "arbitrary id")]
    #[test_case(u64::MAX, "bcffffffffffffffff.d"; "max id")]
    fn filename_round_trips(id: FileId, expected: &str) {
        let name = filename_from_file_id(id);
        assert_eq!(name, expected);
        assert!(is_data_filename(&name));
        assert_eq!(file_id_from_filename(Path::new(&name)).unwrap(), id);
    }

    #[test]
    fn filename_string_order_matches_numeric_order() {
        let a = filename_from_file_id(5);
        let b = filename_from_file_id(200);
        assert!(a < b);
    }

    #[test]
    fn rejects_bad_filenames() {
        for bad in ["bc.d", "foo0000000000000001.d", "bc000000000000000g.d", "bc0000000000000001.dd"] {
            assert!(!is_data_filename(bad), "{bad} should not match");
        }
    }

    #[test]
    fn hint_path_appends_h_suffix() {
        let p = hint_path_for(Path::new("/tmp/store/bc0000000000000000.d"));
        assert_eq!(p, Path::new("/tmp/store/bc0000000000000000.d.h"));
    }

    /// Dumps a single appended record to hex and checks it against the
    /// header-then-key-then-value layout byte for byte, rather than just
    /// trusting the decoder to undo what the encoder did.
    #[test]
    fn append_put_writes_the_expected_byte_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(filename_from_file_id(0));
        let log = LogFile::open(path.clone(), true).unwrap();
        log.append_put(b"k", b"v", 7).unwrap();

        let header = DataHeader { crc: data_crc(7, 1, 1, b"k", b"v"), version: 7, ksz: 1, vsz: 1 };
        let mut expected = Vec::new();
        expected.extend_from_slice(&header.to_bytes());
        expected.extend_from_slice(b"k");
        expected.extend_from_slice(b"v");

        let dump = hex::encode(std::fs::read(&path).unwrap());
        assert_eq!(dump, hex::encode(&expected));
    }

    #[test]
    fn put_get_and_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(filename_from_file_id(0));
        let log = LogFile::open(path, true).unwrap();

        let entry = log.append_put(b"k1", b"v1", 1).unwrap();
        assert_eq!(log.read_value(&entry).unwrap(), b"v1");

        log.append_delete(b"k1", 2).unwrap();

        let mut seen = Vec::new();
        log.scan(|rec| seen.push(rec)).unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].value.is_some());
        assert!(seen[1].value.is_none());
    }

    #[test]
    fn scan_detects_crc_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(filename_from_file_id(0));
        let log = LogFile::open(path.clone(), true).unwrap();
        log.append_put(b"k", b"v", 1).unwrap();

        // Flip a bit in the key byte.
        let mut bytes = std::fs::read(&path).unwrap();
        let key_offset = DATA_HEADER_SIZE;
        bytes[key_offset] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let log = LogFile::open(path, true).unwrap();
        let err = log.scan(|_| {}).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { offset: 0, .. }));
    }

    #[test]
    fn scan_treats_torn_trailing_write_as_clean_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(filename_from_file_id(0));
        let log = LogFile::open(path.clone(), true).unwrap();
        log.append_put(b"k1", b"v1", 1).unwrap();
        let full_len = log.size().unwrap();
        log.append_put(b"k2", b"v2", 2).unwrap();

        // Truncate off the second record partway through to simulate a crash mid-write.
        let truncated_len = full_len + 5;
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(truncated_len).unwrap();
        drop(f);

        let mut seen = Vec::new();
        log.scan(|rec| seen.push(rec)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, b"k1");
    }

    #[test]
    fn hint_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let hint_path = dir.path().join("bc0000000000000000.d.h");
        let hints = HintFile::create(hint_path.clone()).unwrap();
        let entry = IndexEntry { file_id: 0, value_sz: 3, value_pos: 20, version: 7 };
        hints.append(b"abc", &entry).unwrap();

        let hints = HintFile::open_read(hint_path).unwrap();
        let mut seen = Vec::new();
        hints.scan(|rec| seen.push(rec)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, b"abc");
        assert_eq!(seen[0].value_sz, 3);
        assert_eq!(seen[0].value_pos, 20);
        assert_eq!(seen[0].version, 7);
    }
}
