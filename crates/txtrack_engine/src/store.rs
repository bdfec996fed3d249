//! Durable storage for the tracker cursor.

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use txtrack_protocol::Cursor;

const CURSOR_FILE: &str = "CURSOR";
const CURSOR_TEMP: &str = "CURSOR.tmp";
const LOCK_FILE: &str = "LOCK";

/// Persists the cursor between runs.
pub trait StateStore: Send + Sync {
    /// Loads the last saved cursor, if any.
    fn load(&self) -> StoreResult<Option<Cursor>>;

    /// Saves the cursor, replacing the previous one.
    fn save(&self, cursor: &Cursor) -> StoreResult<()>;
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn load(&self) -> StoreResult<Option<Cursor>> {
        (**self).load()
    }

    fn save(&self, cursor: &Cursor) -> StoreResult<()> {
        (**self).save(cursor)
    }
}

/// A state store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    cursor: RwLock<Option<Cursor>>,
    saves: AtomicU64,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `cursor`.
    pub fn with_cursor(cursor: Cursor) -> Self {
        Self {
            cursor: RwLock::new(Some(cursor)),
            saves: AtomicU64::new(0),
        }
    }

    /// Returns how many times the cursor was saved.
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> StoreResult<Option<Cursor>> {
        Ok(*self.cursor.read())
    }

    fn save(&self, cursor: &Cursor) -> StoreResult<()> {
        *self.cursor.write() = Some(*cursor);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A state store backed by a directory.
///
/// The directory is locked for the lifetime of the store so two trackers
/// never share a cursor. Saves write a temporary file and rename it over
/// the previous record.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    _lock_file: File,
}

impl FileStateStore {
    /// Opens or creates a state directory.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked {
                path: lock_path.display().to_string(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the state directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> StoreResult<Option<Cursor>> {
        let cursor_path = self.path.join(CURSOR_FILE);
        if !cursor_path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(&cursor_path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Cursor::decode(&data)?))
    }

    fn save(&self, cursor: &Cursor) -> StoreResult<()> {
        let temp_path = self.path.join(CURSOR_TEMP);
        let data = cursor.encode()?;

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(CURSOR_FILE))?;
        self.sync_directory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load().unwrap(), None);

        store.save(&Cursor::new(200, 2)).unwrap();
        assert_eq!(store.load().unwrap(), Some(Cursor::new(200, 2)));
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("state");

        let store = FileStateStore::open(&dir).unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.save(&Cursor::new(1_700_000_000_000, 42)).unwrap();
        store.save(&Cursor::new(1_700_000_000_500, 43)).unwrap();
        drop(store);

        let store = FileStateStore::open(&dir).unwrap();
        assert_eq!(
            store.load().unwrap(),
            Some(Cursor::new(1_700_000_000_500, 43))
        );
        assert!(!dir.join(CURSOR_TEMP).exists());
    }

    #[test]
    fn file_store_is_exclusive() {
        let temp = tempdir().unwrap();
        let _store = FileStateStore::open(temp.path()).unwrap();
        assert!(matches!(
            FileStateStore::open(temp.path()),
            Err(StoreError::Locked { .. })
        ));
    }

    #[test]
    fn corrupt_record_is_reported() {
        let temp = tempdir().unwrap();
        let store = FileStateStore::open(temp.path()).unwrap();
        fs::write(temp.path().join(CURSOR_FILE), b"not cbor").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Record(_))));
    }
}
