//! Persistent LRU index over the cache directory
//!
//! Entries live as files below the cache root; the authoritative record of
//! what exists is the `cache.sqlite` table next to them. Every mutation goes
//! through a transaction so a crash leaves index and filesystem reconcilable:
//! the only transient divergence is during the file write of an `add`, and a
//! row whose file has gone missing is repaired by eviction on the next open.
//!
//! Reads are tracked in the `readers` column. An entry with open readers is
//! never eviction-eligible, and releasing a reader refreshes the entry's
//! timestamp, which is what makes reads recency-updating.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::CacheError;

use super::store;

pub const CACHE_DB_FILENAME: &str = "cache.sqlite";

/// Headroom added to every size calculation so transactions can grow the
/// index database without being charged against the entry budget.
const SIZE_BUFFER: u64 = 1024 * 1024;

const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// One row of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub size: u64,
    pub timestamp: i64,
    pub readers: u64,
}

#[derive(Debug)]
pub struct LruIndex {
    conn: Connection,
    db_path: PathBuf,
    cache_root: PathBuf,
    max_bytes: u64,
    block_size: u64,
}

impl LruIndex {
    /// Open (or create) the index below `cache_root`. Stale `readers` counts
    /// from a crashed process are reset here: readers cannot outlive the
    /// process that held them.
    pub fn open(cache_root: &Path, max_bytes: u64) -> Result<Self, CacheError> {
        std::fs::create_dir_all(cache_root)?;
        let db_path = cache_root.join(CACHE_DB_FILENAME);
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                  path      TEXT    NOT NULL
                , size      INTEGER NOT NULL
                , timestamp INTEGER NOT NULL
                , readers   INTEGER NOT NULL DEFAULT 0
                , PRIMARY KEY (path)
            );",
        )?;

        let stale = conn.execute("UPDATE cache SET readers = 0 WHERE readers != 0", [])?;
        if stale > 0 {
            tracing::warn!("reset stale reader count on {stale} cache entries");
        }

        let block_size = fs_block_size(&db_path);
        Ok(Self {
            conn,
            db_path,
            cache_root: cache_root.to_path_buf(),
            max_bytes,
            block_size,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Bytes an entry of logical length `logical` occupies on disk.
    pub fn disk_size(&self, logical: u64) -> u64 {
        logical.div_ceil(self.block_size) * self.block_size
    }

    /// Total accounted size: entry bytes plus the index database itself plus
    /// the transaction headroom.
    pub fn size(&self) -> Result<u64, CacheError> {
        let data_size: Option<i64> =
            self.conn
                .query_row("SELECT SUM(size) FROM cache", [], |row| row.get(0))?;
        let db_size = self.disk_size(std::fs::metadata(&self.db_path)?.len());
        Ok(data_size.unwrap_or(0) as u64 + db_size + SIZE_BUFFER)
    }

    /// Open a cache entry for reading, pinning it against eviction until the
    /// returned reader is dropped. A row whose file cannot be opened is
    /// evicted and reported as a miss.
    pub fn open_entry(&self, path: &Path) -> Result<CacheReader<'_>, CacheError> {
        let key = path_key(path);
        {
            let tx = self.transaction()?;
            let updated = tx.execute(
                "UPDATE cache SET readers = readers + 1 WHERE path = ?1",
                params![key],
            )?;
            if updated == 0 {
                return Err(CacheError::NoSuchKey(key));
            }
            tx.commit()?;
        }

        match std::fs::File::open(path) {
            Ok(file) => Ok(CacheReader {
                index: self,
                key,
                file,
            }),
            Err(e) => {
                tracing::error!("unable to read cache file {key}: {e}");
                // The file was deleted from under the index. Evicting the
                // row now restores agreement between database and disk.
                let _ = self.evict(path);
                Err(CacheError::NoSuchKey(key))
            }
        }
    }

    /// Refresh an entry's timestamp without opening it.
    pub fn touch(&self, path: &Path) -> Result<(), CacheError> {
        let key = path_key(path);
        let tx = self.transaction()?;
        let updated = tx.execute(
            "UPDATE cache SET timestamp = ?1 WHERE path = ?2",
            params![timestamp_now(), key],
        )?;
        if updated == 0 {
            return Err(CacheError::NoSuchKey(key));
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert a new entry, evicting old ones until it fits.
    ///
    /// The size check and the insert share one transaction so concurrent
    /// accounting cannot slip between them, but evictions run outside any
    /// transaction: their files are already gone, so they must not roll back
    /// with a failed insert.
    pub fn add(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        let key = path_key(path);
        let entry_size = self.disk_size(data.len() as u64);

        loop {
            let mut current_size = {
                let tx = self.transaction()?;
                let current_size = self.size()?;

                if current_size + entry_size <= self.max_bytes {
                    let inserted = tx.execute(
                        "INSERT INTO cache (path, size, timestamp) VALUES (?1, ?2, ?3)",
                        params![key, entry_size, timestamp_now()],
                    );
                    match inserted {
                        Ok(_) => {}
                        Err(e) if is_constraint_violation(&e) => {
                            return Err(CacheError::KeyConflict(key));
                        }
                        Err(e) => return Err(e.into()),
                    }

                    if let Err(e) = store::write_atomic(path, data) {
                        store::discard_partial(path);
                        return Err(e.into());
                    }
                    tx.commit()?;
                    return Ok(());
                }

                tx.commit()?;
                current_size
            };

            while current_size + entry_size > self.max_bytes {
                match self.evict_oldest()? {
                    Some(evicted) => current_size = current_size.saturating_sub(evicted.size),
                    None => return Err(CacheError::NoSpace),
                }
            }
        }
    }

    /// Remove the least recently used entry with no open readers. Returns
    /// `None` when nothing is eligible.
    pub fn evict_oldest(&self) -> Result<Option<CacheEntry>, CacheError> {
        let tx = self.transaction()?;
        let entry = tx
            .query_row(
                "SELECT path, size, timestamp, readers FROM cache
                 WHERE readers = 0 ORDER BY timestamp ASC LIMIT 1",
                [],
                row_to_entry,
            )
            .optional()?;

        let Some(entry) = entry else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute("DELETE FROM cache WHERE path = ?1", params![entry.path])?;
        // Removal failure usually means the file is already gone; the row
        // deletion is what matters, so commit either way.
        let _ = store::remove_entry_file(Path::new(&entry.path), &self.cache_root);
        tx.commit()?;
        Ok(Some(entry))
    }

    /// Remove a specific entry. Fails with `NoSuchKey` when the row is
    /// absent; a missing file is not an error once the row is gone.
    pub fn evict(&self, path: &Path) -> Result<(), CacheError> {
        let key = path_key(path);
        let tx = self.transaction()?;
        let deleted = tx.execute("DELETE FROM cache WHERE path = ?1", params![key])?;
        if deleted == 0 {
            return Err(CacheError::NoSuchKey(key));
        }
        let _ = store::remove_entry_file(path, &self.cache_root);
        tx.commit()?;
        Ok(())
    }

    // NOTE: transactions are never nested. The index is owned by a single
    // worker thread, so the unchecked variant is safe here.
    fn transaction(&self) -> Result<Transaction<'_>, CacheError> {
        Ok(self.conn.unchecked_transaction()?)
    }

    fn release_reader(&self, key: &str) {
        let released = self.transaction().and_then(|tx| {
            tx.execute(
                "UPDATE cache SET readers = readers - 1, timestamp = ?1 WHERE path = ?2",
                params![timestamp_now(), key],
            )?;
            tx.commit()?;
            Ok(())
        });
        if let Err(e) = released {
            tracing::error!("failed to release cache reader for {key}: {e}");
        }
    }
}

/// An open, pinned cache entry. Dropping it releases the pin and refreshes
/// the entry's LRU timestamp in a single transaction.
#[derive(Debug)]
pub struct CacheReader<'a> {
    index: &'a LruIndex,
    key: String,
    file: std::fs::File,
}

impl Read for CacheReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Drop for CacheReader<'_> {
    fn drop(&mut self) {
        self.index.release_reader(&self.key);
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        path: row.get(0)?,
        size: row.get::<_, i64>(1)? as u64,
        timestamp: row.get(2)?,
        readers: row.get::<_, i64>(3)? as u64,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn fs_block_size(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return DEFAULT_BLOCK_SIZE;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc == 0 && stat.f_bsize > 0 {
        stat.f_bsize as u64
    } else {
        DEFAULT_BLOCK_SIZE
    }
}

#[cfg(not(unix))]
fn fs_block_size(_path: &Path) -> u64 {
    DEFAULT_BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const HUGE: u64 = u64::MAX / 2;

    fn entry_path(root: &Path, name: &str) -> PathBuf {
        root.join("lib.pdb").join("44E4").join(name)
    }

    /// Budget that fits `entries` payloads of `payload` bytes on top of the
    /// fixed overhead of an empty index.
    fn budget_for(root: &Path, entries: u64, payload: u64) -> u64 {
        let index = LruIndex::open(root, HUGE).unwrap();
        let base = index.size().unwrap();
        base + entries * index.disk_size(payload)
    }

    #[test]
    fn test_add_and_open_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let path = entry_path(root.path(), "lib.sym");

        index.add(&path, b"DiskCache v.1\n0x1000 main\n").unwrap();

        let mut reader = index.open_entry(&path).unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "DiskCache v.1\n0x1000 main\n");
    }

    #[test]
    fn test_add_duplicate_is_key_conflict() {
        let root = tempfile::tempdir().unwrap();
        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let path = entry_path(root.path(), "lib.sym");

        index.add(&path, b"one").unwrap();
        let err = index.add(&path, b"two").unwrap_err();
        assert!(matches!(err, CacheError::KeyConflict(_)));
    }

    #[test]
    fn test_open_missing_is_no_such_key() {
        let root = tempfile::tempdir().unwrap();
        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let err = index.open_entry(&entry_path(root.path(), "absent.sym")).unwrap_err();
        assert!(err.is_no_such_key());
    }

    #[test]
    fn test_externally_deleted_file_is_evicted_on_open() {
        let root = tempfile::tempdir().unwrap();
        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let path = entry_path(root.path(), "lib.sym");

        index.add(&path, b"data").unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = index.open_entry(&path).unwrap_err();
        assert!(err.is_no_such_key());
        // The repair evicted the row too
        assert!(matches!(index.touch(&path), Err(CacheError::NoSuchKey(_))));
    }

    #[test]
    fn test_budget_enforced_by_eviction() {
        let root = tempfile::tempdir().unwrap();
        let max_bytes = budget_for(root.path(), 2, 4000);
        let index = LruIndex::open(root.path(), max_bytes).unwrap();

        let first = entry_path(root.path(), "first.sym");
        let second = entry_path(root.path(), "second.sym");
        let third = entry_path(root.path(), "third.sym");
        let payload = vec![b'x'; 4000];

        index.add(&first, &payload).unwrap();
        assert!(index.size().unwrap() <= max_bytes);
        index.add(&second, &payload).unwrap();
        assert!(index.size().unwrap() <= max_bytes);
        index.add(&third, &payload).unwrap();
        assert!(index.size().unwrap() <= max_bytes);

        // Oldest entry went, the other two stayed
        assert!(matches!(index.touch(&first), Err(CacheError::NoSuchKey(_))));
        index.touch(&second).unwrap();
        index.touch(&third).unwrap();
        assert!(!first.exists());
    }

    #[test]
    fn test_pinned_entry_survives_evict_oldest() {
        let root = tempfile::tempdir().unwrap();
        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let pinned = entry_path(root.path(), "pinned.sym");
        let newer = entry_path(root.path(), "newer.sym");

        index.add(&pinned, b"pinned").unwrap();
        index.add(&newer, b"newer").unwrap();

        let reader = index.open_entry(&pinned).unwrap();
        let evicted = index.evict_oldest().unwrap().unwrap();
        assert!(evicted.path.ends_with("newer.sym"));
        drop(reader);

        let evicted = index.evict_oldest().unwrap().unwrap();
        assert!(evicted.path.ends_with("pinned.sym"));
        assert!(index.evict_oldest().unwrap().is_none());
    }

    #[test]
    fn test_release_refreshes_recency() {
        let root = tempfile::tempdir().unwrap();
        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let older = entry_path(root.path(), "older.sym");
        let newer = entry_path(root.path(), "newer.sym");

        index.add(&older, b"older").unwrap();
        index.add(&newer, b"newer").unwrap();

        // Reading the older entry makes it the most recently used
        drop(index.open_entry(&older).unwrap());

        let evicted = index.evict_oldest().unwrap().unwrap();
        assert!(evicted.path.ends_with("newer.sym"));
    }

    #[test]
    fn test_no_space_when_nothing_evictable() {
        let root = tempfile::tempdir().unwrap();
        let max_bytes = budget_for(root.path(), 1, 4000);
        let index = LruIndex::open(root.path(), max_bytes).unwrap();

        let held = entry_path(root.path(), "held.sym");
        index.add(&held, &vec![b'x'; 4000]).unwrap();

        let _reader = index.open_entry(&held).unwrap();
        let err = index
            .add(&entry_path(root.path(), "new.sym"), &vec![b'y'; 4000])
            .unwrap_err();
        assert!(matches!(err, CacheError::NoSpace));
    }

    #[test]
    fn test_oversized_entry_is_no_space() {
        let root = tempfile::tempdir().unwrap();
        let max_bytes = budget_for(root.path(), 1, 4000);
        let index = LruIndex::open(root.path(), max_bytes).unwrap();
        let err = index
            .add(&entry_path(root.path(), "big.sym"), &vec![b'x'; 1 << 20])
            .unwrap_err();
        assert!(matches!(err, CacheError::NoSpace));
    }

    #[test]
    fn test_evict_removes_row_and_file() {
        let root = tempfile::tempdir().unwrap();
        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let path = entry_path(root.path(), "lib.sym");

        index.add(&path, b"data").unwrap();
        index.evict(&path).unwrap();

        assert!(!path.exists());
        assert!(!root.path().join("lib.pdb").exists());
        assert!(matches!(index.touch(&path), Err(CacheError::NoSuchKey(_))));
        assert!(matches!(
            index.evict(&path),
            Err(CacheError::NoSuchKey(_))
        ));
    }

    #[test]
    fn test_stale_readers_reset_on_reopen() {
        let root = tempfile::tempdir().unwrap();
        let path = entry_path(root.path(), "lib.sym");
        {
            let index = LruIndex::open(root.path(), HUGE).unwrap();
            index.add(&path, b"data").unwrap();
        }

        // Simulate a crash that left a reader pinned
        {
            let conn = Connection::open(root.path().join(CACHE_DB_FILENAME)).unwrap();
            conn.execute("UPDATE cache SET readers = 3", []).unwrap();
        }

        let index = LruIndex::open(root.path(), HUGE).unwrap();
        let evicted = index.evict_oldest().unwrap();
        assert!(evicted.is_some());
    }
}
