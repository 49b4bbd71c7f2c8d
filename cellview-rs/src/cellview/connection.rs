//! Connection management: a small pool of writer connections plus
//! round-robin read-only connections.

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::StorageError;

pub const DEFAULT_WRITERS: usize = 4;
pub const DEFAULT_READERS: usize = 4;

fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA temp_store = MEMORY;
        ",
    )
    .map_err(|e| StorageError::Sqlite {
        message: format!("failed to apply pragmas: {e}"),
    })
}

fn apply_read_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA query_only = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA temp_store = MEMORY;
        ",
    )
    .map_err(|e| StorageError::Sqlite {
        message: format!("failed to apply read pragmas: {e}"),
    })
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock().map_err(|_| StorageError::Sqlite {
        message: "connection lock poisoned".to_string(),
    })
}

/// Writer and reader connections for one database.
pub(crate) struct Connections {
    writers: Vec<Mutex<Connection>>,
    /// Empty for in-memory databases; reads then use the writers.
    readers: Vec<Mutex<Connection>>,
    next_writer: AtomicUsize,
    next_reader: AtomicUsize,
}

impl Connections {
    /// Open `writers` + `readers` connections; `migrate` runs once on the
    /// first writer before the readers are opened.
    pub fn open(
        path: &Path,
        writers: usize,
        readers: usize,
        migrate: impl FnOnce(&Connection) -> Result<(), StorageError>,
    ) -> Result<Self, StorageError> {
        let first = Connection::open(path)?;
        apply_pragmas(&first)?;
        migrate(&first)?;

        let mut writer_conns = vec![Mutex::new(first)];
        for _ in 1..writers.max(1) {
            let conn = Connection::open(path)?;
            apply_pragmas(&conn)?;
            writer_conns.push(Mutex::new(conn));
        }

        let mut reader_conns = Vec::with_capacity(readers);
        for _ in 0..readers {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            apply_read_pragmas(&conn)?;
            reader_conns.push(Mutex::new(conn));
        }

        Ok(Self {
            writers: writer_conns,
            readers: reader_conns,
            next_writer: AtomicUsize::new(0),
            next_reader: AtomicUsize::new(0),
        })
    }

    /// A private in-memory database cannot be shared between connections,
    /// so everything goes through one.
    pub fn open_in_memory(
        migrate: impl FnOnce(&Connection) -> Result<(), StorageError>,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        Ok(Self {
            writers: vec![Mutex::new(conn)],
            readers: Vec::new(),
            next_writer: AtomicUsize::new(0),
            next_reader: AtomicUsize::new(0),
        })
    }

    /// Run `f` on a writer connection, preferring an idle one.
    pub fn with_writer<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let n = self.writers.len();
        let start = self.next_writer.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            if let Ok(guard) = self.writers[(start + i) % n].try_lock() {
                return f(&guard);
            }
        }
        let guard = lock(&self.writers[start % n])?;
        f(&guard)
    }

    pub fn with_reader<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        if self.readers.is_empty() {
            return self.with_writer(f);
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let guard = lock(&self.readers[idx])?;
        f(&guard)
    }
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction. The write lock is taken
/// up front; an error (or a drop before commit) rolls everything back.
pub(crate) fn with_immediate_transaction<F, T>(conn: &Connection, f: F) -> Result<T, StorageError>
where
    F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate).map_err(|e| {
        StorageError::Sqlite {
            message: format!("failed to begin immediate transaction: {e}"),
        }
    })?;

    let result = f(&tx)?;

    tx.commit().map_err(|e| StorageError::Sqlite {
        message: format!("failed to commit: {e}"),
    })?;
    Ok(result)
}

/// Run `f` against one consistent read snapshot.
pub(crate) fn with_snapshot<F, T>(conn: &Connection, f: F) -> Result<T, StorageError>
where
    F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
{
    let tx = conn.unchecked_transaction()?;
    let result = f(&tx)?;
    tx.finish()?;
    Ok(result)
}
