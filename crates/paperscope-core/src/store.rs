//! SQLite connection plumbing shared by every store in the workspace.
//!
//! Each component owns its own connections (rusqlite connections are not
//! `Sync`, and workers each open a private set), but they all go through
//! [`StorePool`]: it applies the recommended pragmas, runs the registered
//! schema exactly once per database file, wraps multi-row mutations in
//! scoped transactions, and carries the process-wide freeze flag used by
//! the force-stop path.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::{Connection, Transaction};

use crate::error::{Error, Result};

/// Shared handle over the workspace's SQLite databases.
///
/// Cloning is cheap; all clones observe the same freeze flag.
#[derive(Clone, Default)]
pub struct StorePool {
    frozen: Arc<AtomicBool>,
}

impl StorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to `path`, creating the schema on first open.
    ///
    /// Pragmas applied:
    /// - `journal_mode = WAL` so concurrent readers coexist with a writer.
    /// - `busy_timeout = 5000` to wait out short writer contention.
    ///
    /// First open is detected through `PRAGMA user_version`: the schema
    /// batch runs inside a transaction and bumps the version to 1.
    pub fn open(&self, path: &Path, schema: &str) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version == 0 {
            conn.execute_batch(&format!(
                "BEGIN;\n{schema}\nPRAGMA user_version = 1;\nCOMMIT;"
            ))?;
            tracing::debug!(path = %path.display(), "Created schema");
        }

        Ok(conn)
    }

    /// Sever all subsequent writes. Used by the force-stop ladder; there is
    /// no way back short of restarting the process.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
        tracing::warn!("Database writes frozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_frozen() {
            Err(Error::Frozen)
        } else {
            Ok(())
        }
    }

    /// Run `f` inside a transaction that commits on success and rolls back
    /// on any failure path (including panic unwinding, via rusqlite's drop
    /// behavior).
    pub fn with_tx<T>(
        &self,
        conn: &mut Connection,
        f: impl FnOnce(&Transaction) -> Result<T>,
    ) -> Result<T> {
        self.check_writable()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
