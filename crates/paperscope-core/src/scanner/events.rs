//! Event journal rows and the consume-once iterator over them.

use std::collections::VecDeque;

use rusqlite::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::store::StorePool;

/// Events are pulled from the journal in batches of this many rows; each
/// fully-consumed batch is deleted in the same transaction that fetches
/// the next one.
pub const EVENT_BATCH_SIZE: usize = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    Removed,
}

impl EventKind {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            EventKind::Added => 0,
            EventKind::Updated => 1,
            EventKind::Removed => 2,
        }
    }

    fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(EventKind::Added),
            1 => Ok(EventKind::Updated),
            2 => Ok(EventKind::Removed),
            other => Err(Error::Config(format!("unknown event kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    File,
    Directory,
}

impl EventTarget {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            EventTarget::File => 0,
            EventTarget::Directory => 1,
        }
    }

    fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(EventTarget::File),
            1 => Ok(EventTarget::Directory),
            other => Err(Error::Config(format!("unknown event target {other}"))),
        }
    }
}

/// A journaled delta between the file-table mirror and the filesystem.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub kind: EventKind,
    pub target: EventTarget,
    pub scope: String,
    pub path: String,
    pub mtime: f64,
}

pub(crate) fn record_event(
    conn: &Connection,
    kind: EventKind,
    target: EventTarget,
    scope: &str,
    path: &str,
    mtime: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO events (kind, target, scope, path, mtime) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![kind.as_i64(), target.as_i64(), scope, path, mtime],
    )?;
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<(i64, i64, i64, String, String, f64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

/// Consuming iterator over the event journal.
///
/// Rows are yielded oldest-id-first in batches of [`EVENT_BATCH_SIZE`].
/// The moment a batch's last row is yielded, its id range is deleted, so
/// a consumer dropped on a batch boundary leaves nothing already-applied
/// behind. Dropping the consumer mid-batch leaves the unfinished batch
/// in the journal, so partial consumption resumes on a later scan.
pub struct EventConsumer {
    store: StorePool,
    conn: Connection,
    batch: VecDeque<Event>,
    exhausted: bool,
}

impl EventConsumer {
    pub(crate) fn new(store: StorePool, conn: Connection) -> Self {
        Self {
            store,
            conn,
            batch: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Pull the next event, or `None` once the journal is drained.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        if self.batch.is_empty() {
            if self.exhausted {
                return Ok(None);
            }
            self.refill()?;
        }

        let Some(event) = self.batch.pop_front() else {
            return Ok(None);
        };
        if self.batch.is_empty() {
            // The batch is consumed as of this yield; delete its range
            // right away rather than on the next fetch.
            let last_id = event.id;
            self.store.with_tx(&mut self.conn, |tx| {
                tx.execute("DELETE FROM events WHERE id <= ?1", [last_id])?;
                Ok(())
            })?;
        }
        Ok(Some(event))
    }

    fn refill(&mut self) -> Result<()> {
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT id, kind, target, scope, path, mtime FROM events ORDER BY id LIMIT ?1",
            )?;
            let mapped = stmt
                .query_map([EVENT_BATCH_SIZE as i64], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            mapped
        };

        if rows.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        self.batch = rows
            .into_iter()
            .map(|(id, kind, target, scope, path, mtime)| {
                Ok(Event {
                    id,
                    kind: EventKind::from_i64(kind)?,
                    target: EventTarget::from_i64(target)?,
                    scope,
                    path,
                    mtime,
                })
            })
            .collect::<Result<VecDeque<_>>>()?;
        Ok(())
    }
}
