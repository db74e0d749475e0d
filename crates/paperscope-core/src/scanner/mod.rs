//! Incremental filesystem scanner.
//!
//! The scanner keeps a private mirror of each scope's file tree in the
//! `files` table (mtime plus, for directories, the child listing) and
//! journals every transition as an Added/Updated/Removed event. Downstream
//! indexing consumes the journal exactly once through [`EventConsumer`].

mod events;

pub use events::{Event, EventConsumer, EventKind, EventTarget, EVENT_BATCH_SIZE};

use std::collections::{BTreeMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::StorePool;

use events::record_event;

const SCANNER_SCHEMA: &str = "
CREATE TABLE files (
    id TEXT PRIMARY KEY,
    mtime REAL NOT NULL,
    scope TEXT NOT NULL,
    children TEXT
);
CREATE INDEX idx_files_scope ON files (scope);
CREATE TABLE events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind INTEGER NOT NULL,
    target INTEGER NOT NULL,
    scope TEXT NOT NULL,
    path TEXT NOT NULL,
    mtime REAL NOT NULL
);
CREATE TABLE scopes (
    name TEXT PRIMARY KEY,
    path TEXT NOT NULL
);
";

/// Rows of a dropped scope are read in batches of this many while their
/// Removed events are journaled.
const SCOPE_REMOVE_BATCH_SIZE: usize = 100;

/// A row of the `files` mirror. An entry is a directory iff `children` is
/// present; the listing is stored joined with `/`, which cannot appear in
/// a single path component.
#[derive(Debug, Clone)]
struct FileRow {
    mtime: f64,
    children: Option<Vec<String>>,
}

impl FileRow {
    fn target(&self) -> EventTarget {
        if self.children.is_some() {
            EventTarget::Directory
        } else {
            EventTarget::File
        }
    }
}

#[derive(Clone)]
pub struct Scanner {
    store: StorePool,
    db_path: PathBuf,
    sources: BTreeMap<String, PathBuf>,
}

impl Scanner {
    pub fn new(store: StorePool, db_path: PathBuf, sources: BTreeMap<String, PathBuf>) -> Self {
        Self {
            store,
            db_path,
            sources,
        }
    }

    fn connect(&self) -> Result<Connection> {
        self.store.open(&self.db_path, SCANNER_SCHEMA)
    }

    /// Resolve a scope-relative path (always starting with `/`) under the
    /// scope's root directory.
    pub fn abs_path(root: &Path, relative: &str) -> PathBuf {
        root.join(relative.trim_start_matches('/'))
    }

    /// Walk every configured scope and journal the deltas since the last
    /// scan. Checks `cancel` at each traversal step.
    pub fn scan(&self, cancel: &CancellationToken) -> Result<()> {
        let mut conn = self.connect()?;
        self.sync_scopes(&mut conn)?;

        for (scope, root) in &self.sources {
            tracing::debug!(scope = %scope, root = %root.display(), "Scanning scope");
            self.scan_scope(&mut conn, scope, root, cancel)?;
        }
        Ok(())
    }

    /// Number of journaled events awaiting consumption.
    pub fn events_count(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Open a consuming iterator over the journal.
    pub fn consumer(&self) -> Result<EventConsumer> {
        let conn = self.connect()?;
        Ok(EventConsumer::new(self.store.clone(), conn))
    }

    /// Reconcile the `scopes` table with the configured sources: register
    /// new scopes, re-point renamed roots, and for scopes that disappeared
    /// emit Removed events for every tracked entry before dropping their
    /// rows.
    fn sync_scopes(&self, conn: &mut Connection) -> Result<()> {
        let mut origin: BTreeMap<String, String> = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT name, path FROM scopes")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                let (name, path): (String, String) = row?;
                origin.insert(name, path);
            }
        }

        self.store.with_tx(conn, |tx| {
            for (name, root) in &self.sources {
                let root_str = root.to_string_lossy();
                match origin.remove(name) {
                    None => {
                        tx.execute(
                            "INSERT INTO scopes (name, path) VALUES (?1, ?2)",
                            params![name, root_str],
                        )?;
                    }
                    Some(prev) if prev != root_str => {
                        tx.execute(
                            "UPDATE scopes SET path = ?1 WHERE name = ?2",
                            params![root_str, name],
                        )?;
                    }
                    Some(_) => {}
                }
            }

            for name in origin.keys() {
                // Walk the scope's rows in bounded batches; scopes can
                // track arbitrarily many files.
                let mut offset = 0usize;
                loop {
                    let rows: Vec<(String, f64, Option<String>)> = {
                        let mut stmt = tx.prepare(
                            "SELECT id, mtime, children FROM files WHERE scope = ?1
                             ORDER BY id LIMIT ?2 OFFSET ?3",
                        )?;
                        let rows = stmt
                            .query_map(
                                params![name, SCOPE_REMOVE_BATCH_SIZE as i64, offset as i64],
                                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                            )?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    };
                    let fetched = rows.len();
                    for (id, mtime, children) in rows {
                        let path = id
                            .strip_prefix(&format!("{name}:"))
                            .unwrap_or(&id)
                            .to_string();
                        let target = if children.is_some() {
                            EventTarget::Directory
                        } else {
                            EventTarget::File
                        };
                        record_event(tx, EventKind::Removed, target, name, &path, mtime)?;
                    }
                    if fetched < SCOPE_REMOVE_BATCH_SIZE {
                        break;
                    }
                    offset += SCOPE_REMOVE_BATCH_SIZE;
                }
                tx.execute("DELETE FROM files WHERE scope = ?1", [name])?;
                tx.execute("DELETE FROM scopes WHERE name = ?1", [name])?;
                tracing::info!(scope = %name, "Dropped scope");
            }
            Ok(())
        })
    }

    /// Depth-first traversal seeded at `/`.
    fn scan_scope(
        &self,
        conn: &mut Connection,
        scope: &str,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stack = vec!["/".to_string()];

        while let Some(relative) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            if let Some(children) = self.scan_entry(conn, scope, root, &relative)? {
                for child in children {
                    stack.push(join_relative(&relative, &child));
                }
            }
        }
        Ok(())
    }

    /// Reconcile one entry against its mirror row; returns the child names
    /// to recurse into for directories.
    fn scan_entry(
        &self,
        conn: &mut Connection,
        scope: &str,
        root: &Path,
        relative: &str,
    ) -> Result<Option<Vec<String>>> {
        let abs = Self::abs_path(root, relative);
        let old = select_file(conn, scope, relative)?;

        let Ok(meta) = std::fs::metadata(&abs) else {
            // Entry disappeared since the last scan.
            if let Some(old) = old {
                self.store
                    .with_tx(conn, |tx| remove_entry(tx, scope, relative, &old))?;
            }
            return Ok(None);
        };

        let mtime = mtime_seconds(&meta)?;
        let treat_as_dir = meta.is_dir() && !is_epub_bundle(relative);

        if let Some(old_row) = &old {
            let same_kind = old_row.children.is_some() == treat_as_dir;
            if old_row.mtime == mtime && same_kind {
                // Unchanged; still recurse into the cached listing to catch
                // deeper modifications.
                return Ok(old_row.children.clone());
            }
        }

        let children: Option<Vec<String>> = if treat_as_dir {
            let mut names: Vec<String> = std::fs::read_dir(&abs)?
                .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
                .collect::<Result<Vec<_>>>()?;
            names.sort();
            Some(names)
        } else {
            None
        };

        self.store.with_tx(conn, |tx| {
            let target = if children.is_some() {
                EventTarget::Directory
            } else {
                EventTarget::File
            };
            let encoded = children.as_ref().map(|names| names.join("/"));
            let file_id = file_id(scope, relative);

            let kind = if old.is_some() {
                tx.execute(
                    "UPDATE files SET mtime = ?1, children = ?2 WHERE id = ?3",
                    params![mtime, encoded, file_id],
                )?;
                EventKind::Updated
            } else {
                tx.execute(
                    "INSERT INTO files (id, mtime, scope, children) VALUES (?1, ?2, ?3, ?4)",
                    params![file_id, mtime, scope, encoded],
                )?;
                EventKind::Added
            };
            record_event(tx, kind, target, scope, relative, mtime)?;

            // Names that vanished from a changed directory would otherwise
            // be missed by the traversal; remove them here.
            if let Some(old_children) = old.as_ref().and_then(|row| row.children.as_ref()) {
                let keep: HashSet<&str> = children
                    .as_deref()
                    .unwrap_or(&[])
                    .iter()
                    .map(String::as_str)
                    .collect();
                for name in old_children {
                    if keep.contains(name.as_str()) {
                        continue;
                    }
                    let child_relative = join_relative(relative, name);
                    if let Some(child) = select_file(tx, scope, &child_relative)? {
                        remove_entry(tx, scope, &child_relative, &child)?;
                    }
                }
            }
            Ok(())
        })?;

        Ok(children)
    }
}

/// Delete an entry's row, journal its removal, and recurse into tracked
/// descendants when it was a directory.
fn remove_entry(conn: &Connection, scope: &str, relative: &str, row: &FileRow) -> Result<()> {
    if let Some(children) = &row.children {
        for name in children {
            let child_relative = join_relative(relative, name);
            if let Some(child) = select_file(conn, scope, &child_relative)? {
                remove_entry(conn, scope, &child_relative, &child)?;
            }
        }
    }
    conn.execute("DELETE FROM files WHERE id = ?1", [file_id(scope, relative)])?;
    record_event(
        conn,
        EventKind::Removed,
        row.target(),
        scope,
        relative,
        row.mtime,
    )?;
    Ok(())
}

fn select_file(conn: &Connection, scope: &str, relative: &str) -> Result<Option<FileRow>> {
    let row: Option<(f64, Option<String>)> = conn
        .query_row(
            "SELECT mtime, children FROM files WHERE id = ?1",
            [file_id(scope, relative)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(row.map(|(mtime, children)| FileRow {
        mtime,
        children: children.map(decode_children),
    }))
}

fn file_id(scope: &str, relative: &str) -> String {
    format!("{scope}:{relative}")
}

fn join_relative(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn decode_children(encoded: String) -> Vec<String> {
    encoded
        .split('/')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn mtime_seconds(meta: &Metadata) -> Result<f64> {
    let modified = meta.modified()?;
    let duration = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("mtime before epoch: {e}")))?;
    Ok(duration.as_secs_f64())
}

/// E-book bundles stored as directories are leaves; their contents are
/// never traversed.
fn is_epub_bundle(relative: &str) -> bool {
    Path::new(relative)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("epub"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, UNIX_EPOCH};

    fn pin_mtime(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    // Directory timestamps share the kernel's coarse clock; pin them so
    // back-to-back fixture setup cannot alias an unchanged mtime.
    fn pin_dir_mtime(path: &Path, secs: u64) {
        let dir = fs::File::open(path).unwrap();
        dir.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    fn scanner_for(dir: &Path, root: &Path) -> Scanner {
        let mut sources = BTreeMap::new();
        sources.insert("test".to_string(), root.to_path_buf());
        Scanner::new(StorePool::new(), dir.join("scanner.sqlite3"), sources)
    }

    fn drain(scanner: &Scanner) -> Vec<Event> {
        let mut consumer = scanner.consumer().unwrap();
        let mut events = Vec::new();
        while let Some(event) = consumer.next_event().unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn first_scan_adds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("sub/b.txt"), "b").unwrap();

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();

        let events = drain(&scanner);
        let added: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::Added)
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(events.len(), added.len());
        assert!(added.contains(&"/"));
        assert!(added.contains(&"/a.txt"));
        assert!(added.contains(&"/sub"));
        assert!(added.contains(&"/sub/b.txt"));

        // Ids are strictly increasing.
        for pair in events.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[test]
    fn second_scan_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();
        drain(&scanner);

        scanner.scan(&CancellationToken::new()).unwrap();
        assert_eq!(scanner.events_count().unwrap(), 0);
    }

    #[test]
    fn modified_file_emits_updated() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        let file = root.join("a.txt");
        fs::write(&file, "a").unwrap();
        pin_mtime(&file, 1_000);

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();
        drain(&scanner);

        fs::write(&file, "changed").unwrap();
        pin_mtime(&file, 2_000);
        scanner.scan(&CancellationToken::new()).unwrap();

        let events = drain(&scanner);
        let updated: Vec<&Event> = events
            .iter()
            .filter(|e| e.kind == EventKind::Updated && e.target == EventTarget::File)
            .collect();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].path, "/a.txt");
        assert_eq!(updated[0].mtime, 2_000.0);
    }

    #[test]
    fn deleted_tree_emits_removed_for_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(root.join("sub/deep")).unwrap();
        fs::write(root.join("sub/x.txt"), "x").unwrap();
        fs::write(root.join("sub/deep/y.txt"), "y").unwrap();

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();
        drain(&scanner);

        fs::remove_dir_all(root.join("sub")).unwrap();
        scanner.scan(&CancellationToken::new()).unwrap();

        let events = drain(&scanner);
        let removed: HashSet<String> = events
            .iter()
            .filter(|e| e.kind == EventKind::Removed)
            .map(|e| e.path.clone())
            .collect();
        assert!(removed.contains("/sub"));
        assert!(removed.contains("/sub/x.txt"));
        assert!(removed.contains("/sub/deep"));
        assert!(removed.contains("/sub/deep/y.txt"));
    }

    #[test]
    fn epub_directory_is_a_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(root.join("book.epub/META-INF")).unwrap();
        fs::write(root.join("book.epub/content.opf"), "x").unwrap();

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();

        let events = drain(&scanner);
        let bundle: Vec<&Event> = events
            .iter()
            .filter(|e| e.path == "/book.epub")
            .collect();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle[0].target, EventTarget::File);
        assert!(!events.iter().any(|e| e.path.contains("content.opf")));
    }

    #[test]
    fn partial_consumption_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        for i in 0..60 {
            fs::write(root.join(format!("f{i:02}.txt")), "x").unwrap();
        }

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();
        let total = scanner.events_count().unwrap();
        assert!(total > EVENT_BATCH_SIZE as u64);

        // Read one full batch plus a bit of the second, then drop.
        {
            let mut consumer = scanner.consumer().unwrap();
            for _ in 0..(EVENT_BATCH_SIZE + 3) {
                assert!(consumer.next_event().unwrap().is_some());
            }
        }

        // The first batch was deleted at the boundary; the second batch
        // survives the drop and is re-delivered.
        let remaining = scanner.events_count().unwrap();
        assert_eq!(remaining, total - EVENT_BATCH_SIZE as u64);

        let events = drain(&scanner);
        assert_eq!(events.len() as u64, remaining);
        assert_eq!(scanner.events_count().unwrap(), 0);
    }

    #[test]
    fn stopping_on_a_batch_boundary_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        for i in 0..60 {
            fs::write(root.join(format!("f{i:02}.txt")), "x").unwrap();
        }

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();
        let total = scanner.events_count().unwrap();

        // Stop exactly after the first batch: its range must already be
        // deleted, not deferred to a fetch that never happens.
        {
            let mut consumer = scanner.consumer().unwrap();
            for _ in 0..EVENT_BATCH_SIZE {
                assert!(consumer.next_event().unwrap().is_some());
            }
        }
        assert_eq!(
            scanner.events_count().unwrap(),
            total - EVENT_BATCH_SIZE as u64
        );
    }

    #[test]
    fn removed_scope_emits_removed_events() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();
        drain(&scanner);

        // Same database, no configured scopes anymore.
        let empty = Scanner::new(
            StorePool::new(),
            dir.path().join("scanner.sqlite3"),
            BTreeMap::new(),
        );
        empty.scan(&CancellationToken::new()).unwrap();

        let events = drain(&empty);
        assert!(events
            .iter()
            .all(|e| e.kind == EventKind::Removed && e.scope == "test"));
        assert!(events.iter().any(|e| e.path == "/a.txt"));
    }

    #[test]
    fn removed_scope_with_many_rows_journals_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        // More rows than one scope-removal read batch.
        for i in 0..(SCOPE_REMOVE_BATCH_SIZE + 20) {
            fs::write(root.join(format!("f{i:03}.txt")), "x").unwrap();
        }

        let scanner = scanner_for(dir.path(), &root);
        scanner.scan(&CancellationToken::new()).unwrap();
        drain(&scanner);

        let empty = Scanner::new(
            StorePool::new(),
            dir.path().join("scanner.sqlite3"),
            BTreeMap::new(),
        );
        empty.scan(&CancellationToken::new()).unwrap();

        let events = drain(&empty);
        // Every tracked row (files plus the root directory) is journaled.
        assert_eq!(events.len(), SCOPE_REMOVE_BATCH_SIZE + 20 + 1);
        assert!(events.iter().all(|e| e.kind == EventKind::Removed));
        assert!(events.iter().any(|e| e.path == "/f119.txt"));
    }

    #[test]
    fn repointed_scope_converges_via_removals() {
        let dir = tempfile::tempdir().unwrap();
        let old_root = dir.path().join("old");
        let new_root = dir.path().join("new");
        fs::create_dir_all(&old_root).unwrap();
        fs::create_dir_all(&new_root).unwrap();
        fs::write(old_root.join("only-old.txt"), "x").unwrap();
        fs::write(new_root.join("only-new.txt"), "y").unwrap();
        pin_dir_mtime(&old_root, 1_000);
        pin_dir_mtime(&new_root, 2_000);

        let scanner = scanner_for(dir.path(), &old_root);
        scanner.scan(&CancellationToken::new()).unwrap();
        drain(&scanner);

        // Same scope name, different root directory.
        let repointed = scanner_for(dir.path(), &new_root);
        repointed.scan(&CancellationToken::new()).unwrap();

        let events = drain(&repointed);
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::Removed && e.path == "/only-old.txt"));
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::Added && e.path == "/only-new.txt"));
    }

    #[test]
    fn interrupt_stops_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();

        let scanner = scanner_for(dir.path(), &root);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = scanner.scan(&cancel).unwrap_err();
        assert!(err.is_interrupted());
    }
}
