//! Service façade: wires the scanner, the index, and the worker pool, and
//! exposes the public operations (scan jobs, queries, page content
//! lookup) plus the emergency freeze used by the signal ladder.

mod signal;

pub use signal::{SignalAction, SignalHandler, FORCE_STOP_WINDOW};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{PackageConfig, Workspace};
use crate::embeddings::Embedder;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::pipeline::{IndexFactory, ScanOutcome, ScanPool};
use crate::progress::ProgressReporter;
use crate::scanner::Scanner;
use crate::search::{self, QueryResult};
use crate::store::StorePool;

const DEFAULT_RESULTS_LIMIT: usize = 10;

pub struct Service {
    store: StorePool,
    workspace: Workspace,
    sources: BTreeMap<String, PathBuf>,
    embedder: Arc<Embedder>,
}

impl Service {
    pub fn new(
        workspace: Workspace,
        sources: BTreeMap<String, PathBuf>,
        embedder: Embedder,
    ) -> Result<Self> {
        workspace.ensure_dirs()?;
        Ok(Self {
            store: StorePool::new(),
            workspace,
            sources,
            embedder: Arc::new(embedder),
        })
    }

    /// Build a service from a loaded package manifest.
    pub fn from_package(config: &PackageConfig, package_dir: &Path) -> Result<Self> {
        Self::new(
            Workspace::new(package_dir),
            config.sources.clone(),
            Embedder::remote(&config.embedding),
        )
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Prepare a scan job with a bounded worker pool.
    pub fn scan_job(
        &self,
        max_workers: usize,
        progress: Arc<dyn ProgressReporter>,
    ) -> ServiceScanJob {
        let scanner = Scanner::new(
            self.store.clone(),
            self.workspace.scanner_db(),
            self.sources.clone(),
        );

        let store = self.store.clone();
        let workspace = self.workspace.clone();
        let sources = self.sources.clone();
        let embedder = self.embedder.clone();
        let factory: IndexFactory = Arc::new(move || {
            Index::open(store.clone(), &workspace, sources.clone(), embedder.clone())
        });

        ServiceScanJob {
            scanner,
            factory,
            progress,
            cancel: CancellationToken::new(),
            max_workers,
        }
    }

    /// Three-tier retrieval trimmed to page-level hits.
    pub async fn query(&self, text: &str, results_limit: Option<usize>) -> Result<QueryResult> {
        let limit = results_limit.unwrap_or(DEFAULT_RESULTS_LIMIT);
        let index = self.open_index()?;
        let (nodes, keywords) = index.query(text, limit).await?;
        let items = search::trim_nodes(&index, &nodes, &keywords)?;
        Ok(QueryResult { items, keywords })
    }

    /// Snapshot text of the n-th page of a PDF by hash; empty when the
    /// page is unknown.
    pub fn page_content(&self, pdf_hash: &str, page_index: usize) -> Result<String> {
        self.open_index()?.page_content(pdf_hash, page_index)
    }

    /// Sever all database writes. Part of the force-stop path; the
    /// process is expected to exit shortly after.
    pub fn freeze_database(&self) {
        self.store.freeze();
    }

    fn open_index(&self) -> Result<Index> {
        Index::open(
            self.store.clone(),
            &self.workspace,
            self.sources.clone(),
            self.embedder.clone(),
        )
    }
}

/// A prepared scan pass: traversal, journal consumption, worker pool.
pub struct ServiceScanJob {
    scanner: Scanner,
    factory: IndexFactory,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    max_workers: usize,
}

impl ServiceScanJob {
    /// Run the scan to completion.
    ///
    /// Returns `Ok(true)` when the pass completed, `Ok(false)` when it was
    /// interrupted (the journal keeps unconsumed events for the next
    /// pass), and `Err` when a worker failed.
    pub async fn start(&self) -> Result<bool> {
        // Produce the event journal first; the traversal polls the token
        // at every step.
        let scanner = self.scanner.clone();
        let cancel = self.cancel.clone();
        let scan_result = tokio::task::spawn_blocking(move || scanner.scan(&cancel))
            .await
            .map_err(|e| Error::Config(format!("scan task panicked: {e}")))?;
        match scan_result {
            Ok(()) => {}
            Err(e) if e.is_interrupted() => return Ok(false),
            Err(e) => return Err(e),
        }

        let count = self.scanner.events_count()?;
        self.progress.on_start_scan(count);

        let pool = ScanPool::spawn(
            self.max_workers,
            self.factory.clone(),
            self.progress.clone(),
            self.cancel.clone(),
        );

        let mut driver_error: Option<Error> = None;
        match self.scanner.consumer() {
            Ok(mut consumer) => loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                match consumer.next_event() {
                    Ok(Some(event)) => {
                        if !pool.push(event).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        driver_error = Some(e);
                        pool.interrupt();
                        break;
                    }
                }
            },
            Err(e) => {
                driver_error = Some(e);
                pool.interrupt();
            }
        }

        let outcome = pool.complete().await;
        if let Some(e) = driver_error {
            return Err(e);
        }
        match outcome {
            ScanOutcome::Ok => Ok(true),
            ScanOutcome::Interrupted => Ok(false),
            ScanOutcome::RaisedException(e) => Err(e),
        }
    }

    /// Cooperatively cancel the pass. Safe from any thread; workers stop
    /// at their next safe point.
    pub fn interrupt(&self) {
        tracing::info!("Scan interrupt requested");
        self.cancel.cancel();
    }
}
