//! Bounded worker pool applying scanner events to the index.
//!
//! The driver pushes events onto a bounded channel; workers pull through
//! a shared receiver and apply each event with their own [`Index`]
//! context (one connection set per worker). Cancellation is cooperative:
//! the token is polled at event boundaries here and at the traversal and
//! page-loop safe points further down. A worker failure cancels the token
//! so the driver stops feeding, and surfaces as `RaisedException`.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::progress::ProgressReporter;
use crate::scanner::Event;

/// Builds a per-worker index context.
pub type IndexFactory = Arc<dyn Fn() -> Result<Index> + Send + Sync>;

/// Terminal state of a scan pool.
#[derive(Debug)]
pub enum ScanOutcome {
    /// Every pushed event was applied.
    Ok,
    /// Cooperative cancellation stopped the pool early.
    Interrupted,
    /// A worker failed; the first error is carried along.
    RaisedException(Error),
}

/// Shared receiver for multiple workers pulling from one bounded channel.
struct SharedReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> SharedReceiver<T> {
    fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

pub struct ScanPool {
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl ScanPool {
    /// Spawn `workers` tasks consuming events.
    pub fn spawn(
        workers: usize,
        factory: IndexFactory,
        progress: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> Self {
        let worker_count = workers.max(1);
        let (tx, rx) = mpsc::channel::<Event>(worker_count * 2);
        let rx = SharedReceiver::new(rx);

        let handles = (0..worker_count)
            .map(|worker| {
                let rx = rx.clone();
                let factory = factory.clone();
                let progress = progress.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    tracing::debug!(worker, "Scan worker started");

                    let mut index = match factory() {
                        Ok(index) => index,
                        Err(e) => {
                            tracing::error!(worker, error = %e, "Worker context failed");
                            cancel.cancel();
                            return Err(e);
                        }
                    };

                    loop {
                        if cancel.is_cancelled() {
                            return Err(Error::Interrupted);
                        }
                        let Some(event) = rx.recv().await else {
                            break;
                        };

                        let display = index.resolve_path(&event.scope, &event.path);
                        if let Some(path) = &display {
                            progress.on_start_handle_file(path);
                        }

                        match index.handle_event(&event, progress.as_ref(), &cancel).await {
                            Ok(()) => {
                                if let Some(path) = &display {
                                    progress.on_complete_handle_file(path);
                                }
                            }
                            Err(e) if e.is_interrupted() => return Err(e),
                            Err(e) => {
                                tracing::error!(
                                    scope = %event.scope,
                                    path = %event.path,
                                    error = %e,
                                    "Event handling failed"
                                );
                                cancel.cancel();
                                return Err(e);
                            }
                        }
                    }

                    tracing::debug!(worker, "Scan worker stopped");
                    Ok(())
                })
            })
            .collect();

        Self {
            tx,
            cancel,
            handles,
        }
    }

    /// Queue an event; returns false once the pool stopped accepting work
    /// (interrupt or worker failure).
    pub async fn push(&self, event: Event) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Request cooperative cancellation. Safe to call from any task.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Close the queue, wait for the workers, and report the outcome.
    ///
    /// A worker failure dominates; otherwise a cancelled token (external
    /// interrupt or the job's shared token) reports `Interrupted`.
    pub async fn complete(self) -> ScanOutcome {
        drop(self.tx);

        let mut failure: Option<Error> = None;
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_interrupted() => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(join_error) => {
                    if failure.is_none() {
                        failure = Some(Error::Config(format!("scan worker panicked: {join_error}")));
                    }
                }
            }
        }

        if let Some(error) = failure {
            ScanOutcome::RaisedException(error)
        } else if self.cancel.is_cancelled() {
            ScanOutcome::Interrupted
        } else {
            ScanOutcome::Ok
        }
    }
}
