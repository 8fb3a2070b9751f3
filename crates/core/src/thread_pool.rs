//! Worker threads for receive streams.
//!
//! A [`ThreadPool`] owns a fixed set of named threads fed from one job
//! queue. Long-running work is split into short jobs that queue their own
//! continuation through a [`Spawner`], so any number of streams can share
//! even a single thread. Dropping the pool cancels its token, stops taking
//! jobs and joins every worker once the jobs still holding a spawner have
//! wound down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::Sender;
use tracing::{debug, error};

use crate::error::{Result, TransportError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation flag.
///
/// A child token is cancelled when it or any ancestor is cancelled;
/// cancelling a child leaves the parent alone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    this: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.this.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.this.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }

    /// Token cancelled along with this one, but cancellable on its own.
    ///
    /// Only one level of ancestry is tracked.
    pub fn child(&self) -> Self {
        Self {
            this: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.this)),
        }
    }
}

/// Handle for queueing jobs on a pool, including from inside a job.
#[derive(Debug, Clone)]
pub struct Spawner {
    tx: Sender<Job>,
    token: CancelToken,
}

impl Spawner {
    /// Queue a job. Fails once the pool is shutting down.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(TransportError::Closed.into());
        }
        self.tx.send(Box::new(job)).map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    /// True once the pool has been dropped. Jobs should finish up rather
    /// than queue a continuation.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Fixed-size pool of named worker threads.
#[derive(Debug)]
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    token: CancelToken,
}

impl ThreadPool {
    /// Start `threads` workers named `{name}-{i}`.
    ///
    /// # Errors
    /// `TransportError::Io` if a thread cannot be spawned.
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    debug!(worker = i, "worker exiting");
                })
                .map_err(TransportError::Io)?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            workers,
            token: CancelToken::new(),
        })
    }

    /// Queue a job. It starts once a worker is free.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner()?.spawn(job)
    }

    /// Handle a job can keep to queue its own continuation.
    pub fn spawner(&self) -> Result<Spawner> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        Ok(Spawner {
            tx: tx.clone(),
            token: self.token.clone(),
        })
    }

    /// Token cancelled when the pool shuts down. Jobs should watch a child
    /// of it.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.token.cancel();
        self.tx = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}
