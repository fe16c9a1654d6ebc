// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size worker pool over a FIFO task channel.
//!
//! Workers block on the channel when idle. `stop_and_wait` enqueues one
//! shutdown marker per worker; since the channel is FIFO, every task
//! submitted before the stop is executed before the workers exit.
//!
//! No priorities, no per-task timeouts.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::{EngineError, Result};

/// A unit of work executed on a pool worker.
///
/// Implemented for any `FnOnce()`; implemented directly by recyclable
/// task objects that must survive their own execution.
pub(crate) trait PoolRunnable: Send {
    fn run_in_pool(self: Box<Self>);
}

impl<F: FnOnce() + Send> PoolRunnable for F {
    fn run_in_pool(self: Box<Self>) {
        (*self)()
    }
}

enum Job {
    Run(Box<dyn PoolRunnable>),
    Shutdown,
}

/// FIFO worker pool with a fixed thread count.
pub(crate) struct ThreadPool {
    name: String,
    workers: usize,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ThreadPool {
    pub(crate) fn new(name: &str, workers: usize) -> Self {
        debug_assert!(workers > 0);
        let (tx, rx) = unbounded();
        Self {
            name: name.to_string(),
            workers,
            tx,
            rx,
            handles: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers
    }

    /// Spawn the worker threads. Idempotent.
    pub(crate) fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut handles = self.handles.lock();
        for idx in 0..self.workers {
            let rx = self.rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, idx))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        match job {
                            Job::Run(task) => task.run_in_pool(),
                            Job::Shutdown => break,
                        }
                    }
                })
                .map_err(EngineError::Io)?;
            handles.push(handle);
        }
        Ok(())
    }

    /// Enqueue a task object.
    ///
    /// Tasks submitted after `stop_and_wait` are dropped.
    pub(crate) fn execute_boxed(&self, task: Box<dyn PoolRunnable>) {
        if self.stopped.load(Ordering::Acquire) {
            log::warn!("{}: task submitted after stop, dropped", self.name);
            return;
        }
        // Send only fails if the receiver side is gone, which cannot
        // happen while the pool itself holds an rx clone.
        let _ = self.tx.send(Job::Run(task));
    }

    /// Enqueue a closure.
    pub(crate) fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.execute_boxed(Box::new(task));
    }

    /// Drain the queue and join every worker.
    pub(crate) fn stop_and_wait(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for _ in 0..self.workers {
            let _ = self.tx.send(Job::Shutdown);
        }

        let mut interrupted = false;
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::warn!("{}: worker panicked during shutdown", self.name);
                interrupted = true;
            }
        }
        if interrupted {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_executes_tasks() {
        let pool = ThreadPool::new("tp-test", 4);
        pool.start().expect("pool start");

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            pool.execute(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.stop_and_wait().expect("pool stop");
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_stop_drains_queue() {
        let pool = ThreadPool::new("tp-drain", 2);
        pool.start().expect("pool start");

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            pool.execute(move || {
                thread::sleep(Duration::from_micros(100));
                c.fetch_add(1, Ordering::Relaxed);
            });
        }

        // stop_and_wait must not return until every queued task ran.
        pool.stop_and_wait().expect("pool stop");
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_execute_after_stop_is_dropped() {
        let pool = ThreadPool::new("tp-late", 1);
        pool.start().expect("pool start");
        pool.stop_and_wait().expect("pool stop");

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.execute(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_single_worker_preserves_fifo() {
        let pool = ThreadPool::new("tp-fifo", 1);
        pool.start().expect("pool start");

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = Arc::clone(&order);
            pool.execute(move || order.lock().push(i));
        }

        pool.stop_and_wait().expect("pool stop");
        let order = order.lock();
        assert_eq!(*order, (0..20).collect::<Vec<_>>());
    }
}
