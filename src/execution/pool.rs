//! Worker Pool
//!
//! A fixed set of OS threads draining one FIFO run queue of logical
//! threads. Each dequeued thread gets exactly one [`LogicalThread::resume`]
//! call; a panic inside an action is contained to the logical thread that
//! raised it.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};

use super::thread::LogicalThread;

/// Run queue message.
pub(crate) enum Message {
    Run(Arc<LogicalThread>),
    Shutdown,
}

/// Sending half of the run queue.
#[derive(Clone)]
pub struct Scheduler {
    tx: Sender<Message>,
}

impl Scheduler {
    /// Queues a thread for one unit of work; false if the queue is closed.
    pub(crate) fn enqueue(&self, thread: Arc<LogicalThread>) -> bool {
        self.tx.send(Message::Run(thread)).is_ok()
    }

    /// Number of messages waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// A scheduler with no workers attached; tests step the queue by hand.
    #[cfg(test)]
    pub(crate) fn detached() -> (Scheduler, Receiver<Message>) {
        let (tx, rx) = unbounded();
        (Scheduler { tx }, rx)
    }
}

/// Bounded set of worker threads.
pub struct WorkerPool {
    scheduler: Scheduler,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers named `actiontree-worker-N`.
    pub fn new(size: usize) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("actiontree-worker-{}", index))
                .spawn(move || worker_loop(index, rx))?;
            workers.push(handle);
        }

        info!("Started worker pool with {} workers", size);
        Ok(Self {
            scheduler: Scheduler { tx },
            workers,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops every worker after the work already queued ahead of the stop
    /// messages, and waits for them.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for _ in &self.workers {
            let _ = self.scheduler.tx.send(Message::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, rx: Receiver<Message>) {
    debug!("Worker {} started", index);
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(thread) => run_one(&thread),
            Message::Shutdown => break,
        }
    }
    debug!("Worker {} stopped", index);
}

/// Resumes one thread, converting an action panic into thread failure.
pub(crate) fn run_one(thread: &Arc<LogicalThread>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| thread.resume()));
    if let Err(payload) = result {
        thread.recover_from_panic(panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Global cap on live logical threads across all jobs.
///
/// A limit of 0 means unlimited.
#[derive(Debug)]
pub struct ThreadBudget {
    live: AtomicUsize,
    limit: usize,
}

impl ThreadBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            limit,
        }
    }

    /// Claims one slot; false when the cap is reached.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            if self.limit != 0 && current >= self.limit {
                return false;
            }
            match self.live.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_limit() {
        let budget = ThreadBudget::new(2);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        budget.release();
        assert_eq!(budget.live(), 1);
        assert!(budget.try_acquire());
    }

    #[test]
    fn test_budget_unlimited_and_saturating() {
        let budget = ThreadBudget::new(0);
        for _ in 0..100 {
            assert!(budget.try_acquire());
        }
        let empty = ThreadBudget::new(1);
        empty.release();
        assert_eq!(empty.live(), 0);
    }

    #[test]
    fn test_budget_concurrent_acquire() {
        let budget = Arc::new(ThreadBudget::new(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                thread::spawn(move || (0..5).filter(|_| budget.try_acquire()).count())
            })
            .collect();
        let acquired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(acquired, 10);
        assert_eq!(budget.live(), 10);
    }

    #[test]
    fn test_pool_starts_and_stops() {
        let mut pool = WorkerPool::new(3).unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.scheduler().queued(), 0);
        pool.shutdown();
        assert_eq!(pool.size(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
