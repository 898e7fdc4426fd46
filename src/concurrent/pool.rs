//! Bounded worker pool
//!
//! A pool owns a bounded crossbeam channel and between `min_threads` and
//! `max_threads` OS threads. Each thread runs its own [`Worker`] built by the
//! pool's [`WorkerFactory`], so per-thread resources such as a database
//! connection are never shared.
//!
//! Lifecycle:
//! - `prestart` spins up the minimum number of threads
//! - `submit` blocks while the queue is full
//! - `join` waits until every submitted item is processed and flushed
//! - `shutdown_and_wait` closes the queue, drains it and joins all threads
//! - `shutdown_now` discards queued items and joins all threads

use crate::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handler for the items of one pool, one instance per thread.
pub trait Worker<T>: Send {
    /// Process one item. Failures are handled (logged) by the worker itself.
    fn do_work(&mut self, work: T);

    /// Called whenever the queue runs dry; batched writes must be persisted here.
    fn flush(&mut self) {}

    /// Called once before the thread exits.
    fn shutdown(&mut self) {}
}

/// Builds one [`Worker`] per pool thread.
pub trait WorkerFactory<T>: Send + Sync {
    fn create_worker(&self) -> Result<Box<dyn Worker<T>>>;
}

/// Sizing of a worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix, also used in log messages
    pub name: String,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Capacity of the bounded queue before `submit` blocks
    pub queue_capacity: usize,
    /// Idle time after which threads above the minimum exit
    pub keep_alive: Duration,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, min_threads: usize, max_threads: usize) -> Self {
        Self {
            name: name.into(),
            min_threads,
            max_threads,
            queue_capacity: max_threads.max(1) * 2,
            keep_alive: Duration::from_secs(60),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(Error::Config(format!("pool '{}': max_threads must be at least 1", self.name)));
        }
        if self.min_threads > self.max_threads {
            return Err(Error::Config(format!(
                "pool '{}': min_threads ({}) exceeds max_threads ({})",
                self.name, self.min_threads, self.max_threads
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(format!("pool '{}': queue capacity must be at least 1", self.name)));
        }
        Ok(())
    }
}

/// Pool counters
#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    discarded: AtomicU64,
    blocked_submits: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time copy of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub discarded: u64,
    /// Number of `submit` calls that found the queue full and had to wait
    pub blocked_submits: u64,
    pub panicked: u64,
}

struct PoolState {
    workers: usize,
    idle: usize,
    next_id: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared<T> {
    name: String,
    min_threads: usize,
    keep_alive: Duration,
    receiver: Receiver<T>,
    state: Mutex<PoolState>,
    /// Items submitted but not yet processed and flushed
    pending: Mutex<usize>,
    drained: Condvar,
    discard: AtomicBool,
    counters: PoolCounters,
}

impl<T> Shared<T> {
    fn settle(&self, count: usize) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(count);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

/// A bounded, elastic thread pool processing items of type `T`.
pub struct WorkerPool<T: Send + 'static> {
    config: PoolConfig,
    factory: Box<dyn WorkerFactory<T>>,
    sender: Mutex<Option<Sender<T>>>,
    shared: Arc<Shared<T>>,
    terminated: AtomicBool,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(config: PoolConfig, factory: impl WorkerFactory<T> + 'static) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = channel::bounded(config.queue_capacity);

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            min_threads: config.min_threads,
            keep_alive: config.keep_alive,
            receiver,
            state: Mutex::new(PoolState {
                workers: 0,
                idle: 0,
                next_id: 0,
                handles: Vec::new(),
            }),
            pending: Mutex::new(0),
            drained: Condvar::new(),
            discard: AtomicBool::new(false),
            counters: PoolCounters::default(),
        });

        Ok(Self {
            config,
            factory: Box::new(factory),
            sender: Mutex::new(Some(sender)),
            shared,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Start the minimum number of threads. Returns how many were started.
    pub fn prestart(&self) -> Result<usize> {
        let mut state = self.shared.state.lock();
        let mut started = 0;
        while state.workers < self.config.min_threads {
            self.spawn_worker(&mut state)?;
            started += 1;
        }
        Ok(started)
    }

    /// Enqueue one item, blocking while the queue is full.
    pub fn submit(&self, work: T) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| Error::PoolShutdown(self.config.name.clone()))?;

        self.ensure_worker()?;

        *self.shared.pending.lock() += 1;
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let sent = match sender.try_send(work) {
            Ok(()) => true,
            Err(TrySendError::Full(work)) => {
                self.shared.counters.blocked_submits.fetch_add(1, Ordering::Relaxed);
                sender.send(work).is_ok()
            }
            Err(TrySendError::Disconnected(_)) => false,
        };

        if !sent {
            self.shared.settle(1);
            return Err(Error::PoolShutdown(self.config.name.clone()));
        }
        Ok(())
    }

    /// Wait until all submitted items are processed and flushed.
    /// The pool keeps accepting work.
    pub fn join(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.drained.wait(&mut pending);
        }
    }

    /// Stop accepting work, process everything queued and join all threads.
    pub fn shutdown_and_wait(&self) -> Result<()> {
        drop(self.sender.lock().take());
        self.join_threads()
    }

    /// Stop accepting work, discard queued items and join all threads.
    /// Items already being processed run to completion. Returns the number
    /// of discarded items.
    pub fn shutdown_now(&self) -> usize {
        self.shared.discard.store(true, Ordering::Release);
        drop(self.sender.lock().take());

        let mut discarded = 0;
        while self.shared.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        self.shared.counters.discarded.fetch_add(discarded as u64, Ordering::Relaxed);
        self.shared.settle(discarded);

        if let Err(e) = self.join_threads() {
            tracing::error!("{}", e);
        }
        if discarded > 0 {
            tracing::debug!("Pool '{}' discarded {} queued item(s)", self.config.name, discarded);
        }
        discarded
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers
    }

    pub fn queue_len(&self) -> usize {
        self.shared.receiver.len()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            blocked_submits: c.blocked_submits.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }

    fn ensure_worker(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.idle > 0 || state.workers >= self.config.max_threads {
            return Ok(());
        }

        match self.spawn_worker(&mut state) {
            Ok(()) => Ok(()),
            // keep going with the threads we already have
            Err(e) if state.workers > 0 => {
                tracing::warn!("Pool '{}' failed to grow: {}", self.config.name, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_worker(&self, state: &mut PoolState) -> Result<()> {
        let worker = self.factory.create_worker()?;
        let id = state.next_id;
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.config.name, id))
            .spawn(move || run_worker(shared, worker))?;

        state.next_id += 1;
        state.workers += 1;
        state.handles.push(handle);
        tracing::debug!("Pool '{}' started worker {} ({} running)", self.config.name, id, state.workers);
        Ok(())
    }

    fn join_threads(&self) -> Result<()> {
        let mut lost = 0;
        loop {
            let handles = std::mem::take(&mut self.shared.state.lock().handles);
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    lost += 1;
                }
            }
        }
        self.terminated.store(true, Ordering::Release);

        if lost > 0 {
            return Err(Error::WorkerPanicked {
                pool: self.config.name.clone(),
                count: lost,
            });
        }
        Ok(())
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.shutdown_now();
        }
    }
}

fn run_worker<T: Send + 'static>(shared: Arc<Shared<T>>, mut worker: Box<dyn Worker<T>>) {
    let mut unsettled = 0usize;

    loop {
        let work = match shared.receiver.try_recv() {
            Ok(work) => work,
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                if unsettled > 0 {
                    flush_worker(&shared, worker.as_mut());
                    shared.settle(unsettled);
                    unsettled = 0;
                }

                shared.state.lock().idle += 1;
                let received = shared.receiver.recv_timeout(shared.keep_alive);
                let mut state = shared.state.lock();
                state.idle -= 1;

                match received {
                    Ok(work) => work,
                    Err(RecvTimeoutError::Timeout) => {
                        // never reclaim the last thread, queued items would strand
                        if state.workers > shared.min_threads.max(1) && shared.receiver.is_empty() {
                            state.workers -= 1;
                            drop(state);
                            tracing::debug!("Pool '{}' reclaimed an idle worker", shared.name);
                            shutdown_worker(&shared, worker.as_mut());
                            return;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        unsettled += 1;
        if shared.discard.load(Ordering::Acquire) {
            shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.do_work(work)));
        match outcome {
            Ok(()) => {
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Pool '{}': worker panicked while processing an item", shared.name);
            }
        }
    }

    if unsettled > 0 {
        flush_worker(&shared, worker.as_mut());
        shared.settle(unsettled);
    }
    shutdown_worker(&shared, worker.as_mut());
    shared.state.lock().workers -= 1;
}

fn flush_worker<T>(shared: &Shared<T>, worker: &mut dyn Worker<T>) {
    if panic::catch_unwind(AssertUnwindSafe(|| worker.flush())).is_err() {
        shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
        tracing::error!("Pool '{}': worker panicked while flushing", shared.name);
    }
}

fn shutdown_worker<T>(shared: &Shared<T>, worker: &mut dyn Worker<T>) {
    if panic::catch_unwind(AssertUnwindSafe(|| worker.shutdown())).is_err() {
        tracing::error!("Pool '{}': worker panicked during shutdown", shared.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Records processed items; `flushed` only grows on flush.
    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        buffer: Vec<u32>,
        delay: Duration,
    }

    impl Worker<u32> for Recorder {
        fn do_work(&mut self, work: u32) {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.buffer.push(work);
        }

        fn flush(&mut self) {
            self.seen.lock().append(&mut self.buffer);
        }
    }

    struct RecorderFactory {
        seen: Arc<Mutex<Vec<u32>>>,
        delay: Duration,
        created: Arc<AtomicUsize>,
    }

    impl WorkerFactory<u32> for RecorderFactory {
        fn create_worker(&self) -> Result<Box<dyn Worker<u32>>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Recorder {
                seen: Arc::clone(&self.seen),
                buffer: Vec::new(),
                delay: self.delay,
            }))
        }
    }

    fn pool(min: usize, max: usize, capacity: usize, delay: Duration) -> (WorkerPool<u32>, Arc<Mutex<Vec<u32>>>, Arc<AtomicUsize>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::new(AtomicUsize::new(0));
        let factory = RecorderFactory {
            seen: Arc::clone(&seen),
            delay,
            created: Arc::clone(&created),
        };
        let config = PoolConfig::new("test", min, max).with_queue_capacity(capacity);
        (WorkerPool::new(config, factory).unwrap(), seen, created)
    }

    #[test]
    fn test_prestart_then_shutdown_on_empty_pool() {
        for (min, max) in [(0, 1), (1, 1), (2, 4), (4, 4)] {
            let (pool, _, created) = pool(min, max, 4, Duration::ZERO);
            assert_eq!(pool.prestart().unwrap(), min);
            assert_eq!(created.load(Ordering::SeqCst), min);
            pool.shutdown_and_wait().unwrap();
            assert!(pool.is_terminated());
            assert_eq!(pool.worker_count(), 0);
        }
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = RecorderFactory { seen, delay: Duration::ZERO, created: Arc::new(AtomicUsize::new(0)) };
        assert!(matches!(
            WorkerPool::new(PoolConfig::new("bad", 3, 2), factory),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_backpressure_and_full_drain() {
        let (pool, seen, _) = pool(1, 1, 2, Duration::from_millis(5));
        pool.prestart().unwrap();

        let start = Instant::now();
        for i in 0..20 {
            pool.submit(i).unwrap();
        }
        // 20 items at 5ms through one thread with room for 2 queued
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(pool.stats().blocked_submits >= 1);

        pool.shutdown_and_wait().unwrap();
        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert_eq!(pool.stats().completed, 20);
    }

    #[test]
    fn test_join_waits_for_flush_and_keeps_pool_open() {
        let (pool, seen, _) = pool(2, 4, 8, Duration::from_millis(1));
        pool.prestart().unwrap();

        for i in 0..30 {
            pool.submit(i).unwrap();
        }
        pool.join();
        assert_eq!(seen.lock().len(), 30);

        pool.submit(30).unwrap();
        pool.shutdown_and_wait().unwrap();
        assert_eq!(seen.lock().len(), 31);
    }

    #[test]
    fn test_grows_up_to_max_threads() {
        let (pool, _, created) = pool(1, 3, 16, Duration::from_millis(10));
        pool.prestart().unwrap();
        for i in 0..12 {
            pool.submit(i).unwrap();
        }
        assert!(created.load(Ordering::SeqCst) <= 3);
        assert!(pool.worker_count() <= 3);
        pool.shutdown_and_wait().unwrap();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let (pool, _, _) = pool(1, 1, 2, Duration::ZERO);
        pool.shutdown_and_wait().unwrap();
        assert!(matches!(pool.submit(1), Err(Error::PoolShutdown(_))));
    }

    #[test]
    fn test_shutdown_now_discards_queued_work() {
        let (pool, seen, _) = pool(1, 1, 64, Duration::from_millis(20));
        pool.prestart().unwrap();
        for i in 0..40 {
            pool.submit(i).unwrap();
        }

        let discarded = pool.shutdown_now();
        assert!(pool.is_terminated());
        assert!(discarded > 0);
        assert!(seen.lock().len() < 40);
    }

    #[test]
    fn test_panicking_item_does_not_kill_pool() {
        struct Flaky;
        impl Worker<u32> for Flaky {
            fn do_work(&mut self, work: u32) {
                if work == 3 {
                    panic!("bad item");
                }
            }
        }
        struct FlakyFactory;
        impl WorkerFactory<u32> for FlakyFactory {
            fn create_worker(&self) -> Result<Box<dyn Worker<u32>>> {
                Ok(Box::new(Flaky))
            }
        }

        let pool = WorkerPool::new(PoolConfig::new("flaky", 1, 1), FlakyFactory).unwrap();
        for i in 0..6 {
            pool.submit(i).unwrap();
        }
        pool.shutdown_and_wait().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 5);
    }

    #[test]
    fn test_idle_threads_above_minimum_are_reclaimed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = RecorderFactory {
            seen,
            delay: Duration::from_millis(5),
            created: Arc::new(AtomicUsize::new(0)),
        };
        let config = PoolConfig::new("elastic", 1, 4)
            .with_queue_capacity(16)
            .with_keep_alive(Duration::from_millis(20));
        let pool = WorkerPool::new(config, factory).unwrap();

        for i in 0..16 {
            pool.submit(i).unwrap();
        }
        pool.join();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown_and_wait().unwrap();
    }
}
