//! XLink splitter
//!
//! Pages through the spill table of each reference kind and hands every
//! record to the resolver pool exactly once. When a table looks exhausted
//! the splitter waits for the resolver and registration pools to drain,
//! since resolving geometry references can register new ones, and only
//! stops once a fresh read comes back empty.

use crate::cache::{CacheManager, CacheTableKind};
use crate::concurrent::WorkerPool;
use crate::model::{ReferenceKind, UnresolvedReference};
use crate::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitterStats {
    pub dispatched: u64,
    pub batches: u64,
    pub stopped_early: bool,
}

pub struct XlinkSplitter {
    cache: Arc<CacheManager>,
    resolver_pool: Arc<WorkerPool<UnresolvedReference>>,
    registration_pool: Arc<WorkerPool<UnresolvedReference>>,
    batch_size: usize,
    stopped: AtomicBool,
}

impl XlinkSplitter {
    pub fn new(
        cache: Arc<CacheManager>,
        resolver_pool: Arc<WorkerPool<UnresolvedReference>>,
        registration_pool: Arc<WorkerPool<UnresolvedReference>>,
        batch_size: usize,
    ) -> Self {
        Self {
            cache,
            resolver_pool,
            registration_pool,
            batch_size: batch_size.max(1),
            stopped: AtomicBool::new(false),
        }
    }

    /// Ask the splitter to stop after the batch in flight.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Read back and dispatch all persisted references, geometries first.
    pub fn start_query(&self) -> Result<SplitterStats> {
        let mut stats = SplitterStats::default();

        for &kind in ReferenceKind::all() {
            let Some(table) = self.cache.get_table(CacheTableKind::for_references(kind)) else {
                continue;
            };

            let mut after_id = 0;
            loop {
                if self.is_stopped() {
                    stats.stopped_early = true;
                    tracing::info!("XLink resolution stopped after {} reference(s)", stats.dispatched);
                    return Ok(stats);
                }

                let page = table.fetch_page(after_id, self.batch_size)?;
                if page.is_empty() {
                    self.resolver_pool.join();
                    self.registration_pool.join();
                    if table.fetch_page(after_id, 1)?.is_empty() {
                        break;
                    }
                    continue;
                }

                stats.batches += 1;
                for reference in page {
                    after_id = reference.id;
                    self.resolver_pool.submit(reference)?;
                    stats.dispatched += 1;
                }
            }
            tracing::debug!("Dispatched {} reference(s) up to id {}", kind, after_id);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::{PoolConfig, Worker, WorkerFactory};
    use parking_lot::Mutex;

    struct Record(Arc<Mutex<Vec<i64>>>);

    impl Worker<UnresolvedReference> for Record {
        fn do_work(&mut self, work: UnresolvedReference) {
            self.0.lock().push(work.id);
        }
    }

    impl WorkerFactory<UnresolvedReference> for Record {
        fn create_worker(&self) -> Result<Box<dyn Worker<UnresolvedReference>>> {
            Ok(Box::new(Record(Arc::clone(&self.0))))
        }
    }

    fn pool(name: &str, seen: &Arc<Mutex<Vec<i64>>>) -> Arc<WorkerPool<UnresolvedReference>> {
        Arc::new(WorkerPool::new(PoolConfig::new(name, 1, 2), Record(Arc::clone(seen))).unwrap())
    }

    #[test]
    fn test_every_record_dispatched_once() {
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let table = cache.create_table(CacheTableKind::XlinkGeometry).unwrap();
        let references: Vec<_> = (1..=25).map(|i| UnresolvedReference::geometry(i, format!("p{}", i))).collect();
        table.insert_references(&references).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let resolver = pool("resolver", &seen);
        let registration = pool("registration", &Arc::new(Mutex::new(Vec::new())));
        let splitter = XlinkSplitter::new(Arc::clone(&cache), Arc::clone(&resolver), registration, 10);

        let stats = splitter.start_query().unwrap();
        resolver.shutdown_and_wait().unwrap();

        assert_eq!(stats.dispatched, 25);
        assert_eq!(stats.batches, 3);
        let mut ids = seen.lock().clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 25);
    }

    #[test]
    fn test_stopped_splitter_reads_nothing() {
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let table = cache.create_table(CacheTableKind::XlinkFeature).unwrap();
        table.insert_references(&[UnresolvedReference::feature(1, "b1")]).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let splitter = XlinkSplitter::new(cache, pool("resolver", &seen), pool("registration", &seen), 10);
        splitter.shutdown();

        let stats = splitter.start_query().unwrap();
        assert!(stats.stopped_early);
        assert_eq!(stats.dispatched, 0);
    }
}
