//! XLink registration stage: buffers unresolved references and writes them
//! to the spill table of their kind.

use crate::cache::{CacheManager, CacheTableKind};
use crate::concurrent::{Worker, WorkerFactory};
use crate::event::{CounterKind, Event, EventDispatcher};
use crate::model::{ReferenceKind, UnresolvedReference};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub struct XlinkRegistrationWorkerFactory {
    cache: Arc<CacheManager>,
    events: Arc<EventDispatcher>,
    batch_size: usize,
}

impl XlinkRegistrationWorkerFactory {
    pub fn new(cache: Arc<CacheManager>, events: Arc<EventDispatcher>, batch_size: usize) -> Self {
        Self {
            cache,
            events,
            batch_size: batch_size.max(1),
        }
    }
}

impl WorkerFactory<UnresolvedReference> for XlinkRegistrationWorkerFactory {
    fn create_worker(&self) -> Result<Box<dyn Worker<UnresolvedReference>>> {
        Ok(Box::new(XlinkRegistrationWorker {
            cache: Arc::clone(&self.cache),
            events: Arc::clone(&self.events),
            batch_size: self.batch_size,
            buffers: HashMap::new(),
        }))
    }
}

pub struct XlinkRegistrationWorker {
    cache: Arc<CacheManager>,
    events: Arc<EventDispatcher>,
    batch_size: usize,
    buffers: HashMap<ReferenceKind, Vec<UnresolvedReference>>,
}

impl XlinkRegistrationWorker {
    fn write(&mut self, kind: ReferenceKind) {
        let Some(buffer) = self.buffers.get_mut(&kind) else {
            return;
        };
        if buffer.is_empty() {
            return;
        }
        let references = std::mem::take(buffer);

        let written = self
            .cache
            .create_table(CacheTableKind::for_references(kind))
            .and_then(|table| table.insert_references(&references));

        match written {
            Ok(count) => {
                tracing::trace!("Registered {} {} reference(s)", count, kind);
                self.events.publish(Event::counter(CounterKind::XlinkRegistered, count as u64));
            }
            Err(e) => tracing::error!("Failed to register {} {} reference(s): {}", references.len(), kind, e),
        }
    }
}

impl Worker<UnresolvedReference> for XlinkRegistrationWorker {
    fn do_work(&mut self, reference: UnresolvedReference) {
        let kind = reference.kind;
        let buffer = self.buffers.entry(kind).or_default();
        buffer.push(reference);
        if buffer.len() >= self.batch_size {
            self.write(kind);
        }
    }

    fn flush(&mut self) {
        for &kind in ReferenceKind::all() {
            self.write(kind);
        }
    }

    fn shutdown(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_land_in_their_kind_table() {
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let events = Arc::new(EventDispatcher::new().unwrap());
        let factory = XlinkRegistrationWorkerFactory::new(Arc::clone(&cache), events, 2);
        let mut worker = factory.create_worker().unwrap();

        worker.do_work(UnresolvedReference::geometry(1, "p1"));
        worker.do_work(UnresolvedReference::geometry(2, "p2"));
        // batch of two written without a flush
        let geometry = cache.get_table(CacheTableKind::XlinkGeometry).unwrap();
        assert_eq!(geometry.count().unwrap(), 2);

        worker.do_work(UnresolvedReference::feature(3, "b1"));
        assert!(cache.get_table(CacheTableKind::XlinkFeature).is_none());
        worker.flush();
        assert_eq!(cache.get_table(CacheTableKind::XlinkFeature).unwrap().count().unwrap(), 1);
    }
}
