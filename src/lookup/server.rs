//! Partitioned lookup server
//!
//! Maps `gml:id`s to database keys. Entries live in one of N partitions,
//! each behind its own lock. When a partition exceeds its share of the cache
//! size, the oldest `page_factor` share of it is written to the spill table
//! and removed from memory. Lookups fall back to the spill table on a miss.

use super::LookupEntry;
use crate::cache::CacheTable;
use crate::config::LookupServerConfig;
use crate::Result;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Partition {
    entries: HashMap<String, (i64, String)>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

impl Partition {
    fn evict(&mut self, count: usize) -> Vec<LookupEntry> {
        let mut evicted = Vec::with_capacity(count);
        while evicted.len() < count {
            let Some(gml_id) = self.order.pop_front() else {
                break;
            };
            if let Some((database_key, object_class)) = self.entries.remove(&gml_id) {
                evicted.push(LookupEntry {
                    gml_id,
                    database_key,
                    object_class,
                });
            }
        }
        evicted
    }
}

/// Lookup server statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub resident: usize,
    pub memory_hits: u64,
    pub spill_hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

impl std::fmt::Display for LookupStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} resident, {} memory hits, {} spill hits, {} misses, {} evicted",
            self.resident, self.memory_hits, self.spill_hits, self.misses, self.evicted
        )
    }
}

pub struct LookupServer {
    name: &'static str,
    partitions: Vec<Mutex<Partition>>,
    /// Resident entries allowed per partition
    capacity: usize,
    /// Entries written out when a partition overflows
    page_size: usize,
    batch_size: usize,
    table: Arc<CacheTable>,
    memory_hits: AtomicU64,
    spill_hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl LookupServer {
    pub fn new(name: &'static str, table: Arc<CacheTable>, config: &LookupServerConfig, batch_size: usize) -> Self {
        let partitions = config.partitions.max(1);
        let capacity = (config.cache_size / partitions).max(1);
        let page_size = ((capacity as f64 * config.page_factor).ceil() as usize).clamp(1, capacity);

        Self {
            name,
            partitions: (0..partitions).map(|_| Mutex::new(Partition::default())).collect(),
            capacity,
            page_size,
            batch_size: batch_size.max(1),
            table,
            memory_hits: AtomicU64::new(0),
            spill_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn partition_for(&self, gml_id: &str) -> &Mutex<Partition> {
        let mut hasher = DefaultHasher::new();
        gml_id.hash(&mut hasher);
        let index = (hasher.finish() % self.partitions.len() as u64) as usize;
        &self.partitions[index]
    }

    /// Register a key. An existing entry for the same `gml:id` is overwritten.
    pub fn put(&self, entry: LookupEntry) -> Result<()> {
        let mut partition = self.partition_for(&entry.gml_id).lock();

        let LookupEntry {
            gml_id,
            database_key,
            object_class,
        } = entry;
        if partition
            .entries
            .insert(gml_id.clone(), (database_key, object_class))
            .is_none()
        {
            partition.order.push_back(gml_id);
        }

        if partition.entries.len() > self.capacity {
            let evicted = partition.evict(self.page_size);
            // written while the partition is locked, so a concurrent lookup
            // finds the entry either in memory or in the spill table
            for batch in evicted.chunks(self.batch_size) {
                self.table.insert_lookup_batch(batch)?;
            }
            self.evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            tracing::trace!("{} lookup server spilled {} entries", self.name, evicted.len());
        }
        Ok(())
    }

    pub fn put_all(&self, entries: impl IntoIterator<Item = LookupEntry>) -> Result<()> {
        for entry in entries {
            self.put(entry)?;
        }
        Ok(())
    }

    /// Resolve a `gml:id`, consulting the spill table on a memory miss.
    pub fn lookup(&self, gml_id: &str) -> Result<Option<LookupEntry>> {
        {
            let partition = self.partition_for(gml_id).lock();
            if let Some((database_key, object_class)) = partition.entries.get(gml_id) {
                self.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(LookupEntry {
                    gml_id: gml_id.to_string(),
                    database_key: *database_key,
                    object_class: object_class.clone(),
                }));
            }
        }

        let found = self.table.find_lookup(gml_id)?;
        if found.is_some() {
            self.spill_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    pub fn resident_count(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().entries.len()).sum()
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            resident: self.resident_count(),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            spill_hits: self.spill_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Release all resident entries.
    pub(crate) fn shutdown(&self) {
        for partition in &self.partitions {
            let mut partition = partition.lock();
            partition.entries = HashMap::new();
            partition.order = VecDeque::new();
        }
    }
}
