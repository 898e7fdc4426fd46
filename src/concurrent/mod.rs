//! Concurrency primitives for the import pipeline

pub mod pool;

pub use pool::{PoolConfig, PoolStats, Worker, WorkerFactory, WorkerPool};
