//! Run state and the interrupt protocol

use super::splitter::XlinkSplitter;
use crate::cancel::CancellationToken;
use crate::event::{Event, EventDispatcher, InterruptKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-file state machine of the importer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    Idle,
    Parsing,
    XlinkResolving,
    Aborted,
}

impl ImportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportState::Idle => "idle",
            ImportState::Parsing => "parsing",
            ImportState::XlinkResolving => "xlink_resolving",
            ImportState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ImportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared by the orchestrator, the workers and the interrupt event handler.
pub struct RunControl {
    token: CancellationToken,
    state: Mutex<ImportState>,
    splitter: Mutex<Option<Arc<XlinkSplitter>>>,
    reason: Mutex<Option<(InterruptKind, String)>>,
    validation_errors: AtomicU64,
}

impl RunControl {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            state: Mutex::new(ImportState::Idle),
            splitter: Mutex::new(None),
            reason: Mutex::new(None),
            validation_errors: AtomicU64::new(0),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn state(&self) -> ImportState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ImportState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Importer state: {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Raise the interrupt flag. Only the first request has an effect.
    pub fn raise(&self, kind: InterruptKind, message: Option<&str>, level: tracing::Level) -> bool {
        if !self.token.cancel() {
            return false;
        }

        let message = message.unwrap_or(kind.default_message()).to_string();
        match level {
            tracing::Level::ERROR => tracing::error!("{}", message),
            tracing::Level::WARN => tracing::warn!("{}", message),
            tracing::Level::INFO => tracing::info!("{}", message),
            _ => tracing::debug!("{}", message),
        }
        *self.reason.lock() = Some((kind, message));

        if let Some(splitter) = self.splitter.lock().as_ref() {
            tracing::debug!("Stopping XLink splitter ({})", self.state());
            splitter.shutdown();
        }
        true
    }

    /// Raise the interrupt and let subscribers know why.
    pub fn interrupt(&self, events: &EventDispatcher, kind: InterruptKind, message: String, level: tracing::Level) {
        if self.raise(kind, Some(&message), level) {
            events.publish(Event::Interrupt {
                kind,
                message: Some(message),
                level,
            });
        }
    }

    /// Make `splitter` reachable for interrupts; `None` once it has finished.
    pub fn register_splitter(&self, splitter: Option<Arc<XlinkSplitter>>) {
        let mut current = self.splitter.lock();
        if let Some(splitter) = &splitter {
            if self.token.is_cancelled() {
                splitter.shutdown();
            }
        }
        *current = splitter;
    }

    pub fn reason(&self) -> Option<(InterruptKind, String)> {
        self.reason.lock().clone()
    }

    pub fn add_validation_errors(&self, count: u64) {
        self.validation_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn validation_errors(&self) -> u64 {
        self.validation_errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use crate::concurrent::{PoolConfig, Worker, WorkerFactory, WorkerPool};
    use crate::model::UnresolvedReference;

    struct Discard;

    impl Worker<UnresolvedReference> for Discard {
        fn do_work(&mut self, _work: UnresolvedReference) {}
    }

    impl WorkerFactory<UnresolvedReference> for Discard {
        fn create_worker(&self) -> crate::Result<Box<dyn Worker<UnresolvedReference>>> {
            Ok(Box::new(Discard))
        }
    }

    fn splitter() -> Arc<XlinkSplitter> {
        let pool = |name: &str| Arc::new(WorkerPool::new(PoolConfig::new(name, 1, 1), Discard).unwrap());
        Arc::new(XlinkSplitter::new(
            Arc::new(CacheManager::in_memory().unwrap()),
            pool("resolver"),
            pool("registration"),
            10,
        ))
    }

    #[test]
    fn test_first_interrupt_wins() {
        let control = RunControl::new(CancellationToken::new());
        assert!(control.raise(InterruptKind::ParseError, Some("broken"), tracing::Level::ERROR));
        assert!(!control.raise(InterruptKind::UserAbort, None, tracing::Level::INFO));

        let (kind, message) = control.reason().unwrap();
        assert_eq!(kind, InterruptKind::ParseError);
        assert_eq!(message, "broken");
        assert!(control.token().is_cancelled());
    }

    #[test]
    fn test_default_message() {
        let control = RunControl::new(CancellationToken::new());
        control.raise(InterruptKind::UserAbort, None, tracing::Level::INFO);
        assert_eq!(control.reason().unwrap().1, "Import aborted by user");
    }

    #[test]
    fn test_interrupt_stops_registered_splitter() {
        let control = RunControl::new(CancellationToken::new());
        control.set_state(ImportState::XlinkResolving);
        let splitter = splitter();
        control.register_splitter(Some(Arc::clone(&splitter)));
        assert!(!splitter.is_stopped());

        control.raise(InterruptKind::UserAbort, None, tracing::Level::INFO);
        assert!(splitter.is_stopped());
    }

    #[test]
    fn test_splitter_registered_after_interrupt_is_stopped() {
        let control = RunControl::new(CancellationToken::new());
        control.raise(InterruptKind::ParseError, Some("bad input"), tracing::Level::ERROR);

        let splitter = splitter();
        control.register_splitter(Some(Arc::clone(&splitter)));
        assert!(splitter.is_stopped());
    }

    #[test]
    fn test_unregistered_splitter_is_left_alone() {
        let control = RunControl::new(CancellationToken::new());
        let splitter = splitter();
        control.register_splitter(Some(Arc::clone(&splitter)));
        control.register_splitter(None);

        control.raise(InterruptKind::UserAbort, None, tracing::Level::INFO);
        assert!(!splitter.is_stopped());
    }
}
