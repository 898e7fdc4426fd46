//! Typed event channel
//!
//! Pipeline components publish [`Event`]s fire-and-forget. A single
//! dispatcher thread delivers them, in publish order, to every subscribed
//! [`EventHandler`]. [`EventDispatcher::flush`] blocks until everything
//! published before the call has been delivered.

use crate::model::{FeatureKind, GeometryKind};
use crate::Result;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterKind {
    /// Input files started
    File,
    /// References written to spill tables
    XlinkRegistered,
    XlinkResolved,
}

impl CounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::File => "file",
            CounterKind::XlinkRegistered => "xlink_registered",
            CounterKind::XlinkResolved => "xlink_resolved",
        }
    }
}

/// Why a run was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptKind {
    UserAbort,
    ParseError,
    ValidationError,
}

impl InterruptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptKind::UserAbort => "user_abort",
            InterruptKind::ParseError => "parse_error",
            InterruptKind::ValidationError => "validation_error",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            InterruptKind::UserAbort => "Import aborted by user",
            InterruptKind::ParseError => "A fatal error occurred while parsing the input",
            InterruptKind::ValidationError => "Aborting import after a validation error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Features imported since the last counter event, by kind
    FeatureCounter(HashMap<FeatureKind, u64>),
    /// Geometries imported since the last counter event, by kind
    GeometryCounter(HashMap<GeometryKind, u64>),
    Counter {
        kind: CounterKind,
        value: u64,
    },
    StatusTitle(String),
    StatusMessage(String),
    Interrupt {
        kind: InterruptKind,
        message: Option<String>,
        level: tracing::Level,
    },
}

impl Event {
    pub fn counter(kind: CounterKind, value: u64) -> Self {
        Event::Counter { kind, value }
    }

    pub fn interrupt(kind: InterruptKind, message: impl Into<String>, level: tracing::Level) -> Self {
        Event::Interrupt {
            kind,
            message: Some(message.into()),
            level,
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

/// Token returned by [`EventDispatcher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handlers = Arc<RwLock<Vec<(SubscriptionId, Arc<dyn EventHandler>)>>>;

enum Envelope {
    Event(Event),
    Flush(Sender<()>),
    Stop,
}

pub struct EventDispatcher {
    sender: Sender<Envelope>,
    handlers: Handlers,
    next_id: AtomicU64,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let handlers: Handlers = Arc::new(RwLock::new(Vec::new()));

        let thread_handlers = Arc::clone(&handlers);
        let handle = thread::Builder::new()
            .name("event-dispatcher".into())
            .spawn(move || dispatch_loop(receiver, thread_handlers))?;

        Ok(Self {
            sender,
            handlers,
            next_id: AtomicU64::new(0),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn publish(&self, event: Event) {
        if self.sender.send(Envelope::Event(event)).is_err() {
            tracing::debug!("Event dispatcher stopped, dropping event");
        }
    }

    /// Block until every event published so far has been delivered.
    ///
    /// A no-op when called from a handler, which runs on the dispatcher thread.
    pub fn flush(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        let (ack, done) = channel::bounded(1);
        if self.sender.send(Envelope::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Deliver pending events and stop the dispatcher thread.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.sender.send(Envelope::Stop);
        if thread::current().id() != self.thread_id && handle.join().is_err() {
            tracing::error!("Event dispatcher thread panicked");
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(receiver: Receiver<Envelope>, handlers: Handlers) {
    for envelope in receiver {
        match envelope {
            Envelope::Event(event) => {
                let current = handlers.read().clone();
                for (_, handler) in current {
                    if panic::catch_unwind(AssertUnwindSafe(|| handler.handle_event(&event))).is_err() {
                        tracing::error!("Event handler panicked while handling {:?}", event);
                    }
                }
            }
            Envelope::Flush(ack) => {
                let _ = ack.send(());
            }
            Envelope::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_flush_waits_for_delivery() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.subscribe(Arc::new(move |event: &Event| {
            if let Event::Counter { value, .. } = event {
                std::thread::sleep(std::time::Duration::from_millis(1));
                counter.fetch_add(*value as usize, Ordering::SeqCst);
            }
        }));

        for _ in 0..50 {
            dispatcher.publish(Event::counter(CounterKind::File, 2));
        }
        dispatcher.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = dispatcher.subscribe(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.publish(Event::StatusTitle("first".into()));
        dispatcher.flush();
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.publish(Event::StatusTitle("second".into()));
        dispatcher.flush();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.subscribe(Arc::new(|_: &Event| panic!("handler failure")));
        dispatcher.subscribe(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.publish(Event::StatusMessage("x".into()));
        dispatcher.publish(Event::StatusMessage("y".into()));
        dispatcher.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_publish_after_shutdown_is_ignored() {
        let dispatcher = EventDispatcher::new().unwrap();
        dispatcher.shutdown();
        dispatcher.shutdown();
        dispatcher.publish(Event::StatusTitle("late".into()));
        dispatcher.flush();
    }
}
