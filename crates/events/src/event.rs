//! Connection lifecycle events.
//!
//! Transports report `closed` and `error` conditions through an [`EventSink`]
//! handed to them when a connection is opened. The sink stamps each event
//! with the connection generation that produced it, so a late event from a
//! connection that was already replaced cannot tear down its successor.
//!
//! A sink stays silent until its channel has finished setup: a channel torn
//! down by a failed connect attempt was never handed to anyone, so its close
//! is not reported.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Which layer of the broker session raised the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Connection,
    Channel,
}

impl core::fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EventOrigin::Connection => f.write_str("connection"),
            EventOrigin::Channel => f.write_str("channel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Closed {
        origin: EventOrigin,
        generation: u64,
        reason: String,
    },
    Error {
        origin: EventOrigin,
        generation: u64,
        message: String,
    },
}

impl ConnectionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ConnectionEvent::Closed { generation, .. } | ConnectionEvent::Error { generation, .. } => {
                *generation
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionEvent::Closed { .. })
    }
}

/// Callbacks for components that react to connection loss.
///
/// Implementations must return quickly; heavy work (such as a restart) is
/// scheduled onto its own task.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// `generation` identifies the channel that closed.
    fn on_closed(&self, origin: EventOrigin, generation: u64, reason: &str);

    fn on_error(&self, _origin: EventOrigin, _message: &str) {}
}

type ClosedHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Reporting handle given to a transport for one connection generation.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    tx: broadcast::Sender<ConnectionEvent>,
    on_closed: Option<ClosedHook>,
    live: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn new(
        generation: u64,
        tx: broadcast::Sender<ConnectionEvent>,
        on_closed: ClosedHook,
    ) -> Self {
        Self {
            generation,
            tx,
            on_closed: Some(on_closed),
            live: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start reporting events; called once the channel is in service.
    pub(crate) fn go_live(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// A sink that is not attached to any [`BrokerConnection`](crate::BrokerConnection).
    ///
    /// Used when driving a transport directly (tests, tooling).
    pub fn detached() -> (Self, broadcast::Receiver<ConnectionEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (
            Self {
                generation: 0,
                tx,
                on_closed: None,
                live: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the connection or channel is gone.
    ///
    /// The owning connection forgets its cached channel before observers are
    /// notified, so a restart triggered by this event always reconnects.
    pub fn closed(&self, origin: EventOrigin, reason: impl Into<String>) {
        if !self.is_live() {
            return;
        }
        if let Some(hook) = &self.on_closed {
            hook(self.generation);
        }
        // No receivers is fine: nobody is watching this connection.
        let _ = self.tx.send(ConnectionEvent::Closed {
            origin,
            generation: self.generation,
            reason: reason.into(),
        });
    }

    /// Report a non-fatal error (the session may still be usable).
    pub fn error(&self, origin: EventOrigin, message: impl Into<String>) {
        if !self.is_live() {
            return;
        }
        let _ = self.tx.send(ConnectionEvent::Error {
            origin,
            generation: self.generation,
            message: message.into(),
        });
    }
}

impl core::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSink")
            .field("generation", &self.generation)
            .field("attached", &self.on_closed.is_some())
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn closed_runs_hook_before_broadcasting() {
        let seen = Arc::new(AtomicU64::new(0));
        let hook_seen = seen.clone();
        let (tx, mut rx) = broadcast::channel(4);
        let sink = EventSink::new(
            7,
            tx,
            Arc::new(move |generation| hook_seen.store(generation, Ordering::SeqCst)),
        );

        sink.go_live();
        sink.closed(EventOrigin::Channel, "peer reset");

        assert_eq!(seen.load(Ordering::SeqCst), 7);
        let event = rx.try_recv().unwrap();
        assert!(event.is_closed());
        assert_eq!(event.generation(), 7);
    }

    #[test]
    fn errors_do_not_run_the_close_hook() {
        let seen = Arc::new(AtomicU64::new(0));
        let hook_seen = seen.clone();
        let (tx, mut rx) = broadcast::channel(4);
        let sink = EventSink::new(
            3,
            tx,
            Arc::new(move |generation| hook_seen.store(generation, Ordering::SeqCst)),
        );

        sink.go_live();
        sink.error(EventOrigin::Connection, "heartbeat missed");

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(matches!(rx.try_recv().unwrap(), ConnectionEvent::Error { .. }));
    }

    #[test]
    fn sink_is_silent_until_live() {
        let seen = Arc::new(AtomicU64::new(0));
        let hook_seen = seen.clone();
        let (tx, mut rx) = broadcast::channel(4);
        let sink = EventSink::new(
            5,
            tx,
            Arc::new(move |generation| hook_seen.store(generation, Ordering::SeqCst)),
        );

        sink.error(EventOrigin::Channel, "LOADING dataset");
        sink.closed(EventOrigin::Channel, "closed by client");

        assert!(!sink.is_live());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn detached_sink_reports_immediately() {
        let (sink, mut rx) = EventSink::detached();
        sink.closed(EventOrigin::Connection, "gone");
        assert!(rx.try_recv().unwrap().is_closed());
    }
}
