//! Typed realtime event model for the marketplace session layer.
//!
//! This crate defines everything that flows over, or is derived from, the
//! realtime connection, without depending on the transport or the auth layer.
//!
//! # Architecture
//!
//! - **ServerEvent / ClientEvent**: tagged unions for the named events the
//!   server pushes and the client emits, decoded once at the transport edge so
//!   consumers match exhaustively instead of comparing event names.
//! - **ConnectionEvent**: what the connection manager publishes: state
//!   transitions, decoded server events and connectivity errors.
//! - **ConnectionHandler**: trait for in-process consumers (presence, unread
//!   count, conversation rooms).
//! - **EventPublisher**: dispatches connection events to registered handlers.

use std::fmt;
use std::sync::{Arc, RwLock};

pub mod message;

pub use message::{
    ChatMessage, ClientEvent, ConversationId, EventType, OutgoingMessage, ServerEvent, UserId,
};

/// Lifecycle of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// A connectivity failure reported to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
    /// True when the manager has stopped retrying and is now `Disconnected`.
    pub terminal: bool,
}

/// Everything the connection manager publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection moved from `previous` to `state`.
    StateChanged {
        previous: ConnectionState,
        state: ConnectionState,
    },
    /// A decoded event pushed by the server.
    Server(ServerEvent),
    /// A failed attempt or, when `terminal`, the end of reconnection.
    Error(ConnectionError),
}

impl ConnectionEvent {
    /// True for the transition into `Connected` that follows a dropped or
    /// failed connection, as opposed to the first connect of a session.
    pub fn is_reconnect(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::StateChanged {
                previous: ConnectionState::Reconnecting,
                state: ConnectionState::Connected,
            }
        )
    }
}

/// Trait for consuming connection events synchronously.
///
/// Handlers run on the task that produced the event, in registration order,
/// while the connection manager's lifecycle is locked: a handler observes
/// every transition in order. It may read the state and emit, but must not
/// connect, disconnect or register handlers from inside `handle`.
pub trait ConnectionHandler: Send + Sync {
    fn handle(&self, event: &ConnectionEvent);
}

/// Publishes connection events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone, Default)]
pub struct EventPublisher {
    handlers: Arc<RwLock<Vec<Arc<dyn ConnectionHandler>>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler and return the publisher for chaining.
    pub fn with_handler(self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.add_handler(handler);
        self
    }

    /// Register a handler on a shared publisher.
    pub fn add_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    pub fn handler_count(&self) -> usize {
        match self.handlers.read() {
            Ok(handlers) => handlers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Publish an event to all registered handlers.
    pub fn publish(&self, event: &ConnectionEvent) {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handler in handlers.iter() {
            handler.handle(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ConnectionEvent>>,
    }

    impl ConnectionHandler for Recorder {
        fn handle(&self, event: &ConnectionEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_publish_reaches_every_handler_in_order() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let publisher = EventPublisher::new()
            .with_handler(first.clone())
            .with_handler(second.clone());

        let event = ConnectionEvent::Server(ServerEvent::PeerOnline("u1".to_string()));
        publisher.publish(&event);

        assert_eq!(publisher.handler_count(), 2);
        assert_eq!(first.seen.lock().unwrap().as_slice(), &[event.clone()]);
        assert_eq!(second.seen.lock().unwrap().as_slice(), &[event]);
    }

    #[test]
    fn test_is_reconnect_only_after_reconnecting() {
        let first_connect = ConnectionEvent::StateChanged {
            previous: ConnectionState::Connecting,
            state: ConnectionState::Connected,
        };
        let reconnect = ConnectionEvent::StateChanged {
            previous: ConnectionState::Reconnecting,
            state: ConnectionState::Connected,
        };

        assert!(!first_connect.is_reconnect());
        assert!(reconnect.is_reconnect());
    }

    #[test]
    fn test_default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
