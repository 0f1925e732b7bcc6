//! Realtime half of the marketplace session layer.
//!
//! One Socket.IO connection per session, opened and closed by the credential
//! store, with the state derived from its events.
//!
//! # Architecture
//!
//! - **ConnectionManager**: the `Disconnected / Connecting / Connected /
//!   Reconnecting` state machine. Listens to the `CredentialStore`, reconnects
//!   with bounded backoff and publishes `ConnectionEvent`s.
//! - **Connector / Link**: the transport seam. `SocketIoConnector` speaks
//!   Socket.IO v5 over a WebSocket; tests plug in channel-backed fakes.
//! - **RoomRegistry**: conversation rooms joined on the current connection
//!   and per-conversation message listeners.
//! - **PresenceTracker**: peers currently online.
//! - **UnreadAggregator**: unread badge count, reconciled against an
//!   authoritative total.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(
//!     store.clone(),
//!     Arc::new(SocketIoConnector::new("http://localhost:5000")),
//!     ConnectionConfig::default(),
//! );
//! let presence = Arc::new(PresenceTracker::new());
//! manager.on(presence.clone());
//! manager.start();
//!
//! if manager.join_conversation(&conversation_id) {
//!     let mut messages = manager.listen(&conversation_id);
//! }
//! ```

pub mod codec;
pub mod manager;
pub mod presence;
pub mod rooms;
pub mod transport;
pub mod unread;

pub use manager::{ConnectionConfig, ConnectionManager};
pub use presence::PresenceTracker;
pub use rooms::RoomRegistry;
pub use transport::{Connector, Link, LinkPeer, SocketIoConnector};
pub use unread::{ApiUnreadSource, UnreadAggregator, UnreadSource};
