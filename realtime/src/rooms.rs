use dashmap::{DashMap, DashSet};
use events::{
    ChatMessage, ConnectionEvent, ConnectionHandler, ConnectionState, ConversationId, ServerEvent,
};
use log::*;
use tokio::sync::broadcast;

const ROOM_CHANNEL_CAPACITY: usize = 64;

/// Conversation room membership and per-conversation message routing.
///
/// Membership lasts for one connection: it is dropped when the connection
/// goes down, because the server forgets it too. Views re-issue their joins
/// after reconnecting. Listeners survive reconnects.
pub struct RoomRegistry {
    /// Rooms joined on the current connection
    joined: DashSet<ConversationId>,

    /// Message listeners by conversation
    listeners: DashMap<ConversationId, broadcast::Sender<ChatMessage>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            joined: DashSet::new(),
            listeners: DashMap::new(),
        }
    }

    pub fn mark_joined(&self, conversation_id: &str) {
        self.joined.insert(conversation_id.to_string());
    }

    pub fn mark_left(&self, conversation_id: &str) {
        self.joined.remove(conversation_id);
    }

    pub fn is_joined(&self, conversation_id: &str) -> bool {
        self.joined.contains(conversation_id)
    }

    pub fn joined(&self) -> Vec<ConversationId> {
        let mut rooms: Vec<ConversationId> =
            self.joined.iter().map(|id| id.key().clone()).collect();
        rooms.sort();
        rooms
    }

    /// Receive messages pushed for `conversation_id`.
    pub fn listen(&self, conversation_id: &str) -> broadcast::Receiver<ChatMessage> {
        self.listeners
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver `message` to its conversation's listeners. Returns how many
    /// received it.
    pub fn route(&self, message: &ChatMessage) -> usize {
        let delivered = match self.listeners.get(&message.conversation_id) {
            Some(sender) => sender.send(message.clone()).unwrap_or(0),
            None => return 0,
        };

        // Clean up rooms nobody listens to any more
        if delivered == 0 {
            self.listeners.remove_if(&message.conversation_id, |_, sender| {
                sender.receiver_count() == 0
            });
        }
        delivered
    }

    pub fn clear_joined(&self) {
        if !self.joined.is_empty() {
            debug!("Dropping membership of {} room(s)", self.joined.len());
            self.joined.clear();
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHandler for RoomRegistry {
    fn handle(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Server(ServerEvent::NewMessage(message)) => {
                let delivered = self.route(message);
                trace!(
                    "Routed message for conversation {} to {} listener(s)",
                    message.conversation_id,
                    delivered
                );
            }
            ConnectionEvent::StateChanged {
                state: ConnectionState::Disconnected | ConnectionState::Reconnecting,
                ..
            } => self.clear_joined(),
            _ => {}
        }
    }
}
