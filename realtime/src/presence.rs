use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use events::{ConnectionEvent, ConnectionHandler, ConnectionState, ServerEvent, UserId};
use log::*;

/// Set of peers currently known to be online.
///
/// Fed only by connection events. The set is emptied as soon as the
/// connection is lost, since presence from a dead connection cannot be
/// trusted; the server's `users:online` list repopulates it after reconnecting.
#[derive(Default)]
pub struct PresenceTracker {
    online: Mutex<HashSet<UserId>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<UserId>> {
        match self.online.lock() {
            Ok(online) => online,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.lock().contains(user_id)
    }

    /// Online peers, sorted.
    pub fn online(&self) -> Vec<UserId> {
        let mut peers: Vec<UserId> = self.lock().iter().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn replace(&self, peers: &[UserId]) {
        let mut online = self.lock();
        online.clear();
        online.extend(peers.iter().cloned());
        debug!("Presence list replaced ({} online)", online.len());
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

impl ConnectionHandler for PresenceTracker {
    fn handle(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Server(ServerEvent::PeerList(peers)) => self.replace(peers),
            ConnectionEvent::Server(ServerEvent::PeerOnline(peer)) => {
                self.lock().insert(peer.clone());
            }
            ConnectionEvent::Server(ServerEvent::PeerOffline(peer)) => {
                self.lock().remove(peer);
            }
            ConnectionEvent::StateChanged {
                state: ConnectionState::Disconnected | ConnectionState::Reconnecting,
                ..
            } => self.clear(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(event: ServerEvent) -> ConnectionEvent {
        ConnectionEvent::Server(event)
    }

    fn transition(previous: ConnectionState, state: ConnectionState) -> ConnectionEvent {
        ConnectionEvent::StateChanged { previous, state }
    }

    #[test]
    fn test_online_and_offline() {
        let presence = PresenceTracker::new();
        presence.handle(&server(ServerEvent::PeerOnline("u2".to_string())));
        presence.handle(&server(ServerEvent::PeerOnline("u3".to_string())));
        presence.handle(&server(ServerEvent::PeerOffline("u2".to_string())));
        // Offline for someone never seen is harmless
        presence.handle(&server(ServerEvent::PeerOffline("u9".to_string())));

        assert_eq!(presence.online(), vec!["u3".to_string()]);
        assert!(presence.is_online("u3"));
        assert!(!presence.is_online("u2"));
    }

    #[test]
    fn test_peer_list_replaces_wholesale() {
        let presence = PresenceTracker::new();
        presence.handle(&server(ServerEvent::PeerOnline("stale".to_string())));
        presence.handle(&server(ServerEvent::PeerList(vec![
            "u2".to_string(),
            "u3".to_string(),
        ])));

        assert_eq!(presence.online(), vec!["u2".to_string(), "u3".to_string()]);
    }

    #[test]
    fn test_cleared_on_disconnect() {
        let presence = PresenceTracker::new();
        presence.handle(&server(ServerEvent::PeerList(vec!["u2".to_string()])));

        presence.handle(&transition(
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ));

        assert!(presence.is_empty());
    }

    #[test]
    fn test_cleared_while_reconnecting_and_kept_when_connected() {
        let presence = PresenceTracker::new();
        presence.handle(&server(ServerEvent::PeerOnline("u2".to_string())));
        presence.handle(&transition(
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ));
        assert_eq!(presence.len(), 1);

        presence.handle(&transition(
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
        ));
        assert!(presence.is_empty());
    }
}
