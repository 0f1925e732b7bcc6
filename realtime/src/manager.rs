use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use events::{
    ChatMessage, ClientEvent, ConnectionError, ConnectionEvent, ConnectionHandler,
    ConnectionState, EventPublisher, EventType, OutgoingMessage, ServerEvent,
};
use log::*;
use session_auth::credentials::{AuthChange, AuthListener, AuthSnapshot};
use session_auth::error::{transport_error, TransportErrorKind};
use session_auth::http::Backoff;
use session_auth::CredentialStore;
use tokio::sync::{broadcast, mpsc::UnboundedSender, watch};
use tokio::task::JoinHandle;

use crate::rooms::RoomRegistry;
use crate::transport::{Connector, Link};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Timing of connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Upper bound for a single attempt, handshake included.
    pub connect_timeout: Duration,
    /// Delays between attempts; `max_retries` bounds the attempts made after
    /// a failure before giving up.
    pub backoff: Backoff,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            backoff: Backoff::new(5)
                .with_base_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30))
                .with_jitter(0.2),
        }
    }
}

// Lifecycle bookkeeping; transitions happen only while this is locked
struct Shared {
    // Bumped on every connect and disconnect; a run loop whose generation is
    // no longer current must not touch the state
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    me: Weak<Inner>,
    store: CredentialStore,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    shared: Mutex<Shared>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<UnboundedSender<ClientEvent>>>,
    publisher: EventPublisher,
    events: broadcast::Sender<ConnectionEvent>,
    rooms: Arc<RoomRegistry>,
}

/// Owns the single realtime connection of the session and keeps it in step
/// with the credential store.
///
/// Signing in opens the connection; signing out closes it immediately,
/// cancelling any attempt or backoff in progress. An unexpected closure moves
/// to `Reconnecting` and retries with bounded exponential backoff before
/// giving up in `Disconnected` with a terminal error.
///
/// Events reach handlers registered with [`on`](Self::on) synchronously and in
/// order, and [`subscribe`](Self::subscribe) receivers asynchronously.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        store: CredentialStore,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let rooms = Arc::new(RoomRegistry::new());
        let publisher = EventPublisher::new().with_handler(rooms.clone());

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            store,
            connector,
            config,
            shared: Mutex::new(Shared {
                generation: 0,
                task: None,
            }),
            state,
            outbound: Mutex::new(None),
            publisher,
            events,
            rooms,
        });
        let listener: Arc<dyn AuthListener> = inner.clone();
        inner.store.subscribe(Arc::downgrade(&listener));

        Self { inner }
    }

    /// Connect now if the store already holds a session. Later sign-ins are
    /// picked up automatically.
    pub fn start(&self) {
        let idle = self.state() == ConnectionState::Disconnected;
        if idle && self.inner.store.is_authenticated() {
            self.inner.open();
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Register a handler for every connection event.
    pub fn on(&self, handler: Arc<dyn ConnectionHandler>) {
        self.inner.publisher.add_handler(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.inner.rooms
    }

    /// Messages pushed for one conversation.
    pub fn listen(&self, conversation_id: &str) -> broadcast::Receiver<ChatMessage> {
        self.inner.rooms.listen(conversation_id)
    }

    /// Send `event` if connected. Events emitted in any other state are
    /// dropped, not queued. Returns whether the event was handed to the
    /// transport.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let state = self.state();
        let sent = match (state, self.inner.lock_outbound().as_ref()) {
            (ConnectionState::Connected, Some(outbound)) => outbound.send(event.clone()).is_ok(),
            _ => false,
        };
        if !sent {
            debug!("Dropping {} while {}", event.event_type(), state);
        }
        sent
    }

    pub fn join_conversation(&self, conversation_id: &str) -> bool {
        let sent = self.emit(ClientEvent::JoinConversation(conversation_id.to_string()));
        if sent {
            self.inner.rooms.mark_joined(conversation_id);
        }
        sent
    }

    pub fn leave_conversation(&self, conversation_id: &str) -> bool {
        self.inner.rooms.mark_left(conversation_id);
        self.emit(ClientEvent::LeaveConversation(conversation_id.to_string()))
    }

    pub fn send_typing(&self, conversation_id: &str, is_typing: bool) -> bool {
        self.emit(ClientEvent::Typing {
            conversation_id: conversation_id.to_string(),
            is_typing,
        })
    }

    pub fn send_message(&self, conversation_id: &str, content: &str) -> bool {
        self.emit(ClientEvent::SendMessage(OutgoingMessage {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        }))
    }

    /// Restart the connection cycle, e.g. after retries were exhausted.
    /// Does nothing without a session.
    pub fn reconnect(&self) {
        if self.inner.store.is_authenticated() {
            self.inner.open();
        } else {
            debug!("Not reconnecting without a session");
        }
    }

    /// Close the connection and stay disconnected until the next sign-in or
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.inner.close();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(shared) => shared,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Option<UnboundedSender<ClientEvent>>> {
        match self.outbound.lock() {
            Ok(outbound) => outbound,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, event: ConnectionEvent) {
        self.publisher.publish(&event);
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Move to `state`. Callers hold the lifecycle lock.
    fn transition(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        info!("Realtime connection {} -> {}", previous, state);
        self.publish(ConnectionEvent::StateChanged { previous, state });
    }

    fn teardown(&self, shared: &mut Shared) -> u64 {
        if let Some(task) = shared.task.take() {
            task.abort();
        }
        // Dropping the sender closes the socket
        *self.lock_outbound() = None;
        shared.generation += 1;
        shared.generation
    }

    /// Tear down whatever is in progress and start a fresh connection cycle.
    fn open(&self) {
        let mut shared = self.lock();
        let generation = self.teardown(&mut shared);
        self.transition(ConnectionState::Connecting);

        let Some(me) = self.me.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                shared.task = Some(runtime.spawn(async move { me.run(generation).await }));
            }
            Err(e) => {
                error!("Cannot open realtime connection outside a runtime: {}", e);
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    fn close(&self) {
        let mut shared = self.lock();
        self.teardown(&mut shared);
        self.transition(ConnectionState::Disconnected);
    }

    /// Run `f` on the shared state if `generation` is still current.
    fn if_current(&self, generation: u64, f: impl FnOnce(&Self, &mut Shared)) -> bool {
        let mut shared = self.lock();
        if shared.generation != generation {
            return false;
        }
        f(self, &mut shared);
        true
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let backoff = &self.config.backoff;
        let mut attempt: u32 = 0;

        loop {
            if let Some(link) = self.attempt(generation).await {
                let Link {
                    sid,
                    outbound,
                    mut inbound,
                } = link;

                let connected = self.if_current(generation, |inner, _| {
                    *inner.lock_outbound() = Some(outbound);
                    inner.transition(ConnectionState::Connected);
                });
                if !connected {
                    return;
                }
                debug!("Realtime session id: {}", sid.as_deref().unwrap_or("-"));
                attempt = 0;

                while let Some(event) = inbound.recv().await {
                    if !self.deliver(generation, event) {
                        return;
                    }
                }
                warn!("Realtime connection closed unexpectedly");
            }

            if !self.store.is_authenticated() {
                self.if_current(generation, |inner, _| {
                    *inner.lock_outbound() = None;
                    inner.transition(ConnectionState::Disconnected);
                });
                return;
            }

            if backoff.is_exhausted(attempt) {
                self.if_current(generation, |inner, shared| {
                    *inner.lock_outbound() = None;
                    shared.task = None;
                    inner.transition(ConnectionState::Disconnected);
                    let gave_up = transport_error(
                        TransportErrorKind::RetriesExhausted,
                        &format!("Gave up after {} reconnect attempts", attempt),
                    );
                    inner.publish(ConnectionEvent::Error(ConnectionError {
                        message: gave_up.to_string(),
                        terminal: true,
                    }));
                });
                error!("Realtime connection gave up after {} attempts", attempt);
                return;
            }

            let waiting = self.if_current(generation, |inner, _| {
                *inner.lock_outbound() = None;
                inner.transition(ConnectionState::Reconnecting);
            });
            if !waiting {
                return;
            }

            let delay = backoff.delay(attempt);
            attempt += 1;
            info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt,
                backoff.max_retries(),
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One bounded connect attempt with the current access token.
    async fn attempt(&self, generation: u64) -> Option<Link> {
        let token = self.store.access_token()?;
        let failure = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&token),
        )
        .await
        {
            Ok(Ok(link)) => return Some(link),
            Ok(Err(e)) => e.to_string(),
            Err(_) => transport_error(
                TransportErrorKind::ConnectTimeout,
                &format!("No acknowledgment within {:?}", self.config.connect_timeout),
            )
            .to_string(),
        };

        warn!("Realtime connect failed: {}", failure);
        self.if_current(generation, |inner, _| {
            inner.publish(ConnectionEvent::Error(ConnectionError {
                message: failure,
                terminal: false,
            }));
        });
        None
    }

    fn deliver(&self, generation: u64, event: ServerEvent) -> bool {
        self.if_current(generation, |inner, _| {
            inner.publish(ConnectionEvent::Server(event));
        })
    }
}

impl AuthListener for Inner {
    fn on_auth_changed(&self, change: AuthChange, snapshot: &AuthSnapshot) {
        match change {
            AuthChange::SignedIn => {
                debug!("Session {} started, connecting", snapshot.epoch);
                self.open();
            }
            AuthChange::SignedOut => {
                debug!("Session ended, disconnecting");
                self.close();
            }
            // The open connection stays; the next attempt reads the new token
            AuthChange::TokensReplaced => {}
        }
    }
}
