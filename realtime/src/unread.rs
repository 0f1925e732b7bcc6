use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use events::{ChatMessage, ConnectionEvent, ConnectionHandler, ConnectionState, ServerEvent};
use log::*;
use serde_json::Value;
use session_auth::credentials::{AuthChange, AuthListener, AuthSnapshot};
use session_auth::error::{http_error, Error, HttpErrorKind};
use session_auth::{CredentialStore, RefreshCoordinator};
use tokio::sync::watch;

/// Default path of the endpoint reporting the total unread count.
pub const UNREAD_COUNT_PATH: &str = "/conversations/unread-count";

/// Authoritative total of unread messages, owned by the conversation list.
#[async_trait]
pub trait UnreadSource: Send + Sync {
    async fn total_unread(&self) -> Result<u64, Error>;
}

/// [`UnreadSource`] that asks the API.
///
/// Accepts a bare number or an object with `count`, `unreadCount` or `total`,
/// optionally wrapped in `data`.
pub struct ApiUnreadSource {
    api: RefreshCoordinator,
    path: String,
}

impl ApiUnreadSource {
    pub fn new(api: RefreshCoordinator) -> Self {
        Self::with_path(api, UNREAD_COUNT_PATH)
    }

    pub fn with_path(api: RefreshCoordinator, path: impl Into<String>) -> Self {
        Self {
            api,
            path: path.into(),
        }
    }
}

#[async_trait]
impl UnreadSource for ApiUnreadSource {
    async fn total_unread(&self) -> Result<u64, Error> {
        let response = self.api.get(&self.path).await?;
        parse_total(response.data()).ok_or_else(|| {
            http_error(
                HttpErrorKind::InvalidResponse,
                "Unread count response has no count",
            )
        })
    }
}

fn parse_total(body: &Value) -> Option<u64> {
    match body {
        Value::Number(count) => count.as_u64(),
        Value::Object(map) => ["count", "unreadCount", "total"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_u64)),
        _ => None,
    }
}

struct Inner {
    store: CredentialStore,
    source: Arc<dyn UnreadSource>,
    // Stamp of the most recent recount; only its result is applied
    generation: Mutex<u64>,
    count: watch::Sender<u64>,
}

impl Inner {
    fn lock_generation(&self) -> MutexGuard<'_, u64> {
        match self.generation.lock() {
            Ok(generation) => generation,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AuthListener for Inner {
    fn on_auth_changed(&self, change: AuthChange, _snapshot: &AuthSnapshot) {
        if change == AuthChange::SignedOut {
            // Discard in-flight recounts of the ended session
            *self.lock_generation() += 1;
            self.count.send_replace(0);
        }
    }
}

/// Unread message badge count.
///
/// Push events bump the count between recounts; a recount from the
/// [`UnreadSource`] always replaces it. Recounts run when a conversation is
/// marked read and whenever the connection (re)opens, since pushes may have
/// been missed while it was down.
#[derive(Clone)]
pub struct UnreadAggregator {
    inner: Arc<Inner>,
}

impl UnreadAggregator {
    pub fn new(store: CredentialStore, source: Arc<dyn UnreadSource>) -> Self {
        let (count, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            store,
            source,
            generation: Mutex::new(0),
            count,
        });
        let listener: Arc<dyn AuthListener> = inner.clone();
        inner.store.subscribe(Arc::downgrade(&listener));

        Self { inner }
    }

    pub fn count(&self) -> u64 {
        *self.inner.count.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.count.subscribe()
    }

    /// Count `message` unless the current user sent it. Returns whether it
    /// was counted.
    pub fn on_incoming_message(&self, message: &ChatMessage) -> bool {
        if self.inner.store.user_id().as_deref() == Some(message.sender_id.as_str()) {
            return false;
        }
        self.inner.count.send_modify(|count| *count = count.saturating_add(1));
        true
    }

    /// Replace the count with the authoritative total after a conversation
    /// was read.
    pub async fn on_conversation_marked_read(&self, conversation_id: &str) -> Result<u64, Error> {
        debug!("Conversation {} marked read, recounting", conversation_id);
        self.recount().await
    }

    /// Replace the count with the authoritative total after reconnecting.
    pub async fn on_reconnect(&self) -> Result<u64, Error> {
        self.recount().await
    }

    /// Fetch the total and apply it unless a newer recount started or the
    /// session ended meanwhile. Returns the count in effect afterwards.
    pub async fn recount(&self) -> Result<u64, Error> {
        let stamp = {
            let mut generation = self.inner.lock_generation();
            *generation += 1;
            *generation
        };

        let total = self.inner.source.total_unread().await?;

        let generation = self.inner.lock_generation();
        if *generation == stamp {
            self.inner.count.send_replace(total);
        } else {
            debug!("Discarding superseded unread recount");
        }
        drop(generation);

        Ok(self.count())
    }

    fn spawn_recount(&self) {
        let aggregator = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = aggregator.on_reconnect().await {
                        warn!("Unread recount failed: {}", e);
                    }
                });
            }
            Err(e) => error!("Cannot recount unread messages outside a runtime: {}", e),
        }
    }
}

impl ConnectionHandler for UnreadAggregator {
    fn handle(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Server(ServerEvent::NewMessage(message)) => {
                self.on_incoming_message(message);
            }
            ConnectionEvent::StateChanged {
                state: ConnectionState::Connected,
                ..
            } => self.spawn_recount(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Notify;

    struct FixedSource {
        total: AtomicU64,
        gate: Option<Notify>,
    }

    impl FixedSource {
        fn new(total: u64) -> Arc<Self> {
            Arc::new(Self {
                total: AtomicU64::new(total),
                gate: None,
            })
        }

        fn gated(total: u64) -> Arc<Self> {
            Arc::new(Self {
                total: AtomicU64::new(total),
                gate: Some(Notify::new()),
            })
        }
    }

    #[async_trait]
    impl UnreadSource for FixedSource {
        async fn total_unread(&self) -> Result<u64, Error> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.total.load(Ordering::SeqCst))
        }
    }

    fn signed_in_store() -> CredentialStore {
        let store = CredentialStore::new();
        store.login(
            SecretString::new("a1".to_string()),
            None,
            Some("me".to_string()),
        );
        store
    }

    fn message(sender: &str) -> ChatMessage {
        ChatMessage {
            id: None,
            conversation_id: "c1".to_string(),
            sender_id: sender.to_string(),
            content: "hi".to_string(),
            created_at: None,
        }
    }

    #[test]
    fn test_own_messages_are_not_counted() {
        let unread = UnreadAggregator::new(signed_in_store(), FixedSource::new(0));

        assert!(!unread.on_incoming_message(&message("me")));
        assert!(unread.on_incoming_message(&message("peer")));
        assert!(unread.on_incoming_message(&message("peer")));

        assert_eq!(unread.count(), 2);
    }

    #[tokio::test]
    async fn test_marked_read_replaces_count_with_total() {
        let unread = UnreadAggregator::new(signed_in_store(), FixedSource::new(1));
        for _ in 0..4 {
            unread.on_incoming_message(&message("peer"));
        }

        assert_eq!(unread.on_conversation_marked_read("c1").await.unwrap(), 1);
        assert_eq!(*unread.watch().borrow(), 1);
    }

    #[tokio::test]
    async fn test_only_latest_recount_applies() {
        let source = FixedSource::gated(7);
        let unread = UnreadAggregator::new(signed_in_store(), source.clone());

        let stale = tokio::spawn({
            let unread = unread.clone();
            async move { unread.recount().await }
        });
        tokio::task::yield_now().await;

        // A newer recount supersedes the pending one
        source.total.store(3, Ordering::SeqCst);
        let fresh = tokio::spawn({
            let unread = unread.clone();
            async move { unread.recount().await }
        });
        tokio::task::yield_now().await;

        source.total.store(9, Ordering::SeqCst);
        source.gate.as_ref().unwrap().notify_one();
        assert_eq!(stale.await.unwrap().unwrap(), 0, "superseded result is dropped");
        source.gate.as_ref().unwrap().notify_one();
        assert_eq!(fresh.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_sign_out_resets_count_and_discards_recount() {
        let source = FixedSource::gated(5);
        let store = signed_in_store();
        let unread = UnreadAggregator::new(store.clone(), source.clone());
        unread.on_incoming_message(&message("peer"));

        let pending = tokio::spawn({
            let unread = unread.clone();
            async move { unread.recount().await }
        });
        tokio::task::yield_now().await;

        store.clear();
        assert_eq!(unread.count(), 0);

        source.gate.as_ref().unwrap().notify_one();
        pending.await.unwrap().unwrap();
        assert_eq!(unread.count(), 0);
    }

    #[test]
    fn test_parse_total_shapes() {
        assert_eq!(parse_total(&serde_json::json!(4)), Some(4));
        assert_eq!(parse_total(&serde_json::json!({ "unreadCount": 2 })), Some(2));
        assert_eq!(parse_total(&serde_json::json!({ "total": 0 })), Some(0));
        assert_eq!(parse_total(&serde_json::json!({ "other": 1 })), None);
    }

    #[tokio::test]
    async fn test_connected_event_triggers_recount() {
        let unread = UnreadAggregator::new(signed_in_store(), FixedSource::new(6));
        let mut count = unread.watch();

        unread.handle(&ConnectionEvent::StateChanged {
            previous: ConnectionState::Reconnecting,
            state: ConnectionState::Connected,
        });

        count.changed().await.unwrap();
        assert_eq!(*count.borrow(), 6);
    }
}
