//! In-memory credential store with synchronous change notification.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use secrecy::SecretString;
use tokio::sync::watch;
use tracing::debug;

/// Access and refresh tokens for the current session, plus the id of the
/// signed-in user when it is known.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub user_id: Option<String>,
}

impl Credentials {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

/// What a mutation did to the authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChange {
    /// The store went from unauthenticated to authenticated, or a new login
    /// replaced the previous session.
    SignedIn,
    /// Tokens were replaced within the same session (refresh).
    TokensReplaced,
    /// The store was cleared.
    SignedOut,
}

/// Observable summary of the store, published on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthSnapshot {
    pub authenticated: bool,
    pub user_id: Option<String>,
    /// Incremented on every login and every clear.
    pub epoch: u64,
}

/// Trait for components that must react to credential changes before the
/// mutating call returns.
///
/// Listeners are invoked while the store serializes mutations, so they must
/// not mutate the store themselves. Reading it is fine.
pub trait AuthListener: Send + Sync {
    fn on_auth_changed(&self, change: AuthChange, snapshot: &AuthSnapshot);
}

#[derive(Default)]
struct State {
    credentials: Credentials,
    epoch: u64,
}

struct Inner {
    state: RwLock<State>,
    // Serializes mutation + notification so listeners see changes in order
    mutation: Mutex<()>,
    listeners: RwLock<Vec<Weak<dyn AuthListener>>>,
    snapshot_tx: watch::Sender<AuthSnapshot>,
}

/// Single source of truth for the session's credentials.
///
/// Cloning produces another handle to the same store. Every mutation notifies
/// listeners and `watch` subscribers synchronously, so no reader observes a
/// stale value once `set`, `login` or `clear` has returned.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

impl CredentialStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(AuthSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                mutation: Mutex::new(()),
                listeners: RwLock::new(Vec::new()),
                snapshot_tx,
            }),
        }
    }

    /// Current credentials.
    pub fn get(&self) -> Credentials {
        self.read(|state| state.credentials.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read(|state| state.credentials.is_authenticated())
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.read(|state| state.credentials.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<SecretString> {
        self.read(|state| state.credentials.refresh_token.clone())
    }

    pub fn user_id(&self) -> Option<String> {
        self.read(|state| state.credentials.user_id.clone())
    }

    /// Session counter: changes whenever a session starts or ends.
    pub fn epoch(&self) -> u64 {
        self.read(|state| state.epoch)
    }

    /// Credentials together with the epoch they belong to, read at once.
    pub(crate) fn get_with_epoch(&self) -> (Credentials, u64) {
        self.read(|state| (state.credentials.clone(), state.epoch))
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.read(Self::snapshot_of)
    }

    /// Subscribe to snapshots for async consumers.
    pub fn watch(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Register a listener. The store holds it weakly; dropping the last
    /// strong reference unregisters it.
    pub fn subscribe(&self, listener: Weak<dyn AuthListener>) {
        match self.inner.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Start a new session for `user_id`.
    pub fn login(
        &self,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
        user_id: Option<String>,
    ) {
        self.mutate(|state| {
            state.credentials = Credentials {
                access_token: Some(access_token),
                refresh_token,
                user_id,
            };
            state.epoch += 1;
            Some(AuthChange::SignedIn)
        });
    }

    /// Replace the tokens. A `None` refresh token keeps the current one.
    pub fn set(&self, access_token: SecretString, refresh_token: Option<SecretString>) {
        self.mutate(|state| Some(Self::replace_tokens(state, access_token, refresh_token)));
    }

    /// Like [`set`](Self::set), but only while the session identified by
    /// `epoch` is still current. Returns whether the tokens were replaced.
    pub fn set_if_epoch(
        &self,
        epoch: u64,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
    ) -> bool {
        self.mutate(|state| {
            (state.epoch == epoch && state.credentials.is_authenticated())
                .then(|| Self::replace_tokens(state, access_token, refresh_token))
        })
    }

    /// Drop both tokens and the user id.
    pub fn clear(&self) {
        self.mutate(|state| Some(Self::reset(state)));
    }

    /// Clear only while the session identified by `epoch` is still current.
    pub fn clear_if_epoch(&self, epoch: u64) -> bool {
        self.mutate(|state| (state.epoch == epoch).then(|| Self::reset(state)))
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        match self.inner.state.read() {
            Ok(state) => f(&state),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        match self.inner.mutation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn replace_tokens(
        state: &mut State,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
    ) -> AuthChange {
        let was_authenticated = state.credentials.is_authenticated();
        state.credentials.access_token = Some(access_token);
        if let Some(refresh_token) = refresh_token {
            state.credentials.refresh_token = Some(refresh_token);
        }
        if was_authenticated {
            AuthChange::TokensReplaced
        } else {
            state.epoch += 1;
            AuthChange::SignedIn
        }
    }

    fn reset(state: &mut State) -> AuthChange {
        state.credentials = Credentials::default();
        state.epoch += 1;
        AuthChange::SignedOut
    }

    fn snapshot_of(state: &State) -> AuthSnapshot {
        AuthSnapshot {
            authenticated: state.credentials.is_authenticated(),
            user_id: state.credentials.user_id.clone(),
            epoch: state.epoch,
        }
    }

    /// Applies `f` and notifies. `f` returning `None` leaves the store
    /// untouched and notifies nobody.
    fn mutate(&self, f: impl FnOnce(&mut State) -> Option<AuthChange>) -> bool {
        let _serialized = self.lock_mutation();

        let (change, snapshot) = {
            let mut state = match self.inner.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            match f(&mut state) {
                Some(change) => (change, Self::snapshot_of(&state)),
                None => return false,
            }
        };

        debug!(
            "Credentials changed: {:?} (authenticated: {}, epoch: {})",
            change, snapshot.authenticated, snapshot.epoch
        );

        self.inner.snapshot_tx.send_replace(snapshot.clone());

        let listeners: Vec<Arc<dyn AuthListener>> = {
            let mut registered = match self.inner.listeners.write() {
                Ok(listeners) => listeners,
                Err(poisoned) => poisoned.into_inner(),
            };
            registered.retain(|listener| listener.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_auth_changed(change, &snapshot);
        }
        true
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(AuthChange, AuthSnapshot)>>,
        // Reads back through the store to prove the new value is visible
        store: Mutex<Option<CredentialStore>>,
        observed_authenticated: Mutex<Vec<bool>>,
    }

    impl AuthListener for Recorder {
        fn on_auth_changed(&self, change: AuthChange, snapshot: &AuthSnapshot) {
            self.changes.lock().unwrap().push((change, snapshot.clone()));
            if let Some(store) = self.store.lock().unwrap().as_ref() {
                self.observed_authenticated
                    .lock()
                    .unwrap()
                    .push(store.is_authenticated());
            }
        }
    }

    #[test]
    fn test_new_store_is_unauthenticated() {
        let store = CredentialStore::new();
        assert!(!store.is_authenticated());
        assert!(store.access_token().is_none());
        assert_eq!(store.epoch(), 0);
    }

    #[test]
    fn test_login_then_refresh_then_clear() {
        let store = CredentialStore::new();
        store.login(secret("a1"), Some(secret("r1")), Some("u1".to_string()));
        assert!(store.is_authenticated());
        assert_eq!(store.user_id().as_deref(), Some("u1"));
        let epoch = store.epoch();

        store.set(secret("a2"), None);
        assert_eq!(store.access_token().unwrap().expose_secret(), "a2");
        assert_eq!(store.refresh_token().unwrap().expose_secret(), "r1");
        assert_eq!(store.epoch(), epoch, "refresh keeps the session epoch");

        store.clear();
        let credentials = store.get();
        assert!(credentials.access_token.is_none());
        assert!(credentials.refresh_token.is_none());
        assert!(credentials.user_id.is_none());
        assert!(store.epoch() > epoch);
    }

    #[test]
    fn test_listeners_see_new_value_synchronously() {
        let store = CredentialStore::new();
        let recorder = Arc::new(Recorder::default());
        *recorder.store.lock().unwrap() = Some(store.clone());
        let listener: Arc<dyn AuthListener> = recorder.clone();
        store.subscribe(Arc::downgrade(&listener));

        store.set(secret("a1"), Some(secret("r1")));
        store.set(secret("a2"), Some(secret("r2")));
        store.clear();

        let changes: Vec<AuthChange> = recorder
            .changes
            .lock()
            .unwrap()
            .iter()
            .map(|(change, _)| *change)
            .collect();
        assert_eq!(
            changes,
            vec![
                AuthChange::SignedIn,
                AuthChange::TokensReplaced,
                AuthChange::SignedOut
            ]
        );
        assert_eq!(
            *recorder.observed_authenticated.lock().unwrap(),
            vec![true, true, false]
        );
    }

    #[test]
    fn test_dropped_listener_is_not_called() {
        let store = CredentialStore::new();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn AuthListener> = recorder.clone();
        store.subscribe(Arc::downgrade(&listener));
        drop(listener);
        drop(recorder);

        // Must not panic on the dead weak reference
        store.set(secret("a1"), None);
        assert!(store.is_authenticated());
    }

    #[test]
    fn test_watch_receives_snapshot() {
        let store = CredentialStore::new();
        let rx = store.watch();

        store.login(secret("a1"), None, Some("u9".to_string()));

        let snapshot = rx.borrow().clone();
        assert!(snapshot.authenticated);
        assert_eq!(snapshot.user_id.as_deref(), Some("u9"));
        assert_eq!(snapshot, store.snapshot());
    }

    #[test]
    fn test_epoch_guarded_mutations() {
        let store = CredentialStore::new();
        store.login(secret("a1"), Some(secret("r1")), None);
        let stale = store.epoch();

        store.clear();
        store.login(secret("b1"), Some(secret("s1")), None);

        assert!(!store.set_if_epoch(stale, secret("a2"), None));
        assert!(!store.clear_if_epoch(stale));
        assert_eq!(store.access_token().unwrap().expose_secret(), "b1");

        let current = store.epoch();
        assert!(store.set_if_epoch(current, secret("b2"), None));
        assert_eq!(store.refresh_token().unwrap().expose_secret(), "s1");
        assert!(store.clear_if_epoch(current));
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_set_if_epoch_requires_a_session() {
        let store = CredentialStore::new();
        assert!(!store.set_if_epoch(0, secret("a1"), None));
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_get_with_epoch_pairs_credentials_with_their_session() {
        let store = CredentialStore::new();
        store.login(secret("a1"), Some(secret("r1")), None);
        let (credentials, epoch) = store.get_with_epoch();
        assert_eq!(credentials.refresh_token.unwrap().expose_secret(), "r1");
        assert_eq!(epoch, store.epoch());

        store.clear();
        let (credentials, cleared) = store.get_with_epoch();
        assert!(credentials.access_token.is_none());
        assert_eq!(cleared, epoch + 1);
    }
}
