use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::oneshot;
use tracing::debug;

use crate::credentials::{AuthChange, AuthListener, AuthSnapshot, CredentialStore};
use crate::error::SessionErrorKind;

/// What a waiter receives when its refresh cycle settles.
pub(crate) type Settlement = Result<SecretString, (SessionErrorKind, String)>;

pub(crate) type Waiter = oneshot::Sender<Settlement>;

/// A refresh cycle to run, bound to the session it was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lead {
    pub(crate) cycle: u64,
    pub(crate) epoch: u64,
}

/// Outcome of joining the queue for a request whose token was rejected.
pub(crate) enum Join {
    /// The store already holds a different token; replay with it.
    Replaced(SecretString),
    /// No session left to refresh.
    Ended,
    /// Wait for the cycle to settle. `lead` is set when this caller started
    /// the cycle and must run the refresh.
    Wait {
        receiver: oneshot::Receiver<Settlement>,
        lead: Option<Lead>,
    },
}

#[derive(Default)]
struct QueueState {
    refreshing: Option<u64>,
    next_cycle: u64,
    waiters: VecDeque<Waiter>,
}

/// FIFO of continuation handles for requests parked on a refresh cycle.
#[derive(Default)]
pub(crate) struct WaiterQueue {
    state: Mutex<QueueState>,
}

impl WaiterQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Park a request that was rejected while using `used`.
    ///
    /// The store is consulted under the queue lock: a leader replaces the
    /// tokens before it takes its waiters, so a caller either sees the new
    /// token here or is enqueued on a cycle that has not settled yet.
    pub(crate) fn join(&self, used: &SecretString, store: &CredentialStore) -> Join {
        let mut state = self.lock();

        let (credentials, epoch) = store.get_with_epoch();
        match credentials.access_token {
            None => return Join::Ended,
            Some(current) if current.expose_secret() != used.expose_secret() => {
                return Join::Replaced(current)
            }
            Some(_) => {}
        }

        let (sender, receiver) = oneshot::channel();
        state.waiters.push_back(sender);

        let lead = match state.refreshing {
            Some(_) => None,
            None => {
                state.next_cycle += 1;
                let cycle = state.next_cycle;
                state.refreshing = Some(cycle);
                Some(Lead { cycle, epoch })
            }
        };
        debug!(
            "Request parked on token refresh (waiters: {}, leader: {})",
            state.waiters.len(),
            lead.is_some()
        );

        Join::Wait { receiver, lead }
    }

    /// Whether `cycle` is still waiting to settle.
    pub(crate) fn is_current(&self, cycle: u64) -> bool {
        self.lock().refreshing == Some(cycle)
    }

    /// End `cycle` and hand back its waiters. Empty if the cycle was
    /// already abandoned.
    pub(crate) fn take(&self, cycle: u64) -> Vec<Waiter> {
        let mut state = self.lock();
        if state.refreshing != Some(cycle) {
            return Vec::new();
        }
        state.refreshing = None;
        state.waiters.drain(..).collect()
    }

    /// Reject everything parked with `SessionEnded` and forget the cycle.
    pub(crate) fn abandon(&self) -> usize {
        let waiters: Vec<Waiter> = {
            let mut state = self.lock();
            state.refreshing = None;
            state.waiters.drain(..).collect()
        };
        let count = waiters.len();
        if count > 0 {
            debug!("Session ended with {} request(s) waiting on refresh", count);
        }
        settle_all(
            waiters,
            Err((
                SessionErrorKind::SessionEnded,
                "Session ended while waiting for token refresh".to_string(),
            )),
        );
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub(crate) fn is_refreshing(&self) -> bool {
        self.lock().refreshing.is_some()
    }
}

impl AuthListener for WaiterQueue {
    fn on_auth_changed(&self, change: AuthChange, _snapshot: &AuthSnapshot) {
        if change == AuthChange::SignedOut {
            self.abandon();
        }
    }
}

/// Resolve every waiter of a cycle with the same outcome, in FIFO order.
pub(crate) fn settle_all(waiters: Vec<Waiter>, outcome: Settlement) {
    for waiter in waiters {
        // A dropped receiver means the caller went away; nothing to deliver
        let _ = waiter.send(outcome.clone());
    }
}
