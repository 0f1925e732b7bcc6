use std::sync::Arc;

use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::queue::{settle_all, Join, Lead, WaiterQueue};
use crate::api::{ApiRequest, ApiResponse, AuthSession, HttpTransport, TokenPair};
use crate::credentials::{AuthListener, CredentialStore};
use crate::error::{http_error, session_error, Error, ErrorKind, HttpErrorKind, SessionErrorKind};

/// Sends API requests with the session's access token and makes token
/// expiry transparent to callers.
///
/// An authorization-expired response on an ordinary request starts (or joins)
/// a refresh cycle. Exactly one refresh call runs per cycle; every request
/// parked on it is replayed once with the new token, or rejected with
/// `RefreshFailed` after which the store is cleared. Signing out while
/// requests are parked rejects them with `SessionEnded`.
///
/// The refresh call runs on its own task, so a caller that is dropped while
/// leading a cycle does not strand the other waiters.
#[derive(Clone)]
pub struct RefreshCoordinator {
    store: CredentialStore,
    transport: Arc<dyn HttpTransport>,
    waiters: Arc<WaiterQueue>,
}

impl RefreshCoordinator {
    pub fn new(store: CredentialStore, transport: Arc<dyn HttpTransport>) -> Self {
        let waiters = Arc::new(WaiterQueue::new());
        let listener: Arc<dyn AuthListener> = waiters.clone();
        store.subscribe(Arc::downgrade(&listener));

        Self {
            store,
            transport,
            waiters,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Requests currently parked on a refresh cycle.
    pub fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_refreshing(&self) -> bool {
        self.waiters.is_refreshing()
    }

    /// Exchange credentials for a session and store it.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, Error> {
        let response = self
            .transport
            .execute(&ApiRequest::login(email, password), None)
            .await
            .map_err(|err| {
                if err.is_auth_expired() {
                    http_error(HttpErrorKind::Status(401), "Invalid email or password")
                } else {
                    err
                }
            })?;
        let session = AuthSession::from_response(&response)?;

        self.store.login(
            session.tokens.access_token.clone(),
            session.tokens.refresh_token.clone(),
            session.user_id(),
        );
        info!(
            "Signed in{}",
            session
                .user_id()
                .map(|id| format!(" as user {id}"))
                .unwrap_or_default()
        );

        Ok(session)
    }

    /// Sign out locally, then tell the server on a best-effort basis.
    ///
    /// The store is cleared before the logout call so that every listener and
    /// parked request sees the session end immediately.
    pub async fn logout(&self) {
        let credentials = self.store.get();
        self.store.clear();
        info!("Signed out");

        let Some(access_token) = credentials.access_token else {
            return;
        };
        let request = ApiRequest::logout(credentials.refresh_token.as_ref());
        if let Err(e) = self.transport.execute(&request, Some(&access_token)).await {
            warn!("Logout request failed: {}", e);
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, Error> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse, Error> {
        self.request(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<ApiResponse, Error> {
        self.request(ApiRequest::put(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, Error> {
        self.request(ApiRequest::delete(path)).await
    }

    /// Send `request` with the current access token.
    ///
    /// Only `AuthExpired` is handled here. Network errors and other statuses
    /// reach the caller untouched.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        let token = if request.kind().sends_access_token() {
            match self.store.access_token() {
                Some(token) => Some(token),
                None => {
                    return Err(session_error(
                        SessionErrorKind::NotAuthenticated,
                        "No access token held",
                    ))
                }
            }
        } else {
            None
        };

        match self.transport.execute(&request, token.as_ref()).await {
            Err(err) if err.is_auth_expired() => self.recover(request, token, err).await,
            result => result,
        }
    }

    async fn recover(
        &self,
        request: ApiRequest,
        used: Option<SecretString>,
        err: Error,
    ) -> Result<ApiResponse, Error> {
        // The refresh call and already-replayed requests never re-enter
        let used = match used {
            Some(used) if request.kind().is_refreshable() && request.attempt() == 0 => used,
            _ => return Err(err),
        };

        let token = match self.waiters.join(&used, &self.store) {
            Join::Replaced(token) => {
                debug!("Token replaced while {} was in flight", request.path());
                token
            }
            Join::Ended => {
                return Err(session_error(
                    SessionErrorKind::SessionEnded,
                    "Session ended before the request could be retried",
                ))
            }
            Join::Wait { receiver, lead } => {
                if let Some(lead) = lead {
                    let leader = self.clone();
                    tokio::spawn(async move { leader.run_refresh(lead).await });
                }
                match receiver.await {
                    Ok(Ok(token)) => token,
                    Ok(Err((kind, message))) => return Err(session_error(kind, &message)),
                    Err(_) => {
                        return Err(session_error(
                            SessionErrorKind::SessionEnded,
                            "Token refresh was abandoned",
                        ))
                    }
                }
            }
        };

        self.transport.execute(&request.retried(), Some(&token)).await
    }

    /// Run the refresh cycle to completion and settle its waiters.
    ///
    /// The store is updated (or cleared) before any waiter is resolved. A
    /// cycle abandoned before it got to run, or whose session has ended,
    /// never touches the store.
    async fn run_refresh(&self, lead: Lead) {
        let Lead { cycle, epoch } = lead;
        if !self.waiters.is_current(cycle) {
            debug!("Refresh cycle {} was abandoned before it started", cycle);
            return;
        }
        debug!("Refreshing access token (cycle {})", cycle);

        match self.refresh_tokens(epoch).await {
            Ok(token) => {
                info!("Access token refreshed");
                settle_all(self.waiters.take(cycle), Ok(token));
            }
            Err(err) => {
                let kind = match err.kind() {
                    ErrorKind::Session(kind) => kind,
                    _ => SessionErrorKind::RefreshFailed,
                };
                let waiters = self.waiters.take(cycle);
                if kind == SessionErrorKind::RefreshFailed {
                    warn!("Token refresh failed, signing out: {}", err);
                    self.store.clear_if_epoch(epoch);
                }
                settle_all(waiters, Err((kind, err.to_string())));
            }
        }
    }

    async fn refresh_tokens(&self, epoch: u64) -> Result<SecretString, Error> {
        let (credentials, current) = self.store.get_with_epoch();
        if current != epoch {
            return Err(session_error(
                SessionErrorKind::SessionEnded,
                "Session ended before token refresh",
            ));
        }
        let refresh_token = credentials.refresh_token.ok_or_else(|| {
            session_error(SessionErrorKind::RefreshFailed, "No refresh token held")
        })?;

        let tokens = self
            .transport
            .execute(&ApiRequest::refresh(&refresh_token), None)
            .await
            .and_then(|response| TokenPair::from_response(&response))
            .map_err(|err| Error {
                source: Some(Box::new(err)),
                error_kind: ErrorKind::Session(SessionErrorKind::RefreshFailed),
            })?;

        let access_token = tokens.access_token.clone();
        if !self
            .store
            .set_if_epoch(epoch, tokens.access_token, tokens.refresh_token)
        {
            return Err(session_error(
                SessionErrorKind::SessionEnded,
                "Session ended during token refresh",
            ));
        }

        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RequestKind;
    use async_trait::async_trait;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use std::sync::Mutex;

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    /// Accepts only `valid` as access token; refresh hands out `next`.
    struct StaticServer {
        valid: Mutex<String>,
        next: String,
        refresh_ok: bool,
        calls: Mutex<Vec<(RequestKind, u8, Option<String>)>>,
    }

    impl StaticServer {
        fn new(valid: &str, next: &str, refresh_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                valid: Mutex::new(valid.to_string()),
                next: next.to_string(),
                refresh_ok,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls_of(&self, kind: RequestKind) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _, _)| *k == kind)
                .count()
        }
    }

    #[async_trait]
    impl HttpTransport for StaticServer {
        async fn execute(
            &self,
            request: &ApiRequest,
            access_token: Option<&SecretString>,
        ) -> Result<ApiResponse, Error> {
            let token = access_token.map(|t| t.expose_secret().clone());
            self.calls
                .lock()
                .unwrap()
                .push((request.kind(), request.attempt(), token.clone()));

            match request.kind() {
                RequestKind::Refresh if self.refresh_ok => {
                    *self.valid.lock().unwrap() = self.next.clone();
                    Ok(ApiResponse {
                        status: 200,
                        body: json!({ "accessToken": self.next, "refreshToken": "r2" }),
                    })
                }
                RequestKind::Refresh => Err(session_error(
                    SessionErrorKind::AuthExpired,
                    "refresh token revoked",
                )),
                RequestKind::Login => Ok(ApiResponse {
                    status: 200,
                    body: json!({
                        "accessToken": "a1",
                        "refreshToken": "r1",
                        "user": { "id": "u1" }
                    }),
                }),
                _ if token.as_deref() == Some(self.valid.lock().unwrap().as_str()) => {
                    Ok(ApiResponse {
                        status: 200,
                        body: json!({ "path": request.path() }),
                    })
                }
                _ => Err(session_error(SessionErrorKind::AuthExpired, "jwt expired")),
            }
        }
    }

    fn coordinator(server: &Arc<StaticServer>) -> RefreshCoordinator {
        RefreshCoordinator::new(CredentialStore::new(), server.clone())
    }

    #[tokio::test]
    async fn test_request_without_session_is_not_sent() {
        let server = StaticServer::new("a1", "a2", true);
        let api = coordinator(&server);

        let err = api.get("/jobs").await.unwrap_err();

        assert_eq!(
            err.kind(),
            ErrorKind::Session(SessionErrorKind::NotAuthenticated)
        );
        assert!(server.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_login_stores_session() {
        let server = StaticServer::new("a1", "a2", true);
        let api = coordinator(&server);

        let session = api.login("ada@example.com", "pw").await.unwrap();

        assert_eq!(session.user_id().as_deref(), Some("u1"));
        assert_eq!(api.store().user_id().as_deref(), Some("u1"));
        assert!(api.get("/jobs").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_request_replayed() {
        let server = StaticServer::new("a2", "a2", true);
        let api = coordinator(&server);
        api.store().login(secret("a1"), Some(secret("r1")), None);

        let response = api.get("/jobs").await.unwrap();

        assert_eq!(response.body["path"], "/jobs");
        assert_eq!(server.calls_of(RequestKind::Refresh), 1);
        assert_eq!(api.store().access_token().unwrap().expose_secret(), "a2");
        assert_eq!(api.store().refresh_token().unwrap().expose_secret(), "r2");
        let calls = server.calls.lock().unwrap();
        assert_eq!(calls.last().unwrap().1, 1, "replay carries attempt 1");
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        struct NotFound;

        #[async_trait]
        impl HttpTransport for NotFound {
            async fn execute(
                &self,
                _request: &ApiRequest,
                _access_token: Option<&SecretString>,
            ) -> Result<ApiResponse, Error> {
                Err(http_error(HttpErrorKind::Status(404), "missing"))
            }
        }

        let api = RefreshCoordinator::new(CredentialStore::new(), Arc::new(NotFound));
        api.store().login(secret("a1"), Some(secret("r1")), None);

        let err = api.get("/jobs/9").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(!api.is_refreshing());
        assert!(api.store().is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_store() {
        let server = StaticServer::new("a2", "a2", false);
        let api = coordinator(&server);
        api.store().login(secret("a1"), Some(secret("r1")), None);

        let err = api.get("/jobs").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Session(SessionErrorKind::RefreshFailed));
        assert!(err.is_terminal_auth());
        assert!(!api.store().is_authenticated());
        assert_eq!(server.calls_of(RequestKind::Refresh), 1);
    }

    #[tokio::test]
    async fn test_logout_clears_and_notifies_server() {
        let server = StaticServer::new("a1", "a2", true);
        let api = coordinator(&server);
        api.store().login(secret("a1"), Some(secret("r1")), None);

        api.logout().await;

        assert!(!api.store().is_authenticated());
        let calls = server.calls.lock().unwrap();
        assert_eq!(
            calls.last().unwrap(),
            &(RequestKind::Logout, 0, Some("a1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_login_rejection_is_not_auth_expired() {
        struct Reject;

        #[async_trait]
        impl HttpTransport for Reject {
            async fn execute(
                &self,
                _request: &ApiRequest,
                _access_token: Option<&SecretString>,
            ) -> Result<ApiResponse, Error> {
                Err(session_error(SessionErrorKind::AuthExpired, "bad password"))
            }
        }

        let api = RefreshCoordinator::new(CredentialStore::new(), Arc::new(Reject));
        let err = api.login("ada@example.com", "nope").await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert!(!err.is_auth_expired());
        assert!(!api.store().is_authenticated());
    }
}
