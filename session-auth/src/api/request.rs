use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};

/// What role a request plays in the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Ordinary API call carrying the bearer token.
    Api,
    Login,
    /// The refresh call itself. Never re-enters the refresh protocol.
    Refresh,
    Logout,
}

impl RequestKind {
    /// Whether an authorization-expired response may trigger a refresh.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, RequestKind::Api)
    }

    /// Whether the bearer token is attached.
    pub fn sends_access_token(&self) -> bool {
        matches!(self, RequestKind::Api | RequestKind::Logout)
    }
}

/// Immutable description of an API request.
///
/// Replaying a request after a refresh produces a new descriptor through
/// [`ApiRequest::retried`]; the attempt counter is what stops a request from
/// entering the refresh protocol twice for the same expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<Value>,
    kind: RequestKind,
    attempt: u8,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            kind: RequestKind::Api,
            attempt: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn login(email: &str, password: &str) -> Self {
        Self::post(LOGIN_PATH, json!({ "email": email, "password": password }))
            .with_kind(RequestKind::Login)
    }

    pub fn refresh(refresh_token: &SecretString) -> Self {
        Self::post(
            REFRESH_PATH,
            json!({ "refreshToken": refresh_token.expose_secret() }),
        )
        .with_kind(RequestKind::Refresh)
    }

    pub fn logout(refresh_token: Option<&SecretString>) -> Self {
        let body = match refresh_token {
            Some(token) => json!({ "refreshToken": token.expose_secret() }),
            None => json!({}),
        };
        Self::post(LOGOUT_PATH, body).with_kind(RequestKind::Logout)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }

    /// The same request, one attempt later.
    pub fn retried(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn attempt(&self) -> u8 {
        self.attempt
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    /// The payload, unwrapped from a `{"data": ...}` envelope when present.
    pub fn data(&self) -> &Value {
        match self.body.get("data") {
            Some(data) => data,
            None => &self.body,
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.data())
    }
}
