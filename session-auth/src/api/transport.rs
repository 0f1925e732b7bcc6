use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, trace};

use super::{ApiRequest, ApiResponse};
use crate::error::{http_error, session_error, Error, HttpErrorKind, SessionErrorKind};
use crate::http::HttpClient;

/// Executes a single API request exactly once.
///
/// Implementations attach `access_token` as a bearer token when given and map
/// the response onto the session error taxonomy with [`classify`]: 2xx is
/// success, 401 is `AuthExpired`, anything else is `Http(Status(_))`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&SecretString>,
    ) -> Result<ApiResponse, Error>;
}

/// Maps a status code and decoded body onto a response or an error.
pub fn classify(status: u16, body: Value) -> Result<ApiResponse, Error> {
    match status {
        200..=299 => Ok(ApiResponse { status, body }),
        401 => Err(session_error(
            SessionErrorKind::AuthExpired,
            &server_message(&body).unwrap_or_else(|| "Unauthorized".to_string()),
        )),
        _ => Err(http_error(
            HttpErrorKind::Status(status),
            &server_message(&body).unwrap_or_else(|| format!("Request failed with {status}")),
        )),
    }
}

fn server_message(body: &Value) -> Option<String> {
    match body {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// [`HttpTransport`] over a reqwest client with middleware.
pub struct ReqwestTransport {
    client: HttpClient,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(client: HttpClient, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&SecretString>,
    ) -> Result<ApiResponse, Error> {
        let url = self.url_for(request.path());
        debug!(
            "{} {} (kind: {:?}, attempt: {})",
            request.method(),
            url,
            request.kind(),
            request.attempt()
        );

        let mut builder = self.client.request(request.method().clone(), &url);
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        trace!("{} {} -> {} ({} bytes)", request.method(), url, status, text.len());

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        classify(status, body)
    }
}
