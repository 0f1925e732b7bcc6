//! Payloads of the login and refresh endpoints.

use secrecy::SecretString;
use serde::Deserialize;

use super::ApiResponse;
use crate::error::{http_error, Error, HttpErrorKind};

/// Tokens returned by login and refresh.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    #[serde(alias = "token", alias = "access_token")]
    pub access_token: SecretString,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<SecretString>,
}

/// The signed-in user as reported by the login endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionUser {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub tokens: TokenPair,
    pub user: Option<SessionUser>,
}

impl AuthSession {
    pub fn from_response(response: &ApiResponse) -> Result<Self, Error> {
        let tokens: TokenPair = response.json().map_err(|e| {
            http_error(
                HttpErrorKind::InvalidResponse,
                &format!("Login response is missing tokens: {e}"),
            )
        })?;
        let user = match response.data().get("user") {
            Some(user) if !user.is_null() => Some(SessionUser::deserialize(user)?),
            _ => None,
        };
        Ok(Self { tokens, user })
    }

    pub fn user_id(&self) -> Option<String> {
        self.user.as_ref().map(|user| user.id.clone())
    }
}

impl TokenPair {
    pub fn from_response(response: &ApiResponse) -> Result<Self, Error> {
        response.json().map_err(|e| {
            http_error(
                HttpErrorKind::InvalidResponse,
                &format!("Refresh response is missing tokens: {e}"),
            )
        })
    }
}
