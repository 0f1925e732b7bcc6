//! # session-auth
//!
//! Authentication half of the marketplace session layer:
//! - `CredentialStore`: the single source of truth for access/refresh tokens
//! - `RefreshCoordinator`: attaches credentials to API requests and makes
//!   expired access tokens transparent through a single-flight refresh
//! - HTTP client building with middleware and a shared backoff policy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use session_auth::{
//!     api::{ApiRequest, ReqwestTransport},
//!     credentials::CredentialStore,
//!     http::HttpClientBuilder,
//!     refresh::RefreshCoordinator,
//! };
//!
//! let store = CredentialStore::new();
//! let client = HttpClientBuilder::new().build()?;
//! let transport = ReqwestTransport::new(client, "http://localhost:5000/api");
//! let api = RefreshCoordinator::new(store.clone(), Arc::new(transport));
//!
//! api.login("ada@example.com", "secret").await?;
//! let jobs = api.request(ApiRequest::get("/jobs")).await?;
//! ```

pub mod api;
pub mod credentials;
pub mod error;
pub mod http;
pub mod refresh;

// Re-export commonly used types
pub use credentials::{AuthChange, AuthListener, CredentialStore, Credentials};
pub use error::{Error, ErrorKind};
pub use refresh::RefreshCoordinator;
