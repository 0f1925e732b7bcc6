//! API request descriptors and the transport that executes them.

mod request;
mod session;
mod transport;

pub use request::{ApiRequest, ApiResponse, RequestKind};
pub use session::{AuthSession, SessionUser, TokenPair};
pub use transport::{classify, HttpTransport, ReqwestTransport};

/// Path of the login endpoint, relative to the API base URL.
pub const LOGIN_PATH: &str = "/auth/login";
/// Path of the refresh endpoint, relative to the API base URL.
pub const REFRESH_PATH: &str = "/auth/refresh";
/// Path of the logout endpoint, relative to the API base URL.
pub const LOGOUT_PATH: &str = "/auth/logout";
