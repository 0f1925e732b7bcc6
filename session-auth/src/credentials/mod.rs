//! Credential state shared by the HTTP and realtime halves of the session.

mod store;

pub use store::{AuthChange, AuthListener, AuthSnapshot, CredentialStore, Credentials};
