//! Single-flight access token refresh.
//!
//! The first request to see an expired access token leads a refresh cycle;
//! requests that fail while the cycle is running wait in a FIFO queue and are
//! replayed, each exactly once, with the refreshed token.

mod coordinator;
mod queue;

pub use coordinator::RefreshCoordinator;
