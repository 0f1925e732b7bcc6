//! HTTP client building with middleware.

mod backoff;
mod client;

pub use backoff::Backoff;
pub use client::{HttpClient, HttpClientBuilder, HttpClientConfig};
