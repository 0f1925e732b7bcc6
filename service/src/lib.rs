//! Infrastructure shared by every crate in the session workspace: command line
//! and environment configuration, and console logging.

pub mod config;
pub mod logging;
