use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// API base URL used when `API_BASE_URL` is not set or is empty.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";

/// Realtime server URL used when `SOCKET_URL` is not set or is empty.
pub const DEFAULT_SOCKET_URL: &str = "http://localhost:5000";

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Base URL of the marketplace REST API. Every auth and resource path is
    /// appended to this value.
    #[arg(long, env, default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    /// Base URL of the realtime server. The Socket.IO path is appended to it.
    #[arg(long, env, default_value = DEFAULT_SOCKET_URL)]
    socket_url: String,

    /// Timeout in seconds for a single HTTP request
    #[arg(long, env, default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Number of times a request that failed with a transient network error is
    /// retried by the HTTP client. Zero leaves retrying to the caller.
    #[arg(long, env, default_value_t = 0)]
    pub http_max_retries: u32,

    /// Timeout in seconds for opening the realtime connection, including the
    /// server's connect acknowledgment
    #[arg(long, env, default_value_t = 20)]
    pub connect_timeout_secs: u64,

    /// Delay in milliseconds before the first reconnection attempt
    #[arg(long, env, default_value_t = 1000)]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound in milliseconds for the delay between reconnection attempts
    #[arg(long, env, default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Number of reconnection attempts before the realtime connection gives up
    #[arg(long, env, default_value_t = 5)]
    pub reconnect_max_attempts: u32,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,

    /// Email used by the demo client to log in
    #[arg(long, env = "SESSION_EMAIL")]
    pub email: Option<String>,

    /// Password used by the demo client to log in
    #[arg(long, env = "SESSION_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    /// Returns the API base URL without a trailing slash, falling back to the
    /// default when the configured value is blank.
    pub fn api_base_url(&self) -> &str {
        non_blank_or(&self.api_base_url, DEFAULT_API_BASE_URL)
    }

    /// Returns the realtime server URL without a trailing slash, falling back
    /// to the default when the configured value is blank.
    pub fn socket_url(&self) -> &str {
        non_blank_or(&self.socket_url, DEFAULT_SOCKET_URL)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }
}

fn non_blank_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}
