use log::{error, info, warn};
use realtime::{
    ApiUnreadSource, ConnectionConfig, ConnectionManager, PresenceTracker, SocketIoConnector,
    UnreadAggregator,
};
use service::{config::Config, logging::Logger};
use session_auth::api::ReqwestTransport;
use session_auth::http::{Backoff, HttpClientBuilder};
use session_auth::{CredentialStore, RefreshCoordinator};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::new();
    Logger::init_logger(&config as &Config);

    info!(
        "Starting session client [{}] against {}",
        config.runtime_env(),
        config.api_base_url()
    );

    let http = HttpClientBuilder::new()
        .with_timeout(config.http_timeout())
        .with_max_retries(config.http_max_retries)
        .build()
        .inspect_err(|e| error!("Failed to build HTTP client: {e}"))?;

    let store = CredentialStore::new();
    let api = RefreshCoordinator::new(
        store.clone(),
        Arc::new(ReqwestTransport::new(http, config.api_base_url())),
    );

    let manager = ConnectionManager::new(
        store.clone(),
        Arc::new(SocketIoConnector::new(config.socket_url())),
        ConnectionConfig {
            connect_timeout: config.connect_timeout(),
            backoff: Backoff::new(config.reconnect_max_attempts)
                .with_base_delay(config.reconnect_base_delay())
                .with_max_delay(config.reconnect_max_delay())
                .with_jitter(0.2),
        },
    );
    let presence = Arc::new(PresenceTracker::new());
    manager.on(presence.clone());
    let unread = UnreadAggregator::new(store.clone(), Arc::new(ApiUnreadSource::new(api.clone())));
    manager.on(Arc::new(unread.clone()));

    let mut events = manager.subscribe();
    let mut unread_count = unread.watch();
    manager.start();

    match (&config.email, &config.password) {
        (Some(email), Some(password)) => match api.login(email, password).await {
            Ok(session) => info!(
                "Logged in as {}",
                session.user_id().unwrap_or_else(|| email.clone())
            ),
            Err(e) => {
                error!("Login failed: {e}");
                return Err(e.into());
            }
        },
        _ => warn!("No credentials configured, waiting without a session"),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => info!("{event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {skipped} connection events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = unread_count.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *unread_count.borrow_and_update();
                info!("Unread messages: {count} ({} peers online)", presence.len());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    api.logout().await;
    manager.disconnect();
    Ok(())
}
