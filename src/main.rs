use backend::config::{load_config, project_root, AppConfig};
use backend::overlay::{start_overlay_server, OverlayState};
use backend::twitch::{
    build_http_client, ConnectOutcome, CredentialStore, EventSubClient, TokenManager,
};
use log::{error, info, warn};
use std::path::Path;

pub mod backend;

/// Seed the credential store from config.toml when it holds nothing yet
fn seed_credentials(store: &CredentialStore, config: &AppConfig) {
    if store.load().is_some() {
        return;
    }

    match &config.twitch.credentials {
        Some(seed) => match store.save(seed, None) {
            Ok(_) => info!("Seeded credential store from config.toml"),
            Err(e) => error!("Failed to seed credential store: {}", e),
        },
        None => warn!(
            "No Twitch credentials in {:?}; add a [twitch.credentials] section to config.toml",
            store.path()
        ),
    }
}

/// Forward EventSub state changes to the overlays
fn relay_status(client: &EventSubClient, overlay: OverlayState) {
    let mut status = client.watch_state();
    tokio::spawn(async move {
        loop {
            let state = *status.borrow_and_update();
            overlay.set_status(state).await;
            if status.changed().await.is_err() {
                break;
            }
        }
    });
}

fn spawn_overlay_server(config: &AppConfig, root: &Path, overlay: OverlayState) {
    let port = config.overlay.port;
    let assets_dir = root.join(&config.overlay.assets_dir);
    tokio::spawn(async move {
        if let Err(e) = start_overlay_server(port, assets_dir, overlay).await {
            error!("Overlay server error: {}", e);
        }
    });
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let root = match project_root() {
        Ok(root) => root,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    let http = match build_http_client(config.twitch.request_timeout()) {
        Ok(http) => http,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            return;
        }
    };

    let store = CredentialStore::new(
        config.twitch.resolve_credentials_path(&root),
        config.twitch.storage_key.clone(),
    );
    seed_credentials(&store, &config);

    let tokens = TokenManager::new(store, http.clone(), config.twitch.endpoints());
    if let Some(stored) = tokens.store().load() {
        let validation = tokens
            .validate(&stored.credentials.client_id, &stored.credentials.access_token)
            .await;
        match validation.username {
            Some(username) if validation.valid => info!("Token valid for user {}", username),
            _ if validation.valid => info!("Token is valid"),
            _ if stored.credentials.can_refresh() => {
                warn!("Stored token failed validation, refreshing...");
                if let Err(e) = tokens.force_refresh(&stored.credentials).await {
                    error!("{}", e);
                }
            }
            _ => warn!("Stored token failed validation and cannot be refreshed"),
        }
    }

    let client = EventSubClient::new(config.twitch.eventsub_config(), tokens, http);
    let overlay = OverlayState::new();

    if config.overlay.enabled {
        spawn_overlay_server(&config, &root, overlay.clone());
    }
    relay_status(&client, overlay.clone());

    {
        let overlay = overlay.clone();
        client.on_normalized(move |event| overlay.broadcast_event(event));
    }

    match client.connect().await {
        Ok(ConnectOutcome::Connected(summary)) => info!(
            "Listening for channel events: {} topics subscribed, {} failed",
            summary.succeeded.len(),
            summary.failed.len()
        ),
        Ok(ConnectOutcome::AlreadyConnected) => info!("EventSub session already active"),
        Err(e) => error!("Twitch EventSub unavailable: {}", e),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }

    info!("Shutting down...");
    client.disconnect().await;
}
