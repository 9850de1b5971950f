use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::twitch::{
    Credentials, EventSubConfig, OAuthEndpoints, ReconnectPolicy, EVENTSUB_API_URL,
    EVENTSUB_WS_URL,
};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to locate project root: {0}")]
    ProjectRoot(std::io::Error),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub twitch: TwitchSettings,
    pub overlay: OverlaySettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TwitchSettings {
    /// Credential file, relative to the project root unless absolute
    pub credentials_path: PathBuf,
    pub storage_key: String,
    pub eventsub_url: String,
    pub helix_url: String,
    pub token_url: String,
    pub validate_url: String,
    pub revoke_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub reconnect: ReconnectSettings,
    /// Written to the credential store on startup when it holds nothing yet
    pub credentials: Option<Credentials>,
}

impl Default for TwitchSettings {
    fn default() -> Self {
        let endpoints = OAuthEndpoints::default();
        Self {
            credentials_path: PathBuf::from("credentials.json"),
            storage_key: "twitchConfig".to_string(),
            eventsub_url: EVENTSUB_WS_URL.to_string(),
            helix_url: EVENTSUB_API_URL.to_string(),
            token_url: endpoints.token_url,
            validate_url: endpoints.validate_url,
            revoke_url: endpoints.revoke_url,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            reconnect: ReconnectSettings::default(),
            credentials: None,
        }
    }
}

impl TwitchSettings {
    pub fn endpoints(&self) -> OAuthEndpoints {
        OAuthEndpoints {
            token_url: self.token_url.clone(),
            validate_url: self.validate_url.clone(),
            revoke_url: self.revoke_url.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn eventsub_config(&self) -> EventSubConfig {
        EventSubConfig {
            ws_url: self.eventsub_url.clone(),
            helix_url: self.helix_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            reconnect: self.reconnect.policy(),
            ..EventSubConfig::default()
        }
    }

    pub fn resolve_credentials_path(&self, root: &Path) -> PathBuf {
        if self.credentials_path.is_absolute() {
            self.credentials_path.clone()
        } else {
            root.join(&self.credentials_path)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OverlaySettings {
    pub enabled: bool,
    pub port: u16,
    /// Static overlay files, relative to the project root unless absolute
    pub assets_dir: PathBuf,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3000,
            assets_dir: PathBuf::from("assets/overlay"),
        }
    }
}

impl AppConfig {
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, falling back to defaults when the file does not exist
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::from_file(path)
    }
}

pub fn project_root() -> Result<PathBuf, ConfigError> {
    project_root::get_project_root().map_err(ConfigError::ProjectRoot)
}

/// Load `config.toml` from the project root
pub fn load_config() -> Result<AppConfig, ConfigError> {
    AppConfig::load_from(project_root()?.join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("config.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.twitch.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.twitch.storage_key, "twitchConfig");
        assert_eq!(config.overlay.port, 3000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[twitch]
storage_key = "streamer"

[twitch.reconnect]
max_attempts = 3

[twitch.credentials]
clientId = "cid"
accessToken = "token"
broadcasterId = "42"

[overlay]
port = 8080
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.twitch.storage_key, "streamer");
        assert_eq!(config.twitch.eventsub_url, EVENTSUB_WS_URL);

        let policy = config.twitch.reconnect.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));

        let seed = config.twitch.credentials.unwrap();
        assert_eq!(seed.broadcaster_id, "42");
        assert_eq!(seed.refresh_token, None);

        assert!(config.overlay.enabled);
        assert_eq!(config.overlay.port, 8080);
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[overlay]\nport = \"not a number\"\n").unwrap();

        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_credentials_path_resolution() {
        let settings = TwitchSettings::default();
        assert_eq!(
            settings.resolve_credentials_path(Path::new("/srv/relay")),
            PathBuf::from("/srv/relay/credentials.json")
        );

        let absolute = TwitchSettings {
            credentials_path: PathBuf::from("/etc/relay/creds.json"),
            ..TwitchSettings::default()
        };
        assert_eq!(
            absolute.resolve_credentials_path(Path::new("/srv/relay")),
            PathBuf::from("/etc/relay/creds.json")
        );
    }
}
