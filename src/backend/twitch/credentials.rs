use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, TwitchError};

/// Lifetime assumed for a token when the platform does not report one
pub fn default_token_lifetime() -> Duration {
    Duration::days(60)
}

/// Platform credentials as configured by the user
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub broadcaster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_id: Option<String>,
}

impl Credentials {
    /// Both a refresh token and a client secret are needed to refresh
    pub fn can_refresh(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.refresh_token) && present(&self.client_secret)
    }

    /// Checks the fields every connect attempt depends on
    pub fn require_connectable(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.client_id.trim().is_empty() {
            missing.push("clientId");
        }
        if self.access_token.trim().is_empty() {
            missing.push("accessToken");
        }
        if self.broadcaster_id.trim().is_empty() {
            missing.push("broadcasterId");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TwitchError::Configuration(format!(
                "Missing Twitch credentials: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Credentials together with their computed expiry, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub saved_at: DateTime<Utc>,
}

/// File-backed credential storage.
///
/// The file holds a single JSON object; this store owns the record under
/// its key and leaves other keys alone.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    key: String,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Persist credentials, replacing any previous record.
    ///
    /// `expires_in` comes from the token endpoint; when absent the default
    /// lifetime is assumed.
    pub fn save(
        &self,
        credentials: &Credentials,
        expires_in: Option<Duration>,
    ) -> Result<StoredCredentials> {
        let now = Utc::now();
        let stored = StoredCredentials {
            credentials: credentials.clone(),
            expires_at: now + expires_in.unwrap_or_else(default_token_lifetime),
            saved_at: now,
        };

        let mut records = self.read_records();
        records.insert(self.key.clone(), serde_json::to_value(&stored)?);
        self.write_records(&records)?;

        log::debug!(
            "Saved credentials under '{}' (expires at {})",
            self.key,
            stored.expires_at
        );
        Ok(stored)
    }

    /// Load the stored record. Missing or corrupt data yields `None`.
    pub fn load(&self) -> Option<StoredCredentials> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::error!("Failed to read credentials from {:?}: {}", self.path, e);
                return None;
            }
        };

        let records: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_str(&content) {
                Ok(records) => records,
                Err(e) => {
                    log::error!("Error parsing credentials file {:?}: {}", self.path, e);
                    return None;
                }
            };

        let record = records.get(&self.key)?.clone();
        match serde_json::from_value(record) {
            Ok(stored) => Some(stored),
            Err(e) => {
                log::error!("Error parsing credentials under '{}': {}", self.key, e);
                None
            }
        }
    }

    /// Remove the stored record. Calling it with nothing stored is fine.
    pub fn clear(&self) -> Result<()> {
        let mut records = self.read_records();
        if records.remove(&self.key).is_none() {
            return Ok(());
        }

        self.write_records(&records)?;
        log::info!("Cleared stored credentials '{}'", self.key);
        Ok(())
    }

    /// Existing records, or an empty map when the file is absent or unreadable
    fn read_records(&self) -> serde_json::Map<String, serde_json::Value> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn write_records(&self, records: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(records)?)?;
        Ok(())
    }
}
