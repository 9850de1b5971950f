use serde::{Deserialize, Serialize};
use serde_json::json;

use super::auth::TokenManager;
use super::credentials::Credentials;
use super::error::{Result, TwitchError};
use super::messages::Topic;

pub const EVENTSUB_API_URL: &str = "https://api.twitch.tv/helix/eventsub/subscriptions";

/// Declarative description of a desired event feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub topic: Topic,
    pub version: String,
    pub condition: serde_json::Value,
}

impl Subscription {
    fn new(topic: Topic, version: &str, condition: serde_json::Value) -> Self {
        Self {
            topic,
            version: version.to_string(),
            condition,
        }
    }
}

/// The fixed subscription set. Follows need a moderator id and are left
/// out without one.
pub fn fixed_subscriptions(broadcaster_id: &str, moderator_id: Option<&str>) -> Vec<Subscription> {
    let mut subscriptions = vec![Subscription::new(
        Topic::ChatMessage,
        "1",
        json!({
            "broadcaster_user_id": broadcaster_id,
            "user_id": broadcaster_id
        }),
    )];

    if let Some(moderator_id) = moderator_id.filter(|id| !id.is_empty()) {
        subscriptions.push(Subscription::new(
            Topic::Follow,
            "2",
            json!({
                "broadcaster_user_id": broadcaster_id,
                "moderator_user_id": moderator_id
            }),
        ));
    }

    subscriptions.push(Subscription::new(
        Topic::Subscribe,
        "1",
        json!({ "broadcaster_user_id": broadcaster_id }),
    ));
    subscriptions.push(Subscription::new(
        Topic::Cheer,
        "1",
        json!({ "broadcaster_user_id": broadcaster_id }),
    ));
    subscriptions.push(Subscription::new(
        Topic::Raid,
        "1",
        json!({ "to_broadcaster_user_id": broadcaster_id }),
    ));

    subscriptions
}

/// EventSub subscription request body
#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    #[serde(flatten)]
    subscription: &'a Subscription,
    transport: Transport<'a>,
}

#[derive(Debug, Serialize)]
struct Transport<'a> {
    method: &'static str,
    session_id: &'a str,
}

/// EventSub subscription response
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionResponse {
    #[serde(default)]
    pub data: Vec<SubscriptionData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionData {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// Which topics were subscribed during a handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSummary {
    pub succeeded: Vec<Topic>,
    pub failed: Vec<Topic>,
}

/// Creates EventSub subscriptions over Helix
#[derive(Debug, Clone)]
pub struct EventSubManager {
    client: reqwest::Client,
    url: String,
}

impl EventSubManager {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// OAuth scope a topic needs, for 403 diagnostics
    fn required_scope(topic: Topic) -> &'static str {
        match topic {
            Topic::ChatMessage => "user:read:chat",
            Topic::Follow => "moderator:read:followers",
            Topic::Subscribe => "channel:read:subscriptions",
            Topic::Cheer => "bits:read",
            Topic::Raid => "none",
        }
    }

    async fn post(
        &self,
        subscription: &Subscription,
        session_id: &str,
        credentials: &Credentials,
    ) -> Result<reqwest::Response> {
        let request = SubscriptionRequest {
            subscription,
            transport: Transport {
                method: "websocket",
                session_id,
            },
        };

        let response = self
            .client
            .post(&self.url)
            .header("Client-ID", &credentials.client_id)
            .header("Authorization", format!("Bearer {}", credentials.access_token))
            .json(&request)
            .send()
            .await
            .map_err(|e| TwitchError::Subscription {
                topic: subscription.topic,
                reason: e.to_string(),
            })?;

        Ok(response)
    }

    /// Create one subscription.
    ///
    /// A 401 triggers a single forced token refresh (once per round, tracked
    /// by `refreshed`) and one retry with the new token.
    async fn create_subscription(
        &self,
        subscription: &Subscription,
        session_id: &str,
        tokens: &TokenManager,
        credentials: &mut Credentials,
        refreshed: &mut bool,
    ) -> Result<SubscriptionResponse> {
        let mut response = self.post(subscription, session_id, credentials).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            && !*refreshed
            && credentials.can_refresh()
        {
            log::warn!("EventSub subscription got 401, refreshing token and retrying...");
            *refreshed = true;
            *credentials = tokens.force_refresh(credentials).await?;
            response = self.post(subscription, session_id, credentials).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            if status == reqwest::StatusCode::FORBIDDEN {
                log::warn!(
                    "⚠ Skipped '{}' - Missing OAuth scope: {}",
                    subscription.topic,
                    Self::required_scope(subscription.topic)
                );
            }

            return Err(TwitchError::Subscription {
                topic: subscription.topic,
                reason: format!("HTTP {}: {}", status, error_text),
            });
        }

        response
            .json::<SubscriptionResponse>()
            .await
            .map_err(|e| TwitchError::Subscription {
                topic: subscription.topic,
                reason: e.to_string(),
            })
    }

    /// Subscribe to every fixed topic in order, continuing past failures.
    ///
    /// `keep_going` is checked before each topic; once it returns false the
    /// remaining topics are left out of the summary entirely.
    pub async fn subscribe_all(
        &self,
        session_id: &str,
        tokens: &TokenManager,
        credentials: &mut Credentials,
        keep_going: impl Fn() -> bool,
    ) -> SubscriptionSummary {
        log::info!("Creating EventSub subscriptions...");
        let subscriptions =
            fixed_subscriptions(&credentials.broadcaster_id, credentials.moderator_id.as_deref());
        if credentials.moderator_id.is_none() {
            log::info!("No moderator id configured, skipping {}", Topic::Follow);
        }

        let mut summary = SubscriptionSummary::default();
        let mut refreshed = false;

        for subscription in &subscriptions {
            if !keep_going() {
                log::info!("Session {} ended while subscribing, stopping", session_id);
                return summary;
            }

            match self
                .create_subscription(subscription, session_id, tokens, credentials, &mut refreshed)
                .await
            {
                Ok(_) => {
                    log::info!("✓ Subscribed to {}", subscription.topic);
                    summary.succeeded.push(subscription.topic);
                }
                Err(e) => {
                    log::error!("✗ Failed to subscribe to {}: {}", subscription.topic, e);
                    summary.failed.push(subscription.topic);
                }
            }
        }

        log::info!(
            "Subscriptions complete: {} succeeded, {} failed",
            summary.succeeded.len(),
            summary.failed.len()
        );

        if summary.succeeded.is_empty() {
            log::error!("All EventSub subscriptions failed - no channel events will arrive!");
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::twitch::{CredentialStore, OAuthEndpoints};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HELIX_PATH: &str = "/helix/eventsub/subscriptions";

    fn credentials() -> Credentials {
        Credentials {
            client_id: "cid".to_string(),
            client_secret: Some("csecret".to_string()),
            access_token: "A1".to_string(),
            refresh_token: Some("R1".to_string()),
            broadcaster_id: "42".to_string(),
            moderator_id: None,
        }
    }

    /// Token manager whose refresh endpoint lives on `server` and hands out A2
    async fn refreshing_manager(server: &MockServer, dir: &tempfile::TempDir) -> TokenManager {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A2",
                "refresh_token": "R2",
                "expires_in": 3600,
                "scope": [],
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(server)
            .await;

        let store = CredentialStore::new(dir.path().join("credentials.json"), "twitchConfig");
        store
            .save(&credentials(), Some(chrono::Duration::hours(1)))
            .unwrap();
        let endpoints = OAuthEndpoints {
            token_url: format!("{}/oauth2/token", server.uri()),
            ..OAuthEndpoints::default()
        };
        TokenManager::new(store, reqwest::Client::new(), endpoints)
    }

    async fn bearer_tokens(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == HELIX_PATH)
            .map(|request| {
                request
                    .headers
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    fn manager_for(server: &MockServer) -> EventSubManager {
        EventSubManager::new(
            reqwest::Client::new(),
            format!("{}{}", server.uri(), HELIX_PATH),
        )
    }

    fn accept_all() -> ResponseTemplate {
        ResponseTemplate::new(202).set_body_json(json!({
            "data": [{"id": "sub-1", "status": "enabled"}]
        }))
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_retries() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let tokens = refreshing_manager(&server, &dir).await;

        Mock::given(method("POST"))
            .and(path(HELIX_PATH))
            .and(header("Authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(HELIX_PATH))
            .respond_with(accept_all())
            .mount(&server)
            .await;

        let manager = manager_for(&server);
        let mut credentials = credentials();
        let summary = manager
            .subscribe_all("S1", &tokens, &mut credentials, || true)
            .await;

        assert_eq!(
            summary.succeeded,
            vec![Topic::ChatMessage, Topic::Subscribe, Topic::Cheer, Topic::Raid]
        );
        assert!(summary.failed.is_empty());
        assert_eq!(
            bearer_tokens(&server).await,
            vec!["Bearer A1", "Bearer A2", "Bearer A2", "Bearer A2", "Bearer A2"]
        );
        assert_eq!(credentials.access_token, "A2");

        let stored = tokens.store().load().unwrap();
        assert_eq!(stored.credentials.access_token, "A2");
        assert_eq!(stored.credentials.refresh_token.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_second_unauthorized_does_not_refresh_again() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let tokens = refreshing_manager(&server, &dir).await;

        Mock::given(method("POST"))
            .and(path(HELIX_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let manager = manager_for(&server);
        let mut credentials = credentials();
        let summary = manager
            .subscribe_all("S1", &tokens, &mut credentials, || true)
            .await;

        assert!(summary.succeeded.is_empty());
        assert_eq!(summary.failed.len(), 4);
        // One retry after the single refresh, then one attempt per remaining topic
        assert_eq!(bearer_tokens(&server).await.len(), 5);
    }

    #[tokio::test]
    async fn test_stops_when_told_to() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HELIX_PATH))
            .respond_with(accept_all())
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"), "twitchConfig");
        let tokens = TokenManager::new(store, reqwest::Client::new(), OAuthEndpoints::default());
        let manager = manager_for(&server);

        let checks = AtomicUsize::new(0);
        let summary = manager
            .subscribe_all("S1", &tokens, &mut credentials(), || {
                checks.fetch_add(1, Ordering::SeqCst) < 2
            })
            .await;

        assert_eq!(summary.succeeded, vec![Topic::ChatMessage, Topic::Subscribe]);
        assert!(summary.failed.is_empty());
        assert_eq!(bearer_tokens(&server).await.len(), 2);
    }

    #[test]
    fn test_fixed_subscriptions_without_moderator() {
        let subscriptions = fixed_subscriptions("42", None);
        let topics: Vec<Topic> = subscriptions.iter().map(|s| s.topic).collect();
        assert_eq!(
            topics,
            vec![Topic::ChatMessage, Topic::Subscribe, Topic::Cheer, Topic::Raid]
        );
        assert_eq!(subscriptions[0].condition["user_id"], "42");
        assert_eq!(subscriptions[3].condition["to_broadcaster_user_id"], "42");
    }

    #[test]
    fn test_fixed_subscriptions_with_moderator() {
        let subscriptions = fixed_subscriptions("42", Some("7"));
        assert_eq!(subscriptions.len(), 5);
        let follow = &subscriptions[1];
        assert_eq!(follow.topic, Topic::Follow);
        assert_eq!(follow.version, "2");
        assert_eq!(follow.condition["moderator_user_id"], "7");
    }

    #[test]
    fn test_request_body_shape() {
        let subscriptions = fixed_subscriptions("42", None);
        let body = serde_json::to_value(SubscriptionRequest {
            subscription: &subscriptions[2],
            transport: Transport {
                method: "websocket",
                session_id: "S1",
            },
        })
        .unwrap();

        assert_eq!(
            body,
            json!({
                "type": "channel.cheer",
                "version": "1",
                "condition": {"broadcaster_user_id": "42"},
                "transport": {"method": "websocket", "session_id": "S1"}
            })
        );
    }
}
