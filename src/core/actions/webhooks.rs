//! Runtime-registered webhook subscriptions.
//!
//! Subscriptions live in memory only. Each delivery body may be signed with
//! the subscription secret as `X-Signature: sha256=<hex hmac>`.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::core::errors::{RuntimeError, RuntimeResult};

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub event: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub secret: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /webhook/create`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateWebhookRequest {
    pub event: String,
    pub url: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Generated when absent
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Default)]
pub struct WebhookRegistry {
    subscriptions: scc::HashMap<String, WebhookSubscription>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, request: CreateWebhookRequest) -> RuntimeResult<WebhookSubscription> {
        if request.event.trim().is_empty() || request.url.trim().is_empty() {
            return Err(RuntimeError::ActionConfigInvalid(
                "event and url are required".to_string(),
            ));
        }
        let parsed = url::Url::parse(&request.url).map_err(|e| {
            RuntimeError::ActionConfigInvalid(format!("invalid webhook url '{}': {e}", request.url))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RuntimeError::ActionConfigInvalid(format!(
                "webhook url must be http or https: {}",
                request.url
            )));
        }

        let subscription = WebhookSubscription {
            id: uuid::Uuid::new_v4().to_string(),
            event: request.event,
            url: request.url,
            headers: request.headers.unwrap_or_default(),
            secret: request
                .secret
                .filter(|s| !s.is_empty())
                .unwrap_or_else(generate_secret),
            enabled: request.enabled.unwrap_or(true),
            created_at: Utc::now(),
        };

        if self
            .subscriptions
            .insert_async(subscription.id.clone(), subscription.clone())
            .await
            .is_err()
        {
            return Err(RuntimeError::ActionConfigInvalid(format!(
                "webhook id collision: {}",
                subscription.id
            )));
        }
        tracing::info!(
            id = %subscription.id,
            event = %subscription.event,
            url = %subscription.url,
            "Webhook created"
        );
        Ok(subscription)
    }

    pub async fn get(&self, id: &str) -> Option<WebhookSubscription> {
        self.subscriptions
            .get_async(&id.to_string())
            .await
            .map(|entry| entry.get().clone())
    }

    pub async fn remove(&self, id: &str) -> bool {
        let removed = self
            .subscriptions
            .remove_async(&id.to_string())
            .await
            .is_some();
        if removed {
            tracing::info!(id, "Webhook deleted");
        }
        removed
    }

    /// Every subscription, newest first.
    pub async fn list(&self) -> Vec<WebhookSubscription> {
        let mut all = Vec::new();
        self.subscriptions
            .retain_async(|_, subscription| {
                all.push(subscription.clone());
                true
            })
            .await;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Enabled subscriptions for `event`.
    pub async fn for_event(&self, event: &str) -> Vec<WebhookSubscription> {
        let mut matching = Vec::new();
        self.subscriptions
            .retain_async(|_, subscription| {
                if subscription.enabled && subscription.event == event {
                    matching.push(subscription.clone());
                }
                true
            })
            .await;
        matching
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check an `X-Signature` header value against `body`.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(event: &str, url: &str) -> CreateWebhookRequest {
        CreateWebhookRequest {
            event: event.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_list_remove() {
        let registry = WebhookRegistry::new();
        let created = registry
            .create(request("created", "http://127.0.0.1:9000/hook"))
            .await
            .unwrap();
        assert!(created.enabled);
        assert_eq!(created.secret.len(), 64);

        registry
            .create(CreateWebhookRequest {
                enabled: Some(false),
                ..request("created", "http://127.0.0.1:9001/hook")
            })
            .await
            .unwrap();

        assert_eq!(registry.list().await.len(), 2);
        assert_eq!(registry.for_event("created").await.len(), 1);
        assert!(registry.for_event("deleted").await.is_empty());

        assert!(registry.remove(&created.id).await);
        assert!(!registry.remove(&created.id).await);
        assert!(registry.get(&created.id).await.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let registry = WebhookRegistry::new();
        for bad in [
            request("", "http://x/hook"),
            request("created", ""),
            request("created", "not a url"),
            request("created", "ftp://files/hook"),
        ] {
            assert!(matches!(
                registry.create(bad).await,
                Err(RuntimeError::ActionConfigInvalid(_))
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_signature_roundtrip() {
        let body = br#"{"action":"created"}"#;
        let signature = sign_payload("s3cret", body);
        assert_eq!(signature.len(), 64);
        assert!(verify_signature("s3cret", body, &format!("sha256={signature}")));
        assert!(!verify_signature("other", body, &format!("sha256={signature}")));
        assert!(!verify_signature("s3cret", body, &signature));
    }
}
