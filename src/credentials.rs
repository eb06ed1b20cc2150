//! # credentials
//!
//! Resolves decrypted venue API keys for an account at dispatch time.
//! This core never persists plaintext credentials; it asks a
//! [`CredentialResolver`] every time and drops the secret after the call.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::Venue;

/// Decrypted API credentials. `Debug` never prints the secrets.
#[derive(Clone, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    /// Required by OKX, ignored elsewhere.
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

fn mask(key: &str) -> String {
    let head: String = key.chars().take(4).collect();
    format!("{head}…")
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, account_id: Uuid, venue: Venue) -> anyhow::Result<ApiCredentials>;
}

// ─── In-memory ────────────────────────────────────────────────────────────────

/// Resolver backed by a map. Paper venues get a synthetic credential so
/// paper accounts work without a credential service.
#[derive(Default)]
pub struct StaticCredentialResolver {
    entries: RwLock<HashMap<(Uuid, Venue), ApiCredentials>>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, account_id: Uuid, venue: Venue, creds: ApiCredentials) {
        self.entries.write().await.insert((account_id, venue), creds);
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, account_id: Uuid, venue: Venue) -> anyhow::Result<ApiCredentials> {
        if let Some(creds) = self.entries.read().await.get(&(account_id, venue)) {
            return Ok(creds.clone());
        }
        if venue.is_paper() {
            return Ok(ApiCredentials {
                api_key: format!("paper-{account_id}"),
                api_secret: String::new(),
                passphrase: None,
            });
        }
        anyhow::bail!("no {venue} credentials for account {account_id}")
    }
}

// ─── Credential service ───────────────────────────────────────────────────────

/// Fetches credentials from the credential service:
/// `GET {base_url}/credentials/{account_id}/{venue}` with a bearer token.
pub struct HttpCredentialResolver {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCredentialResolver {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl CredentialResolver for HttpCredentialResolver {
    async fn resolve(&self, account_id: Uuid, venue: Venue) -> anyhow::Result<ApiCredentials> {
        let url = format!("{}/credentials/{account_id}/{venue}", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.context("credential service unreachable")?;
        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("credential service returned {status} for account {account_id}/{venue}");
        }
        resp.json().await.context("credential service response parse error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_synthesizes_paper_credentials_only() {
        let resolver = StaticCredentialResolver::new();
        let account = Uuid::new_v4();
        assert!(resolver.resolve(account, Venue::Paper).await.is_ok());
        assert!(resolver.resolve(account, Venue::Binance).await.is_err());
    }

    #[test]
    fn debug_hides_secret() {
        let creds = ApiCredentials {
            api_key: "ABCDEFGH".into(),
            api_secret: "topsecret".into(),
            passphrase: Some("pp".into()),
        };
        let printed = format!("{creds:?}");
        assert!(!printed.contains("topsecret"));
        assert!(!printed.contains("EFGH"));
    }
}
