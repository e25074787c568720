//! OIDC authorization-code exchange and user-claim normalization.
//!
//! Scope is the trust boundary of the OIDC flow: build an authorization
//! URL, exchange a code for tokens, and fetch normalized user claims.
//! Wire-level SAML handling is out of scope; [`SsoProvider::Saml`] exists
//! so the broker's outward contract covers both, but its methods report
//! that SAML assertion validation is unimplemented rather than silently
//! no-op.

#![forbid(unsafe_code)]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const STATE_RANDOM_BYTES: usize = 32;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum SsoError {
    #[error("unknown sso provider: {0}")]
    InvalidArgument(String),
    #[error("sso upstream error: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, SsoError>;

/// Provider configuration, mirroring the `{provider, client_id,
/// client_secret, issuer_url, redirect_uri, scopes[]}` wire shape from
/// spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoConfig {
    pub provider: String,
    pub client_id: String,
    pub client_secret: String,
    pub issuer_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub saml_metadata_url: Option<String>,
    pub saml_entity_id: Option<String>,
}

impl SsoConfig {
    pub fn oidc(provider: &str, client_id: &str, client_secret: &str, issuer_url: &str) -> Self {
        Self {
            provider: provider.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            issuer_url: issuer_url.to_string(),
            redirect_uri: "http://127.0.0.1:18789/auth/callback".to_string(),
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
            saml_metadata_url: None,
            saml_entity_id: None,
        }
    }
}

/// Normalized user claims returned by [`SsoProvider::userinfo`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoUser {
    pub external_id: String,
    pub email: String,
    pub name: String,
    pub provider: String,
    pub groups: Vec<String>,
    pub raw_claims: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("failed to build HTTP client")
}

/// A single configured SSO relationship: OIDC or SAML.
pub enum SsoProvider {
    Oidc {
        config: SsoConfig,
        discovery: Mutex<Option<DiscoveryDocument>>,
        client: reqwest::Client,
    },
    Saml {
        config: SsoConfig,
    },
}

impl SsoProvider {
    pub fn oidc(config: SsoConfig) -> Self {
        Self::Oidc {
            config,
            discovery: Mutex::new(None),
            client: build_client(DISCOVERY_TIMEOUT),
        }
    }

    pub fn saml(config: SsoConfig) -> Self {
        Self::Saml { config }
    }

    fn config(&self) -> &SsoConfig {
        match self {
            Self::Oidc { config, .. } => config,
            Self::Saml { config } => config,
        }
    }

    async fn discover(&self) -> Result<DiscoveryDocument> {
        let (config, discovery, client) = match self {
            Self::Oidc {
                config,
                discovery,
                client,
            } => (config, discovery, client),
            Self::Saml { .. } => {
                return Err(SsoError::Upstream(
                    "SAML assertion validation is not implemented".to_string(),
                ))
            }
        };

        if let Some(doc) = discovery.lock().clone() {
            return Ok(doc);
        }

        let url = format!("{}/.well-known/openid-configuration", config.issuer_url);
        let doc: DiscoveryDocument = client
            .get(&url)
            .send()
            .await
            .map_err(|e| SsoError::Upstream(format!("discovery request failed: {e}")))?
            .error_for_status()
            .map_err(|e| SsoError::Upstream(format!("discovery returned error status: {e}")))?
            .json()
            .await
            .map_err(|e| SsoError::Upstream(format!("failed to parse discovery document: {e}")))?;

        *discovery.lock() = Some(doc.clone());
        info!(provider = %config.provider, issuer = %config.issuer_url, "oidc discovery cached");
        Ok(doc)
    }

    /// Build the provider's authorization URL. Generates a CSRF `state`
    /// (≥32 bytes URL-safe) if none is supplied; the caller must persist it
    /// for comparison on callback.
    pub async fn authorize_url(&self, state: Option<String>) -> Result<(String, String)> {
        let doc = self.discover().await?;
        let config = self.config();
        let state = state.unwrap_or_else(|| {
            let mut bytes = [0u8; STATE_RANDOM_BYTES];
            OsRng.fill_bytes(&mut bytes);
            URL_SAFE_NO_PAD.encode(bytes)
        });

        let mut params = vec![
            ("response_type", "code".to_string()),
            ("client_id", config.client_id.clone()),
            ("redirect_uri", config.redirect_uri.clone()),
            ("scope", config.scopes.join(" ")),
            ("state", state.clone()),
        ];
        params.sort_by(|a, b| a.0.cmp(b.0));

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");

        Ok((format!("{}?{query}", doc.authorization_endpoint), state))
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange(&self, code: &str) -> Result<HashMap<String, serde_json::Value>> {
        let doc = self.discover().await?;
        let config = self.config();
        let client = build_client(TOKEN_TIMEOUT);

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &config.redirect_uri),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
        ];

        let resp = client
            .post(&doc.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| SsoError::Upstream(format!("token exchange request failed: {e}")))?
            .error_for_status()
            .map_err(|e| SsoError::Upstream(format!("token exchange returned error status: {e}")))?;

        let tokens: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SsoError::Upstream(format!("failed to parse token response: {e}")))?;

        let mut out = HashMap::new();
        out.insert("access_token".to_string(), tokens.access_token.into());
        if let Some(t) = tokens.token_type {
            out.insert("token_type".to_string(), t.into());
        }
        if let Some(e) = tokens.expires_in {
            out.insert("expires_in".to_string(), e.into());
        }
        if let Some(r) = tokens.refresh_token {
            out.insert("refresh_token".to_string(), r.into());
        }
        if let Some(id) = tokens.id_token {
            out.insert("id_token".to_string(), id.into());
        }
        Ok(out)
    }

    /// Fetch and normalize user claims via a Bearer-token GET.
    pub async fn userinfo(&self, access_token: &str) -> Result<SsoUser> {
        let doc = self.discover().await?;
        let config = self.config();
        let client = build_client(TOKEN_TIMEOUT);

        let claims: serde_json::Value = client
            .get(&doc.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SsoError::Upstream(format!("userinfo request failed: {e}")))?
            .error_for_status()
            .map_err(|e| SsoError::Upstream(format!("userinfo returned error status: {e}")))?
            .json()
            .await
            .map_err(|e| SsoError::Upstream(format!("failed to parse userinfo claims: {e}")))?;

        let external_id = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let email = claims
            .get("email")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let name = claims
            .get("name")
            .or_else(|| claims.get("preferred_username"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let groups = claims
            .get("groups")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|g| g.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(SsoUser {
            external_id,
            email,
            name,
            provider: config.provider.clone(),
            groups,
            raw_claims: claims,
        })
    }

    /// SAML login URL — not implemented; returns an upstream error rather
    /// than a silent empty string.
    pub async fn saml_login_url(&self) -> Result<String> {
        match self {
            Self::Saml { .. } => Err(SsoError::Upstream(
                "SAML assertion validation is not implemented".to_string(),
            )),
            Self::Oidc { .. } => Err(SsoError::InvalidArgument(
                "saml_login_url called on an oidc provider".to_string(),
            )),
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Registry of configured SSO providers, keyed by a caller-chosen name.
pub struct SsoBroker {
    providers: Mutex<HashMap<String, std::sync::Arc<SsoProvider>>>,
}

impl Default for SsoBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SsoBroker {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn configure(&self, name: &str, provider: SsoProvider) {
        self.providers
            .lock()
            .insert(name.to_string(), std::sync::Arc::new(provider));
        info!(provider = name, "sso provider configured");
    }

    pub fn get(&self, name: &str) -> Result<std::sync::Arc<SsoProvider>> {
        self.providers
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SsoError::InvalidArgument(name.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        self.providers.lock().keys().cloned().collect()
    }
}
