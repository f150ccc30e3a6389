//! Client session state.
//!
//! [`ClientState`] is what gets persisted to [`Storage`](crate::storage::Storage)
//! between launches. Field names serialize in camelCase so stored sessions
//! stay readable by other SMART tooling.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OAuth2 token endpoint response.
///
/// Servers add vendor fields freely, so the known fields are optional and
/// everything else is kept in [`TokenResponse::extra`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Launch context: patient in context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<String>,
    /// Launch context: encounter in context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encounter: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenResponse {
    /// Shallow merge: fields present in `update` replace the current ones.
    pub fn merge(&mut self, update: TokenResponse) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if update.$field.is_some() { self.$field = update.$field; })*
            };
        }
        take!(
            access_token,
            token_type,
            refresh_token,
            expires_in,
            scope,
            id_token,
            patient,
            encounter
        );
        self.extra.extend(update.extra);
    }

    /// Returns `true` if the granted scope contains `scope` as a whole word.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope
            .as_deref()
            .is_some_and(|granted| granted.split_whitespace().any(|s| s == scope))
    }

    /// `true` when the grant allows refresh (`offline_access` or `online_access`).
    #[must_use]
    pub fn allows_refresh(&self) -> bool {
        self.has_scope("offline_access") || self.has_scope("online_access")
    }
}

/// Client secret or private key used to authenticate at the token endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientCredential {
    /// Confidential client: HTTP Basic with the client secret.
    Secret(String),
    /// Asymmetric client: JWT assertion signed with a private JWK.
    PrivateKey(Value),
}

/// Persisted session state owned by one [`Client`](crate::Client).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_credential: Option<ClientCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_uri: Option<String>,
    /// HTTP Basic credentials for servers that do not speak SMART.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub token_response: TokenResponse,
    /// Access token expiry, epoch seconds. Computed locally after each
    /// token exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Storage key of this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
}

impl ClientState {
    /// Creates a state for `server_url` with nothing else set.
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.token_response.access_token.as_deref()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.token_response.refresh_token.as_deref()
    }

    /// The client secret, when the client authenticates with one.
    #[must_use]
    pub fn client_secret(&self) -> Option<&str> {
        match &self.client_credential {
            Some(ClientCredential::Secret(secret)) => Some(secret),
            _ => None,
        }
    }

    /// The private JWK, when the client authenticates with an assertion.
    #[must_use]
    pub fn private_key(&self) -> Option<&Value> {
        match &self.client_credential {
            Some(ClientCredential::PrivateKey(jwk)) => Some(jwk),
            _ => None,
        }
    }
}
