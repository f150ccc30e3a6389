//! Client configuration.
//!
//! Loaded from an optional TOML file with `OCTOFHIR_SMART__*` environment
//! overrides, e.g. `OCTOFHIR_SMART__CLIENT_ID=my-app`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::SmartResult;
use crate::auth::{AuthorizeParams, ClientAuth};
use crate::client::Client;
use crate::error::SmartError;
use crate::http::ReqwestTransport;
use crate::pkce::PkceMode;
use crate::state::ClientState;
use crate::storage::MemoryStorage;

/// Default configuration file looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "smart-client.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "OCTOFHIR_SMART";

fn default_request_timeout_secs() -> u64 {
    30
}

/// Settings for one SMART client registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub client_id: String,
    /// Confidential clients only.
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// HTTP Basic credentials for servers without SMART.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pkce_mode: PkceMode,
    /// Append `client_id` to refresh request bodies.
    #[serde(default)]
    pub refresh_token_with_client_id: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            client_id: String::new(),
            client_secret: None,
            scope: None,
            redirect_uri: None,
            username: None,
            password: None,
            pkce_mode: PkceMode::default(),
            refresh_token_with_client_id: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Checks required settings.
    ///
    /// # Errors
    ///
    /// [`SmartError::Configuration`] for a missing server URL or client id
    /// or a zero timeout, [`SmartError::Validation`] for unparsable URLs.
    pub fn validate(&self) -> SmartResult<()> {
        if self.server_url.trim().is_empty() {
            return Err(SmartError::configuration("server_url is required"));
        }
        if self.client_id.trim().is_empty() {
            return Err(SmartError::configuration("client_id is required"));
        }
        if self.request_timeout_secs == 0 {
            return Err(SmartError::configuration(
                "request_timeout_secs must be > 0",
            ));
        }
        Url::parse(&self.server_url)
            .map_err(|e| SmartError::validation(format!("server_url is not a valid URL: {e}")))?;
        if let Some(redirect_uri) = &self.redirect_uri
            && redirect_uri.contains("://")
        {
            if let Err(e) = Url::parse(redirect_uri) {
                return Err(SmartError::validation(format!(
                    "redirect_uri is not a valid URL: {e}"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parameters for [`prepare_authorization`](crate::auth::prepare_authorization).
    #[must_use]
    pub fn authorize_params(&self) -> AuthorizeParams {
        AuthorizeParams {
            server_url: self.server_url.clone(),
            client_id: Some(self.client_id.clone()),
            client_auth: match &self.client_secret {
                Some(secret) => ClientAuth::Secret(secret.clone()),
                None => ClientAuth::Public,
            },
            scope: self.scope.clone(),
            redirect_uri: self.redirect_uri.clone(),
            launch: None,
            pkce_mode: self.pkce_mode,
        }
    }

    /// Builds a client without an authorization round trip, for open
    /// servers or servers using HTTP Basic.
    ///
    /// # Errors
    ///
    /// Validation errors, or a failure to build the HTTP client.
    pub fn open_client(&self) -> SmartResult<Client> {
        self.validate()?;
        let mut state = ClientState::new(self.server_url.clone());
        state.client_id = Some(self.client_id.clone());
        state.scope = self.scope.clone();
        state.username = self.username.clone();
        state.password = self.password.clone();

        let transport = Arc::new(ReqwestTransport::new(self.request_timeout())?);
        let storage = Arc::new(MemoryStorage::new());
        if self.refresh_token_with_client_id {
            Client::with_refresh_client_id(state, transport, storage)
        } else {
            Client::new(state, transport, storage)
        }
    }
}

/// Loads and validates a [`ClientConfig`].
///
/// Reads `path` when it exists, or [`DEFAULT_CONFIG_FILE`] when no path is
/// given, then applies `OCTOFHIR_SMART__*` environment overrides.
///
/// # Errors
///
/// [`SmartError::Configuration`] when the sources cannot be read or merged,
/// plus the errors of [`ClientConfig::validate`].
pub fn load_config(path: Option<&str>) -> SmartResult<ClientConfig> {
    use config::{Config, Environment, File};

    let mut builder = Config::builder();
    let file = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
    if file.exists() {
        builder = builder.add_source(File::from(file));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let merged: ClientConfig = builder
        .build()
        .map_err(|e| SmartError::configuration(format!("config build error: {e}")))?
        .try_deserialize()
        .map_err(|e| SmartError::configuration(format!("config deserialize error: {e}")))?;
    merged.validate()?;
    Ok(merged)
}
