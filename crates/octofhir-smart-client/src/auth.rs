//! SMART authorization code flow.
//!
//! The flow has two halves around the browser round trip to the
//! authorization server:
//!
//! 1. [`prepare_authorization`] discovers the server endpoints, decides on
//!    PKCE, and stores a fresh [`ClientState`] under a random session key.
//!    The host then redirects to `authorize_uri` with `state = key`.
//! 2. [`complete_authorization`] runs on the redirect back: it reads
//!    `code` and `state` from the current URL, exchanges the code at the
//!    token endpoint, persists the tokens and returns a ready [`Client`].

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::SmartResult;
use crate::assertion::{CLIENT_ASSERTION_TYPE, build_client_assertion};
use crate::client::Client;
use crate::environment::Environment;
use crate::error::SmartError;
use crate::http::{self, DynTransport, RequestOptions, Transport, absolute_url};
use crate::pkce::{DEFAULT_ENTROPY, PkceMode, generate_pkce_challenge};
use crate::security::{base64url_encode, import_jwk, random_bytes};
use crate::state::{ClientCredential, ClientState};
use crate::storage::{DynStorage, SMART_KEY, load_state, save_state};
use crate::token::{
    TokenRequest, access_token_expiration, basic_auth, exchange_token, form_encode, now,
};

/// Extension of the CapabilityStatement carrying the OAuth endpoints on
/// servers without `.well-known/smart-configuration`.
const OAUTH_URIS_EXTENSION: &str =
    "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris";

// =============================================================================
// Discovery
// =============================================================================

/// Server endpoints and capabilities advertised for SMART launches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmartConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,
}

/// Reads `<server>/.well-known/smart-configuration`.
///
/// # Errors
///
/// Returns the HTTP error, or [`SmartError::Decode`] for a non-JSON body.
pub async fn fetch_smart_configuration(
    transport: &dyn Transport,
    server_url: &Url,
) -> SmartResult<SmartConfiguration> {
    let url = absolute_url(".well-known/smart-configuration", server_url)?;
    let fetched = http::request(transport, &url, RequestOptions::default()).await?;
    let body = fetched
        .body
        .into_json()
        .ok_or_else(|| SmartError::decode("smart-configuration is not JSON"))?;
    serde_json::from_value(body)
        .map_err(|e| SmartError::decode(format!("Invalid smart-configuration: {e}")))
}

/// Reads the OAuth endpoints from the `oauth-uris` extension of the
/// server's CapabilityStatement.
async fn fetch_conformance_endpoints(
    transport: &dyn Transport,
    server_url: &Url,
) -> SmartResult<SmartConfiguration> {
    let url = absolute_url("metadata", server_url)?;
    let fetched = http::request(transport, &url, RequestOptions::default()).await?;
    let metadata = fetched.body.into_json().unwrap_or(Value::Null);

    let mut config = SmartConfiguration::default();
    let extensions = metadata
        .pointer("/rest/0/security/extension")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|ext| ext.get("url").and_then(Value::as_str) == Some(OAUTH_URIS_EXTENSION))
        .filter_map(|ext| ext.get("extension").and_then(Value::as_array))
        .flatten();
    for ext in extensions {
        let value = ext
            .get("valueUri")
            .and_then(Value::as_str)
            .map(str::to_string);
        match ext.get("url").and_then(Value::as_str) {
            Some("authorize") => config.authorization_endpoint = value,
            Some("token") => config.token_endpoint = value,
            Some("register") => config.registration_endpoint = value,
            _ => {}
        }
    }
    Ok(config)
}

/// Discovers the SMART endpoints of `server_url`.
///
/// Tries `.well-known/smart-configuration` first and falls back to the
/// CapabilityStatement. A server advertising neither is treated as open
/// (no authorization).
pub async fn discover(transport: &dyn Transport, server_url: &Url) -> SmartConfiguration {
    match fetch_smart_configuration(transport, server_url).await {
        Ok(config) => return config,
        Err(error) => {
            debug!(%error, "No smart-configuration; falling back to the CapabilityStatement");
        }
    }
    match fetch_conformance_endpoints(transport, server_url).await {
        Ok(config) => config,
        Err(error) => {
            warn!(%error, "Unable to discover SMART endpoints; treating server as open");
            SmartConfiguration::default()
        }
    }
}

// =============================================================================
// Authorize
// =============================================================================

/// How the app authenticates at the token endpoint.
#[derive(Debug, Clone, Default)]
pub enum ClientAuth {
    /// Public client: sends `client_id` in the body.
    #[default]
    Public,
    /// Confidential client: HTTP Basic with the secret.
    Secret(String),
    /// Asymmetric client: signed JWT assertion with this private JWK.
    PrivateKey(Value),
}

/// Input of [`prepare_authorization`].
#[derive(Debug, Clone, Default)]
pub struct AuthorizeParams {
    /// FHIR server base URL (the `iss` of an EHR launch).
    pub server_url: String,
    pub client_id: Option<String>,
    pub client_auth: ClientAuth,
    pub scope: Option<String>,
    /// Absolute, or relative to the environment's current URL.
    pub redirect_uri: Option<String>,
    /// EHR launch token. Adds the `launch` scope when missing.
    pub launch: Option<String>,
    pub pkce_mode: PkceMode,
}

/// Result of [`prepare_authorization`].
#[derive(Debug, Clone)]
pub struct PreparedAuthorization {
    /// Session key; send it as the `state` parameter.
    pub key: String,
    /// Stored state. `authorize_uri` is `None` for open servers, which need
    /// no authorization round trip.
    pub state: ClientState,
    /// Challenge to send with `code_challenge_method=S256`, when PKCE is used.
    pub code_challenge: Option<String>,
}

/// Creates and stores the session state for a new launch.
///
/// Any previous session pointed to by [`SMART_KEY`] is removed.
///
/// # Errors
///
/// - [`SmartError::Configuration`] without a server URL, or when PKCE is
///   required but the server does not support S256
/// - [`SmartError::Validation`] for an invalid server URL or private key
/// - storage errors
#[instrument(skip_all, fields(server_url = %params.server_url))]
pub async fn prepare_authorization(
    params: AuthorizeParams,
    env: &dyn Environment,
    transport: &dyn Transport,
    storage: &DynStorage,
) -> SmartResult<PreparedAuthorization> {
    if params.server_url.trim().is_empty() {
        return Err(SmartError::configuration("No server url found"));
    }
    let server_url = Url::parse(&params.server_url)?;

    if let ClientAuth::PrivateKey(jwk) = &params.client_auth {
        import_jwk(jwk)?;
    }

    if let Some(Value::String(old_key)) = storage.get(SMART_KEY).await? {
        storage.unset(&old_key).await?;
    }
    let key = base64url_encode(&random_bytes(16));
    storage.set(SMART_KEY, Value::String(key.clone())).await?;

    let mut scope = params.scope.unwrap_or_default();
    if params.launch.is_some() && !scope.split_whitespace().any(|s| s == "launch") {
        scope = format!("launch {scope}").trim().to_string();
    }
    let redirect_uri = match params.redirect_uri.as_deref() {
        Some(uri) => env.resolve_relative(uri).await?.to_string(),
        None => env.resolve_relative(".").await?.to_string(),
    };

    let config = discover(transport, &server_url).await;

    let mut state = ClientState::new(params.server_url.clone());
    state.client_id = params.client_id;
    state.client_credential = match params.client_auth {
        ClientAuth::Public => None,
        ClientAuth::Secret(secret) => Some(ClientCredential::Secret(secret)),
        ClientAuth::PrivateKey(jwk) => Some(ClientCredential::PrivateKey(jwk)),
    };
    state.scope = (!scope.is_empty()).then_some(scope);
    state.redirect_uri = Some(redirect_uri);
    state.authorize_uri = config.authorization_endpoint;
    state.token_uri = config.token_endpoint;
    state.key = Some(key.clone());

    if state.authorize_uri.is_some()
        && params
            .pkce_mode
            .should_include_challenge(&config.code_challenge_methods_supported)?
    {
        let pair = generate_pkce_challenge(DEFAULT_ENTROPY)?;
        state.code_verifier = Some(pair.code_verifier);
        state.code_challenge = Some(pair.code_challenge);
    }

    save_state(storage.as_ref(), &key, &state).await?;
    debug!(%key, open_server = state.authorize_uri.is_none(), "Prepared authorization");

    Ok(PreparedAuthorization {
        key,
        code_challenge: state.code_challenge.clone(),
        state,
    })
}

// =============================================================================
// Code exchange
// =============================================================================

/// Builds the authorization code exchange for `state`.
///
/// The body is `code=..&grant_type=authorization_code&redirect_uri=..`
/// followed by exactly one client authentication: Basic header for a
/// secret, `client_assertion_type` + `client_assertion` for a private key,
/// or `client_id`. `code_verifier` is appended when PKCE was used.
///
/// # Errors
///
/// Returns [`SmartError::Configuration`] when the state lacks a token URI,
/// redirect URI or client id, and key or signing errors for asymmetric
/// clients.
pub fn build_token_request(code: &str, state: &ClientState) -> SmartResult<TokenRequest> {
    let token_uri = state
        .token_uri
        .as_deref()
        .ok_or_else(|| SmartError::configuration("Missing state.tokenUri"))?;
    let redirect_uri = state
        .redirect_uri
        .as_deref()
        .ok_or_else(|| SmartError::configuration("Missing state.redirectUri"))?;
    let client_id = state
        .client_id
        .as_deref()
        .ok_or_else(|| SmartError::configuration("Missing state.clientId"))?;

    let mut body = format!(
        "code={}&grant_type=authorization_code&redirect_uri={}",
        form_encode(code),
        form_encode(redirect_uri)
    );
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );

    match &state.client_credential {
        Some(ClientCredential::Secret(secret)) => {
            headers.insert(AUTHORIZATION, basic_auth(client_id, secret)?);
        }
        Some(ClientCredential::PrivateKey(jwk)) => {
            let key = import_jwk(jwk)?;
            let assertion = build_client_assertion(client_id, token_uri, &key)?;
            body.push_str("&client_assertion_type=");
            body.push_str(&form_encode(CLIENT_ASSERTION_TYPE));
            body.push_str("&client_assertion=");
            body.push_str(&form_encode(&assertion));
        }
        None => {
            body.push_str("&client_id=");
            body.push_str(&form_encode(client_id));
        }
    }

    if let Some(verifier) = state.code_verifier.as_deref() {
        body.push_str("&code_verifier=");
        body.push_str(&form_encode(verifier));
    }

    Ok(TokenRequest {
        token_uri: Url::parse(token_uri)?,
        headers,
        body,
    })
}

/// Options of [`complete_authorization`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CompleteOptions {
    /// Send `client_id` with later refresh requests.
    pub refresh_token_with_client_id: bool,
}

/// Finishes the launch on the redirect back from the authorization server.
///
/// Open servers (no token endpoint) skip the exchange.
///
/// # Errors
///
/// - [`SmartError::Authorization`] when the redirect carries `error`
/// - [`SmartError::Configuration`] when no session state can be found or
///   `code` is missing
/// - the token endpoint error, or [`SmartError::Decode`] when the response
///   has no `access_token`
#[instrument(skip_all)]
pub async fn complete_authorization(
    env: &dyn Environment,
    transport: DynTransport,
    storage: DynStorage,
    options: CompleteOptions,
) -> SmartResult<Client> {
    let url = env.current_url().await?;
    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };

    if let Some(error) = param("error") {
        let message = match param("error_description") {
            Some(description) => format!("{error}: {description}"),
            None => error,
        };
        return Err(SmartError::authorization(message));
    }

    let key = match param("state") {
        Some(key) => key,
        None => match storage.get(SMART_KEY).await? {
            Some(Value::String(key)) => key,
            _ => {
                return Err(SmartError::configuration(
                    "No 'state' parameter found. Please (re)launch the app.",
                ));
            }
        },
    };
    let Some(mut state) = load_state(storage.as_ref(), &key).await? else {
        return Err(SmartError::configuration(
            "No state found! Please (re)launch the app.",
        ));
    };
    storage.set(SMART_KEY, Value::String(key.clone())).await?;

    let authorized = state.access_token().is_some();
    if !authorized && state.token_uri.is_some() {
        let Some(code) = param("code") else {
            return Err(SmartError::configuration(
                "'code' url parameter is required",
            ));
        };
        let request = build_token_request(&code, &state)?;
        debug!(token_uri = %request.token_uri, "Exchanging authorization code");

        let token = exchange_token(transport.as_ref(), request).await?;
        let launch_scope = token.has_scope("launch") || token.has_scope("launch/patient");
        if launch_scope && token.patient.is_none() {
            warn!("A launch scope was granted but no patient is in context");
        }
        state.expires_at = Some(access_token_expiration(&token, now()));
        state.token_response = token;
        save_state(storage.as_ref(), &key, &state).await?;
        debug!("Authorization successful");
    } else if authorized {
        debug!("Already authorized");
    }

    if options.refresh_token_with_client_id {
        Client::with_refresh_client_id(state, transport, storage)
    } else {
        Client::new(state, transport, storage)
    }
}
