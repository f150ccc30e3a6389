//! Token lifecycle: expiry computation and single-flight refresh.
//!
//! [`TokenManager`] is the only writer of the session's token state after
//! launch. Every outgoing request calls [`TokenManager::refresh_if_needed`],
//! which is free unless the access token is about to expire. When it is,
//! all concurrent callers share one refresh task and one token endpoint
//! call.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};
use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::SmartResult;
use crate::error::SmartError;
use crate::http::{self, DynTransport, RequestOptions, ResponseBody};
use crate::security::decode_jwt_payload;
use crate::state::{ClientState, TokenResponse};
use crate::storage::{DynStorage, save_state};

/// Seconds before `expires_at` at which a token counts as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 10;

/// Lifetime assumed when neither `expires_in` nor a JWT `exp` is available.
pub const FALLBACK_LIFETIME_SECS: i64 = 300;

type RefreshTask = Shared<BoxFuture<'static, SmartResult<ClientState>>>;

/// Current time as Unix seconds.
pub(crate) fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Computes the absolute expiry of the access token in `token`.
///
/// Uses `expires_in` when present, else the `exp` claim of a JWT access
/// token, else `now + 300`.
#[must_use]
pub fn access_token_expiration(token: &TokenResponse, now: i64) -> i64 {
    if let Some(expires_in) = token.expires_in {
        return now + expires_in;
    }
    token
        .access_token
        .as_deref()
        .and_then(decode_jwt_payload)
        .and_then(|claims| claims.get("exp").and_then(serde_json::Value::as_i64))
        .unwrap_or(now + FALLBACK_LIFETIME_SECS)
}

/// `Basic` authorization header value for `client_id:secret`.
pub(crate) fn basic_auth(user: &str, password: &str) -> SmartResult<HeaderValue> {
    let encoded = STANDARD.encode(format!("{user}:{password}"));
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|e| SmartError::validation(format!("Invalid credentials for Basic auth: {e}")))
}

/// URL-encodes a form value.
pub(crate) fn form_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// A prepared token endpoint exchange.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub token_uri: Url,
    pub headers: HeaderMap,
    pub body: String,
}

/// Validates the refresh preconditions and builds the token request.
///
/// # Errors
///
/// Returns [`SmartError::Configuration`] when the state has no refresh
/// token, no token endpoint, or a scope without `offline_access` or
/// `online_access`. No request is made in those cases.
pub fn build_refresh_request(
    state: &ClientState,
    with_client_id: bool,
) -> SmartResult<TokenRequest> {
    let Some(refresh_token) = state.refresh_token() else {
        return Err(SmartError::configuration(
            "Unable to refresh. No refresh_token found.",
        ));
    };
    let Some(token_uri) = state.token_uri.as_deref() else {
        return Err(SmartError::configuration(
            "Unable to refresh. No tokenUri found.",
        ));
    };
    if !state.token_response.allows_refresh() {
        return Err(SmartError::configuration(
            "Unable to refresh. No offline_access or online_access scope found.",
        ));
    }

    let mut body = format!(
        "grant_type=refresh_token&refresh_token={}",
        form_encode(refresh_token)
    );
    if with_client_id && let Some(client_id) = state.client_id.as_deref() {
        body.push_str("&client_id=");
        body.push_str(&form_encode(client_id));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    if let (Some(client_id), Some(secret)) = (state.client_id.as_deref(), state.client_secret()) {
        headers.insert(AUTHORIZATION, basic_auth(client_id, secret)?);
    }

    Ok(TokenRequest {
        token_uri: Url::parse(token_uri)?,
        headers,
        body,
    })
}

/// Posts a form to the token endpoint and returns the token response.
///
/// A success without `access_token` is an error.
pub(crate) async fn exchange_token(
    transport: &dyn http::Transport,
    request: TokenRequest,
) -> SmartResult<TokenResponse> {
    let fetched = http::request(
        transport,
        &request.token_uri,
        RequestOptions {
            method: Method::POST,
            headers: request.headers,
            body: Some(request.body),
            include_response: false,
            ..Default::default()
        },
    )
    .await?;

    let token: TokenResponse = match fetched.body {
        ResponseBody::Json(value) => serde_json::from_value(value)
            .map_err(|e| SmartError::decode(format!("Invalid token response: {e}")))?,
        _ => TokenResponse::default(),
    };
    if token.access_token.is_none() {
        return Err(SmartError::decode(
            "No access token received from the token endpoint",
        ));
    }
    Ok(token)
}

// =============================================================================
// Token Manager
// =============================================================================

struct Inner {
    state: RwLock<ClientState>,
    transport: DynTransport,
    storage: DynStorage,
    refresh_task: Mutex<Option<RefreshTask>>,
    refresh_with_client_id: bool,
}

/// Owns one session's [`ClientState`] and coordinates its refreshes.
///
/// Cloning is cheap and clones share the same state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("refresh_with_client_id", &self.inner.refresh_with_client_id)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    #[must_use]
    pub fn new(state: ClientState, transport: DynTransport, storage: DynStorage) -> Self {
        Self::with_options(state, transport, storage, false)
    }

    /// Like [`TokenManager::new`]; `refresh_with_client_id` appends
    /// `client_id` to refresh request bodies.
    #[must_use]
    pub fn with_options(
        state: ClientState,
        transport: DynTransport,
        storage: DynStorage,
        refresh_with_client_id: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                transport,
                storage,
                refresh_task: Mutex::new(None),
                refresh_with_client_id,
            }),
        }
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> ClientState {
        self.inner.state.read().await.clone()
    }

    pub fn transport(&self) -> &DynTransport {
        &self.inner.transport
    }

    pub fn storage(&self) -> &DynStorage {
        &self.inner.storage
    }

    /// Refreshes only when both tokens are present and the access token
    /// expires within [`EXPIRY_MARGIN_SECS`]. Otherwise returns the current
    /// state without any I/O.
    ///
    /// # Errors
    ///
    /// Propagates refresh failures, see [`TokenManager::refresh`].
    pub async fn refresh_if_needed(&self) -> SmartResult<ClientState> {
        self.start_or_join(false).await
    }

    /// Exchanges the refresh token for a new access token.
    ///
    /// Concurrent calls share one in-flight exchange and all receive its
    /// outcome. On success the new state is persisted under its key.
    ///
    /// # Errors
    ///
    /// - [`SmartError::Configuration`] when preconditions fail (no request is made)
    /// - the token endpoint error, after which the refresh token is dropped
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> SmartResult<ClientState> {
        self.start_or_join(true).await
    }

    async fn start_or_join(&self, force: bool) -> SmartResult<ClientState> {
        let task = {
            let mut slot = self.inner.refresh_task.lock().await;
            match slot.as_ref() {
                Some(task) => {
                    debug!("Joining in-flight token refresh");
                    task.clone()
                }
                None => {
                    let state = self.state().await;
                    if !force && !needs_refresh(&state, now()) {
                        return Ok(state);
                    }
                    let request = build_refresh_request(&state, self.inner.refresh_with_client_id)?;
                    let task = run_refresh(Arc::clone(&self.inner), request)
                        .boxed()
                        .shared();
                    *slot = Some(task.clone());
                    task
                }
            }
        };
        task.await
    }

    /// Resets the token response and persists the cleared session.
    pub async fn clear_token_response(&self) {
        let state = {
            let mut state = self.inner.state.write().await;
            state.token_response = TokenResponse::default();
            state.expires_at = None;
            state.clone()
        };
        debug!("Cleared token response");
        persist(&self.inner.storage, &state).await;
    }
}

fn needs_refresh(state: &ClientState, now: i64) -> bool {
    state.access_token().is_some()
        && state.refresh_token().is_some()
        && state
            .expires_at
            .is_some_and(|expires_at| expires_at - EXPIRY_MARGIN_SECS < now)
}

async fn run_refresh(inner: Arc<Inner>, request: TokenRequest) -> SmartResult<ClientState> {
    debug!(token_uri = %request.token_uri, "Refreshing access token");
    let outcome = exchange_token(inner.transport.as_ref(), request).await;

    let result = match outcome {
        Ok(token) => {
            let mut state = inner.state.write().await;
            let expires_at = access_token_expiration(&token, now());
            state.token_response.merge(token);
            state.expires_at = Some(expires_at);
            debug!(expires_at, "Access token refreshed");
            Ok(state.clone())
        }
        Err(error) => {
            warn!(%error, "Token refresh failed");
            let server_answered = matches!(error, SmartError::Http(_) | SmartError::Decode { .. });
            if server_answered {
                let mut state = inner.state.write().await;
                if state.token_response.refresh_token.take().is_some() {
                    debug!("Deleted the expired or invalid refresh token");
                }
            }
            Err(error)
        }
    };

    if let Ok(state) = &result {
        persist(&inner.storage, state).await;
    }
    inner.refresh_task.lock().await.take();
    result
}

/// Writes `state` under its key. Failures are logged, not returned.
pub(crate) async fn persist(storage: &DynStorage, state: &ClientState) {
    match state.key.as_deref() {
        Some(key) => {
            if let Err(error) = save_state(storage.as_ref(), key, state).await {
                warn!(%error, key, "Failed to persist client state");
            }
        }
        None => debug!("Client state has no key; not persisting"),
    }
}
