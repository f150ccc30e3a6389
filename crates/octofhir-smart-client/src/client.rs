//! FHIR client bound to one SMART session.
//!
//! [`Client::request`] is the request pipeline: refresh the token if it is
//! about to expire, add the `Authorization` header, send, apply the 401/403
//! policy, then resolve references and walk Bundle pages as configured by
//! [`FhirOptions`].

use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::SmartResult;
use crate::error::{HttpError, NOT_LAUNCHED_HINT, SESSION_EXPIRED_HINT, SmartError};
use crate::http::{self, DynTransport, Fetched, HttpResponse, RequestOptions, ResponseBody};
use crate::pagination::{Page, PageSource, PageStart, bundle_resources, is_bundle, walk_pages};
use crate::path::get_path;
use crate::resolver::{
    DynReferenceFetcher, ReferenceCache, ReferenceFetcher, References, resolve_references,
};
use crate::security::decode_jwt_payload;
use crate::state::ClientState;
use crate::storage::DynStorage;
use crate::token::{TokenManager, basic_auth};

// =============================================================================
// Request and options
// =============================================================================

/// A request relative to the server base URL (or an absolute URL).
#[derive(Debug, Clone)]
pub struct FhirRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<String>,
    /// Return the HTTP response with the body.
    pub include_response: bool,
}

impl FhirRequest {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            include_response: false,
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a JSON body; `content-type` defaults to `application/json`.
    #[must_use]
    pub fn json(mut self, body: &Value) -> Self {
        if !self.headers.contains_key(CONTENT_TYPE) {
            self.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        self.body = Some(body.to_string());
        self
    }

    #[must_use]
    pub fn include_response(mut self, include: bool) -> Self {
        self.include_response = include;
        self
    }
}

impl From<&str> for FhirRequest {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for FhirRequest {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Called with each page (flattened when `flat` is set) and the references
/// resolved so far.
pub type PageCallback = Arc<dyn Fn(&Value, &References) -> SmartResult<()> + Send + Sync>;

/// Per-call processing options.
#[derive(Clone)]
pub struct FhirOptions {
    /// Embed resolved references in place instead of returning them apart.
    pub graph: bool,
    /// Turn Bundles into arrays of their entry resources.
    pub flat: bool,
    /// Maximum number of Bundle pages, counting the first. `0` means all.
    pub page_limit: u32,
    /// Dotted paths of references to resolve.
    pub resolve_references: Vec<String>,
    /// Refresh an expiring token before sending.
    pub use_refresh_token: bool,
    /// Stream pages to a callback instead of collecting them.
    pub on_page: Option<PageCallback>,
    pub signal: Option<CancellationToken>,
}

impl Default for FhirOptions {
    fn default() -> Self {
        Self {
            graph: true,
            flat: false,
            page_limit: 1,
            resolve_references: Vec::new(),
            use_refresh_token: true,
            on_page: None,
            signal: None,
        }
    }
}

impl std::fmt::Debug for FhirOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirOptions")
            .field("graph", &self.graph)
            .field("flat", &self.flat)
            .field("page_limit", &self.page_limit)
            .field("resolve_references", &self.resolve_references)
            .field("use_refresh_token", &self.use_refresh_token)
            .field("on_page", &self.on_page.is_some())
            .field("signal", &self.signal)
            .finish()
    }
}

impl FhirOptions {
    #[must_use]
    pub fn graph(mut self, graph: bool) -> Self {
        self.graph = graph;
        self
    }

    #[must_use]
    pub fn flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    #[must_use]
    pub fn page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit;
        self
    }

    #[must_use]
    pub fn resolve<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resolve_references = paths.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn use_refresh_token(mut self, enabled: bool) -> Self {
        self.use_refresh_token = enabled;
        self
    }

    #[must_use]
    pub fn on_page<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value, &References) -> SmartResult<()> + Send + Sync + 'static,
    {
        self.on_page = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    fn check_cancelled(&self) -> SmartResult<()> {
        match &self.signal {
            Some(signal) if signal.is_cancelled() => Err(SmartError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Result of [`Client::request`].
#[derive(Debug, Clone)]
pub struct FhirResponse {
    /// The resource, the Bundle, or an array of pages / resources when more
    /// than one page was requested. `Empty` when pages went to `on_page`.
    pub body: ResponseBody,
    /// References resolved out of band (`graph = false`).
    pub references: References,
    /// The first HTTP response, when requested or when the body is raw.
    pub response: Option<HttpResponse>,
}

impl FhirResponse {
    #[must_use]
    pub fn json(&self) -> Option<&Value> {
        self.body.as_json()
    }

    #[must_use]
    pub fn into_json(self) -> Option<Value> {
        self.body.into_json()
    }
}

// =============================================================================
// Client
// =============================================================================

struct ClientInner {
    server_url: Url,
    tokens: TokenManager,
    fhir_version: OnceCell<String>,
}

/// A FHIR client. Cloning is cheap and clones share the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_url", &self.inner.server_url.as_str())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client over `state`.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Validation`] when `state.server_url` is not a
    /// valid URL.
    pub fn new(
        state: ClientState,
        transport: DynTransport,
        storage: DynStorage,
    ) -> SmartResult<Self> {
        Self::with_tokens(state, |state| TokenManager::new(state, transport, storage))
    }

    /// Like [`Client::new`], sending `client_id` with refresh requests.
    ///
    /// # Errors
    ///
    /// See [`Client::new`].
    pub fn with_refresh_client_id(
        state: ClientState,
        transport: DynTransport,
        storage: DynStorage,
    ) -> SmartResult<Self> {
        Self::with_tokens(state, |state| {
            TokenManager::with_options(state, transport, storage, true)
        })
    }

    fn with_tokens(
        state: ClientState,
        tokens: impl FnOnce(ClientState) -> TokenManager,
    ) -> SmartResult<Self> {
        if state.server_url.trim().is_empty() {
            return Err(SmartError::configuration("No server url found"));
        }
        let server_url = Url::parse(&state.server_url)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                server_url,
                tokens: tokens(state),
                fhir_version: OnceCell::new(),
            }),
        })
    }

    #[must_use]
    pub fn server_url(&self) -> &Url {
        &self.inner.server_url
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    /// Snapshot of the session state.
    pub async fn state(&self) -> ClientState {
        self.inner.tokens.state().await
    }

    /// Reads a dotted path of the serialized state (`"tokenResponse.patient"`).
    /// An empty path returns the whole state.
    pub async fn get_state(&self, path: &str) -> Option<Value> {
        let state = serde_json::to_value(self.state().await).ok()?;
        get_path(&state, path)
    }

    /// Forces a token refresh.
    ///
    /// # Errors
    ///
    /// See [`TokenManager::refresh`].
    pub async fn refresh(&self) -> SmartResult<ClientState> {
        self.inner.tokens.refresh().await
    }

    /// Refreshes only when the access token is about to expire.
    ///
    /// # Errors
    ///
    /// See [`TokenManager::refresh`].
    pub async fn refresh_if_needed(&self) -> SmartResult<ClientState> {
        self.inner.tokens.refresh_if_needed().await
    }

    // -------------------------------------------------------------------------
    // Request pipeline
    // -------------------------------------------------------------------------

    /// Sends a request and post-processes the result.
    ///
    /// JSON results get their references resolved. Bundles are paged up to
    /// `page_limit`: one page yields the Bundle (or its resources when
    /// `flat`), more yield an array of pages (or of all their resources).
    ///
    /// # Errors
    ///
    /// - [`SmartError::AuthExpired`] when a 401 ends the session
    /// - [`SmartError::Permission`] for 403
    /// - [`SmartError::Http`] for other failures, including reference
    ///   fetches other than 404
    /// - [`SmartError::Cancelled`] when the signal fired before a send
    #[instrument(skip_all, fields(url))]
    pub async fn request(
        &self,
        request: impl Into<FhirRequest>,
        options: FhirOptions,
    ) -> SmartResult<FhirResponse> {
        let request = request.into();
        tracing::Span::current().record("url", request.url.as_str());
        let fetched = self.send(&request, &options).await?;
        let response = fetched.response;

        let mut body = match fetched.body {
            ResponseBody::Json(body) => body,
            other => {
                return Ok(FhirResponse {
                    body: other,
                    references: References::new(),
                    response,
                });
            }
        };

        let cache = ReferenceCache::new();
        let references = self.resolve(&mut body, &options, &cache).await?;

        if !is_bundle(&body) {
            return Ok(FhirResponse {
                body: ResponseBody::Json(body),
                references,
                response,
            });
        }

        let first = Page {
            bundle: body,
            references,
        };
        let (body, references) = self.collect_pages(first, options, cache).await?;
        Ok(FhirResponse {
            body,
            references,
            response,
        })
    }

    /// Streams the Bundle pages starting at `url`, with references resolved
    /// per page. `page_limit` and `signal` apply; `flat` and `on_page` do not.
    pub fn pages(
        &self,
        url: impl Into<String>,
        options: FhirOptions,
    ) -> impl Stream<Item = SmartResult<Page>> + Send + 'static {
        let limit = options.page_limit;
        let signal = options.signal.clone();
        let source = PageFetcher {
            client: self.clone(),
            options,
            cache: ReferenceCache::new(),
        };
        walk_pages(source, PageStart::Url(url.into()), limit, signal)
    }

    async fn collect_pages(
        &self,
        first: Page,
        options: FhirOptions,
        cache: ReferenceCache,
    ) -> SmartResult<(ResponseBody, References)> {
        let page_limit = options.page_limit;
        let flat = options.flat;
        let on_page = options.on_page.clone();
        let signal = options.signal.clone();
        let source = PageFetcher {
            client: self.clone(),
            options,
            cache,
        };

        let pages = walk_pages(source, PageStart::Page(first), page_limit, signal);
        let mut pages = pin!(pages);
        let mut references = References::new();
        let mut collected = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page?;
            references.extend(page.references);
            let data = if flat {
                Value::Array(bundle_resources(&page.bundle))
            } else {
                page.bundle
            };
            match &on_page {
                Some(callback) => callback(&data, &references)?,
                None => collected.push(data),
            }
        }

        if on_page.is_some() {
            return Ok((ResponseBody::Empty, references));
        }

        let body = if page_limit == 1 {
            collected.pop().unwrap_or(Value::Null)
        } else if flat {
            Value::Array(
                collected
                    .into_iter()
                    .flat_map(|page| match page {
                        Value::Array(items) => items,
                        other => vec![other],
                    })
                    .collect(),
            )
        } else {
            Value::Array(collected)
        };
        Ok((ResponseBody::Json(body), references))
    }

    async fn resolve(
        &self,
        body: &mut Value,
        options: &FhirOptions,
        cache: &ReferenceCache,
    ) -> SmartResult<References> {
        if options.resolve_references.is_empty() {
            return Ok(References::new());
        }
        let fetcher: DynReferenceFetcher = Arc::new(ScopedFetcher {
            client: self.clone(),
            options: FhirOptions {
                use_refresh_token: options.use_refresh_token,
                signal: options.signal.clone(),
                ..FhirOptions::default()
            },
        });
        resolve_references(
            body,
            &options.resolve_references,
            options.graph,
            cache,
            &fetcher,
        )
        .await
    }

    /// One authorized round trip with the 401/403 policy applied.
    async fn send(&self, request: &FhirRequest, options: &FhirOptions) -> SmartResult<Fetched> {
        options.check_cancelled()?;
        let url = http::absolute_url(&request.url, &self.inner.server_url)?;

        let state = if options.use_refresh_token {
            self.inner.tokens.refresh_if_needed().await?
        } else {
            self.inner.tokens.state().await
        };

        match self.execute(&url, request, &state).await {
            Err(SmartError::Http(error)) if error.status == 401 => {
                self.recover_unauthorized(error, &url, request, &state, options)
                    .await
            }
            Err(SmartError::Http(error)) if error.status == 403 => {
                warn!(url = %error.url, "Permission denied");
                Err(SmartError::Permission(error))
            }
            other => other,
        }
    }

    async fn execute(
        &self,
        url: &Url,
        request: &FhirRequest,
        state: &ClientState,
    ) -> SmartResult<Fetched> {
        let mut headers = request.headers.clone();
        if !headers.contains_key(AUTHORIZATION)
            && let Some(value) = authorization_header(state)?
        {
            headers.insert(AUTHORIZATION, value);
        }
        http::request(
            self.inner.tokens.transport().as_ref(),
            url,
            RequestOptions {
                method: request.method.clone(),
                headers,
                body: request.body.clone(),
                include_response: request.include_response,
                base_url: Some(self.inner.server_url.clone()),
            },
        )
        .await
    }

    async fn recover_unauthorized(
        &self,
        mut error: HttpError,
        url: &Url,
        request: &FhirRequest,
        sent_with: &ClientState,
        options: &FhirOptions,
    ) -> SmartResult<Fetched> {
        if sent_with.access_token().is_none() {
            return Err(SmartError::AuthExpired {
                error,
                hint: NOT_LAUNCHED_HINT,
            });
        }

        if !options.use_refresh_token {
            warn!("Session expired and token refresh is disabled");
            self.inner.tokens.clear_token_response().await;
            return Err(SmartError::AuthExpired {
                error,
                hint: SESSION_EXPIRED_HINT,
            });
        }

        let current = self.inner.tokens.state().await;
        let retry_with = if current.access_token().is_some()
            && current.access_token() != sent_with.access_token()
        {
            debug!("Access token changed in flight; retrying");
            Some(current)
        } else if current.refresh_token().is_some() {
            match self.inner.tokens.refresh().await {
                Ok(state) => Some(state),
                Err(refresh_error) => {
                    warn!(%refresh_error, "Auto-refresh failed");
                    None
                }
            }
        } else {
            None
        };

        if let Some(state) = retry_with {
            options.check_cancelled()?;
            match self.execute(url, request, &state).await {
                Err(SmartError::Http(retry_error)) if retry_error.status == 401 => {
                    error = retry_error;
                }
                Err(SmartError::Http(retry_error)) if retry_error.status == 403 => {
                    return Err(SmartError::Permission(retry_error));
                }
                other => return other,
            }
        }

        warn!(url = %error.url, "Session expired. Please re-launch the app");
        self.inner.tokens.clear_token_response().await;
        Err(SmartError::AuthExpired {
            error,
            hint: SESSION_EXPIRED_HINT,
        })
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    /// `POST <resourceType>` with `resource` as body.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Validation`] when `resourceType` is missing.
    pub async fn create(
        &self,
        resource: &Value,
        options: FhirOptions,
    ) -> SmartResult<FhirResponse> {
        let resource_type = resource_type(resource)?;
        let request = FhirRequest::new(resource_type)
            .method(Method::POST)
            .json(resource);
        self.request(request, options).await
    }

    /// `PUT <resourceType>/<id>` with `resource` as body.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Validation`] when `resourceType` or `id` is
    /// missing.
    pub async fn update(
        &self,
        resource: &Value,
        options: FhirOptions,
    ) -> SmartResult<FhirResponse> {
        let resource_type = resource_type(resource)?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SmartError::validation("Cannot update a resource without an id"))?;
        let request = FhirRequest::new(format!("{resource_type}/{id}"))
            .method(Method::PUT)
            .json(resource);
        self.request(request, options).await
    }

    /// `DELETE <url>`.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn delete(&self, url: &str, options: FhirOptions) -> SmartResult<FhirResponse> {
        self.request(FhirRequest::new(url).method(Method::DELETE), options)
            .await
    }

    /// `PATCH <url>` with a JSON Patch document.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Validation`] without sending anything when
    /// `patch` is not a valid JSON Patch.
    pub async fn patch(
        &self,
        url: &str,
        patch: &Value,
        options: FhirOptions,
    ) -> SmartResult<FhirResponse> {
        serde_json::from_value::<json_patch::Patch>(patch.clone())
            .map_err(|e| SmartError::validation(format!("Invalid JSON Patch: {e}")))?;
        let request = FhirRequest::new(url)
            .method(Method::PATCH)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json-patch+json; charset=UTF-8"),
            )
            .json(patch);
        self.request(request, options).await
    }

    // -------------------------------------------------------------------------
    // Launch context
    // -------------------------------------------------------------------------

    /// Patient in context, if the launch granted one.
    pub async fn patient_id(&self) -> Option<String> {
        let state = self.state().await;
        let patient = state.token_response.patient.clone();
        if patient.is_none() {
            if state.access_token().is_none() {
                debug!("Patient is not available before authorization");
            } else if !state.token_response.has_scope("launch")
                && !state.token_response.has_scope("launch/patient")
            {
                debug!("Patient is not available without a launch scope");
            }
        }
        patient
    }

    /// Encounter in context, if the launch granted one.
    pub async fn encounter_id(&self) -> Option<String> {
        self.state().await.token_response.encounter
    }

    /// Claims of the `id_token`, decoded without verification.
    pub async fn id_token(&self) -> Option<Value> {
        let state = self.state().await;
        let id_token = state.token_response.id_token.as_deref()?;
        decode_jwt_payload(id_token)
    }

    /// `ResourceType/id` of the signed-in user (`fhirUser` or `profile`
    /// claim of the `id_token`).
    pub async fn fhir_user(&self) -> Option<String> {
        let claims = self.id_token().await?;
        let user = claims
            .get("fhirUser")
            .or_else(|| claims.get("profile"))
            .and_then(Value::as_str)?;
        let mut parts = user.rsplit('/');
        let id = parts.next()?;
        let resource_type = parts.next()?;
        Some(format!("{resource_type}/{id}"))
    }

    pub async fn user_id(&self) -> Option<String> {
        let user = self.fhir_user().await?;
        user.split_once('/').map(|(_, id)| id.to_string())
    }

    /// `Patient`, `Practitioner`, `RelatedPerson`...
    pub async fn user_type(&self) -> Option<String> {
        let user = self.fhir_user().await?;
        user.split_once('/')
            .map(|(resource_type, _)| resource_type.to_string())
    }

    // -------------------------------------------------------------------------
    // Server
    // -------------------------------------------------------------------------

    /// `fhirVersion` from the server's CapabilityStatement, fetched once.
    ///
    /// # Errors
    ///
    /// Returns the `metadata` request error, or [`SmartError::Decode`] when
    /// the statement has no `fhirVersion`.
    pub async fn fhir_version(&self) -> SmartResult<String> {
        self.inner
            .fhir_version
            .get_or_try_init(|| async {
                let metadata = self.request("metadata", FhirOptions::default()).await?;
                metadata
                    .json()
                    .and_then(|m| m.get("fhirVersion"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| SmartError::decode("CapabilityStatement has no fhirVersion"))
            })
            .await
            .cloned()
    }

    /// FHIR release number (2, 3, 4 or 5) of the server, `0` when unknown.
    ///
    /// # Errors
    ///
    /// See [`Client::fhir_version`].
    pub async fn fhir_release(&self) -> SmartResult<u8> {
        Ok(fhir_release(&self.fhir_version().await?))
    }
}

/// Maps a FHIR version string to its release number.
#[must_use]
pub fn fhir_release(version: &str) -> u8 {
    let mut parts = version.split('.');
    let major_minor = (
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    );
    match major_minor {
        ("0", "4" | "5") | ("1", "0") => 2,
        ("1", "1" | "4" | "6" | "8") | ("3", "0") => 3,
        ("3", "3" | "5") | ("4", "0" | "3") => 4,
        ("5", _) => 5,
        _ => 0,
    }
}

fn resource_type(resource: &Value) -> SmartResult<&str> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| SmartError::validation("Resource has no resourceType"))
}

/// `Bearer` with the access token, else `Basic` with the configured
/// username and password, else nothing.
fn authorization_header(state: &ClientState) -> SmartResult<Option<HeaderValue>> {
    if let Some(token) = state.access_token() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| SmartError::validation(format!("Invalid access token: {e}")))?;
        return Ok(Some(value));
    }
    match (state.username.as_deref(), state.password.as_deref()) {
        (Some(username), Some(password)) => basic_auth(username, password).map(Some),
        _ => Ok(None),
    }
}

// =============================================================================
// Fetchers
// =============================================================================

/// Fetches reference targets through the client, carrying the caller's
/// refresh setting and cancellation signal.
struct ScopedFetcher {
    client: Client,
    options: FhirOptions,
}

#[async_trait]
impl ReferenceFetcher for ScopedFetcher {
    async fn fetch_reference(&self, reference: &str) -> SmartResult<Value> {
        let fetched = self
            .client
            .send(&FhirRequest::new(reference), &self.options)
            .await?;
        fetched
            .body
            .into_json()
            .ok_or_else(|| SmartError::decode(format!("Reference {reference} is not JSON")))
    }
}

/// Fetches Bundle pages and resolves their references.
struct PageFetcher {
    client: Client,
    options: FhirOptions,
    cache: ReferenceCache,
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch_page(&self, url: &str) -> SmartResult<Page> {
        let fetched = self
            .client
            .send(&FhirRequest::new(url), &self.options)
            .await?;
        let mut bundle = fetched
            .body
            .into_json()
            .ok_or_else(|| SmartError::decode(format!("Page {url} is not JSON")))?;
        let references = self
            .client
            .resolve(&mut bundle, &self.options, &self.cache)
            .await?;
        Ok(Page { bundle, references })
    }
}
