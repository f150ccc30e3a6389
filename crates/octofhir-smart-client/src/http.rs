//! HTTP core: transport abstraction, response classification and error mapping.
//!
//! [`request`] is the single place where the crate talks to a [`Transport`].
//! It adds the default `accept` header, turns non-2xx responses into
//! [`HttpError`]s (with the error body parsed when possible), decodes success
//! bodies by content type, and follows the "201 Created with an empty body
//! and a `Location` header" convention with one extra `GET`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use crate::SmartResult;
use crate::error::{HttpError, SmartError};

// =============================================================================
// Transport
// =============================================================================

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns a header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the `content-type` header, or an empty string.
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.header(CONTENT_TYPE).unwrap_or_default()
    }

    /// Returns the body decoded as UTF-8 (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Fetch capability consumed by the client.
///
/// Implementations only move bytes; status handling and decoding happen in
/// [`request`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes a request and returns the buffered response.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Network`] when no response could be obtained.
    async fn fetch(&self, request: HttpRequest) -> SmartResult<HttpResponse>;
}

/// Shared transport handle.
pub type DynTransport = Arc<dyn Transport>;

/// [`Transport`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be built.
    pub fn new(timeout: Duration) -> SmartResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Uses an existing `reqwest` client (for connection pool reuse).
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, request: HttpRequest) -> SmartResult<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            url,
            headers,
            body,
        })
    }
}

// =============================================================================
// Request
// =============================================================================

/// Per-request HTTP options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    /// Caller headers. They win over the defaults (`HeaderMap` keys are
    /// case-insensitive).
    pub headers: HeaderMap,
    pub body: Option<String>,
    /// Keep the [`HttpResponse`] next to the decoded body.
    pub include_response: bool,
    /// Base for a relative `Location` of a 201 response. Without one the
    /// location is resolved against the request URL.
    pub base_url: Option<Url>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            include_response: false,
            base_url: None,
        }
    }
}

/// Decoded body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// `*json*` content type with a non-empty body.
    Json(Value),
    /// `text/*` content type.
    Text(String),
    /// `*json*` content type with no bytes.
    Empty,
    /// Any other content type; read the bytes from the response.
    Raw,
}

impl ResponseBody {
    /// Returns the JSON value, if any.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Consumes the body and returns the JSON value, if any.
    #[must_use]
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// `true` when no usable body was decoded. Empty text counts as absent.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Empty | Self::Raw => true,
            Self::Text(text) => text.trim().is_empty(),
            Self::Json(_) => false,
        }
    }
}

/// Result of [`request`].
#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: ResponseBody,
    /// Present when `include_response` was set or the body is [`ResponseBody::Raw`].
    pub response: Option<HttpResponse>,
}

/// Executes a request through `transport` and decodes the result.
///
/// # Errors
///
/// - [`SmartError::Http`] for non-2xx responses
/// - [`SmartError::Decode`] for malformed JSON success bodies
/// - whatever the transport returns for network failures
pub async fn request(
    transport: &dyn Transport,
    url: &Url,
    options: RequestOptions,
) -> SmartResult<Fetched> {
    let RequestOptions {
        method,
        mut headers,
        body,
        include_response,
        base_url,
    } = options;

    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    }

    let (response, decoded) = send_once(transport, method, url.clone(), &headers, body).await?;

    if decoded.is_absent()
        && response.status == StatusCode::CREATED
        && let Some(location) = response.header(LOCATION)
    {
        let location = match &base_url {
            Some(base) => absolute_url(location, base)?,
            None => response.url.join(location)?,
        };
        debug!(%location, "Following Location header of 201 response");
        let (response, decoded) =
            send_once(transport, Method::GET, location, &headers, None).await?;
        return Ok(finish(decoded, response, include_response));
    }

    Ok(finish(decoded, response, include_response))
}

async fn send_once(
    transport: &dyn Transport,
    method: Method,
    url: Url,
    headers: &HeaderMap,
    body: Option<String>,
) -> SmartResult<(HttpResponse, ResponseBody)> {
    trace!(%method, %url, "Sending HTTP request");
    let response = transport
        .fetch(HttpRequest {
            method,
            url,
            headers: headers.clone(),
            body,
        })
        .await?;

    let response = check_response(response)?;
    let decoded = decode_body(&response)?;
    Ok((response, decoded))
}

fn finish(body: ResponseBody, response: HttpResponse, include_response: bool) -> Fetched {
    let keep = include_response || matches!(body, ResponseBody::Raw);
    Fetched {
        body,
        response: keep.then_some(response),
    }
}

/// Maps a non-2xx response to an [`HttpError`], parsing the error body when
/// possible. Body parse failures are ignored.
fn check_response(response: HttpResponse) -> SmartResult<HttpResponse> {
    if response.status.is_success() {
        return Ok(response);
    }

    let status = response.status;
    let mut error = HttpError::new(
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        response.url.as_str(),
    );

    let content_type = response.content_type();
    if is_json(content_type) {
        if let Ok(body) = serde_json::from_slice::<Value>(&response.body) {
            error = error.with_json_body(body);
        }
    } else if is_text(content_type) {
        error = error.with_text_body(response.text());
    }

    Err(SmartError::Http(error))
}

fn decode_body(response: &HttpResponse) -> SmartResult<ResponseBody> {
    let content_type = response.content_type();

    if is_json(content_type) {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ResponseBody::Empty);
        }
        return serde_json::from_slice(&response.body)
            .map(ResponseBody::Json)
            .map_err(|e| SmartError::decode(e.to_string()));
    }

    if is_text(content_type) {
        return Ok(ResponseBody::Text(response.text()));
    }

    Ok(ResponseBody::Raw)
}

/// Matches `json` as a whole word, e.g. `application/fhir+json; charset=utf-8`.
fn is_json(content_type: &str) -> bool {
    content_type
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token.eq_ignore_ascii_case("json"))
}

fn is_text(content_type: &str) -> bool {
    content_type
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/"))
}

/// Resolves `path` against `base`.
///
/// Absolute `http(s)` URLs are returned as-is; anything else is appended to
/// the base with exactly one slash in between.
///
/// # Errors
///
/// Returns [`SmartError::Validation`] if the result is not a valid URL.
pub fn absolute_url(path: &str, base: &Url) -> SmartResult<Url> {
    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(Url::parse(path)?);
    }
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(Url::parse(&joined)?)
}
