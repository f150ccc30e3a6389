//! Error types for the SMART client.
//!
//! Every fallible operation in this crate returns [`SmartError`]. The enum is
//! `Clone` because a single token refresh or reference fetch can be awaited
//! by many callers at once, and each of them receives the same outcome.

use serde_json::Value;

/// Hint appended to errors that end the current session.
pub const SESSION_EXPIRED_HINT: &str = "Your session has expired! Please re-launch the app";

/// Hint appended to a 401 received before any access token was obtained.
pub const NOT_LAUNCHED_HINT: &str =
    "This app cannot be accessed directly. Please launch it as SMART app!";

/// A non-2xx HTTP response.
///
/// The message always starts with `"<status> <statusText>\nURL: <url>"`.
/// When the error body could be read it is appended to the message and kept
/// in [`HttpError::body`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase for the status.
    pub status_text: String,
    /// URL of the failed request.
    pub url: String,
    /// Human readable message, enriched with the parsed error body.
    pub message: String,
    /// Parsed error body (JSON, or a JSON string for text bodies).
    pub body: Option<Value>,
}

impl HttpError {
    /// Creates an error without any body details.
    #[must_use]
    pub fn new(status: u16, status_text: impl Into<String>, url: impl Into<String>) -> Self {
        let status_text = status_text.into();
        let url = url.into();
        Self {
            message: format!("{status} {status_text}\nURL: {url}"),
            status,
            status_text,
            url,
            body: None,
        }
    }

    /// Attaches a parsed JSON error body and extends the message with it.
    ///
    /// OAuth-style bodies (`error` / `error_description`) are rendered as
    /// `error: description`; any other JSON is appended verbatim.
    #[must_use]
    pub fn with_json_body(mut self, body: Value) -> Self {
        match body.get("error").and_then(Value::as_str) {
            Some(error) => {
                self.message.push_str("\n\n");
                self.message.push_str(error);
                if let Some(description) = body.get("error_description").and_then(Value::as_str) {
                    self.message.push_str(": ");
                    self.message.push_str(description);
                }
            }
            None => {
                self.message.push_str("\n\n");
                self.message.push_str(&body.to_string());
            }
        }
        self.body = Some(body);
        self
    }

    /// Attaches a text error body. Empty bodies are ignored.
    #[must_use]
    pub fn with_text_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        if !body.is_empty() {
            self.message.push_str("\n\n");
            self.message.push_str(&body);
            self.body = Some(Value::String(body));
        }
        self
    }
}

/// Errors produced by the SMART client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SmartError {
    /// The server answered with a non-success status.
    #[error("{0}")]
    Http(HttpError),

    /// The transport failed before a response was received.
    #[error("Network error: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// Required configuration is missing. Never retried.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the missing or invalid setting.
        message: String,
    },

    /// The session can no longer be used; the stored token state was cleared.
    #[error("{error}\n{hint}")]
    AuthExpired {
        /// The 401 that ended the session.
        error: HttpError,
        /// What the user should do next.
        hint: &'static str,
    },

    /// The server refused the request (403). Session state is kept.
    #[error("{0}")]
    Permission(HttpError),

    /// Input failed validation before any request was made.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the invalid input.
        message: String,
    },

    /// The storage backend failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// Key import, signing or randomness failed.
    #[error("Security error: {message}")]
    Security {
        /// Description of the failure.
        message: String,
    },

    /// A success response carried a body that could not be decoded.
    #[error("Failed to decode response: {message}")]
    Decode {
        /// Description of the decoding failure.
        message: String,
    },

    /// The authorization server redirected back with an `error` parameter.
    #[error("Authorization failed: {message}")]
    Authorization {
        /// `error` and `error_description` from the redirect.
        message: String,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SmartError {
    /// Creates a new `Network` error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Security` error.
    #[must_use]
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    /// Creates a new `Decode` error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a new `Authorization` error.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Returns the underlying HTTP error, if this error came from a response.
    #[must_use]
    pub fn http_error(&self) -> Option<&HttpError> {
        match self {
            Self::Http(e) | Self::Permission(e) | Self::AuthExpired { error: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Returns the HTTP status code, if this error came from a response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.http_error().map(|e| e.status)
    }

    /// Returns `true` for a 404 response.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Returns `true` if the session ended and must be re-launched.
    #[must_use]
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }

    /// Returns `true` for a 403 response.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Permission(_))
    }
}

impl From<HttpError> for SmartError {
    fn from(error: HttpError) -> Self {
        Self::Http(error)
    }
}

impl From<reqwest::Error> for SmartError {
    fn from(error: reqwest::Error) -> Self {
        Self::network(error.to_string())
    }
}

impl From<url::ParseError> for SmartError {
    fn from(error: url::ParseError) -> Self {
        Self::validation(format!("Invalid URL: {error}"))
    }
}
