//! Host environment capability.
//!
//! The host knows the URL the app was loaded from (where the authorization
//! server redirected back to) and how to resolve relative paths against it.
//! Executing redirects stays with the host.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::SmartResult;

/// What the SMART flow needs from its host.
#[async_trait]
pub trait Environment: Send + Sync {
    /// The URL the app is currently served at, including the query string.
    async fn current_url(&self) -> SmartResult<Url>;

    /// Resolves `path` against the current URL.
    async fn resolve_relative(&self, path: &str) -> SmartResult<Url> {
        Ok(self.current_url().await?.join(path)?)
    }
}

/// Shared environment handle.
pub type DynEnvironment = Arc<dyn Environment>;

/// An [`Environment`] with a fixed current URL.
///
/// Suits servers handling the redirect callback: build one per callback
/// request from the incoming request URL.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    url: Url,
}

impl StaticEnvironment {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Parses `url` first.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Validation`](crate::SmartError::Validation) for
    /// unparsable URLs.
    pub fn parse(url: &str) -> SmartResult<Self> {
        Ok(Self::new(Url::parse(url)?))
    }
}

#[async_trait]
impl Environment for StaticEnvironment {
    async fn current_url(&self) -> SmartResult<Url> {
        Ok(self.url.clone())
    }
}
