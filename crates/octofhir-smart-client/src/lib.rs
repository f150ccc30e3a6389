//! # octofhir-smart-client
//!
//! SMART on FHIR client: authorization launch, token lifecycle and a FHIR
//! REST request pipeline.
//!
//! ## Overview
//!
//! A [`Client`] owns one session. Every request refreshes the access token
//! when it is about to expire (one token call however many requests are
//! waiting), authorizes the request, maps 401/403 to session errors, and
//! post-processes the result: `Reference` fields are resolved into the
//! resource or returned next to it, and Bundles are paged.
//!
//! ## Modules
//!
//! - [`auth`] - discovery, authorization preparation and code exchange
//! - [`client`] - the request pipeline and CRUD helpers
//! - [`token`] - expiry computation and single-flight refresh
//! - [`resolver`] - depth-ordered, cached reference resolution
//! - [`pagination`] - Bundle page walking
//! - [`http`] - transport capability and response decoding
//! - [`storage`] / [`environment`] - host capabilities
//! - [`pkce`] / [`assertion`] / [`security`] - cryptography
//! - [`path`] - dotted-path access into JSON
//! - [`config`] - configuration loading
//!
//! ## Example
//!
//! ```no_run
//! use octofhir_smart_client::{FhirOptions, config::load_config};
//!
//! # async fn run() -> octofhir_smart_client::SmartResult<()> {
//! let client = load_config(None)?.open_client()?;
//! let observations = client
//!     .request(
//!         "Observation?patient=123",
//!         FhirOptions::default().resolve(["subject", "encounter"]).page_limit(0),
//!     )
//!     .await?;
//! println!("{:?}", observations.json());
//! # Ok(())
//! # }
//! ```

pub mod assertion;
pub mod auth;
pub mod client;
pub mod config;
pub mod environment;
pub mod error;
pub mod http;
pub mod pagination;
pub mod path;
pub mod pkce;
pub mod resolver;
pub mod security;
pub mod state;
pub mod storage;
pub mod token;

pub use auth::{
    AuthorizeParams, ClientAuth, CompleteOptions, PreparedAuthorization, SmartConfiguration,
    complete_authorization, fetch_smart_configuration, prepare_authorization,
};
pub use client::{Client, FhirOptions, FhirRequest, FhirResponse, PageCallback};
pub use config::{ClientConfig, load_config};
pub use environment::{DynEnvironment, Environment, StaticEnvironment};
pub use error::{HttpError, SmartError};
pub use http::{
    DynTransport, HttpRequest, HttpResponse, ReqwestTransport, ResponseBody, Transport,
};
pub use pagination::Page;
pub use pkce::PkceMode;
pub use resolver::{ReferenceCache, References};
pub use state::{ClientCredential, ClientState, TokenResponse};
pub use storage::{DynStorage, MemoryStorage, SMART_KEY, Storage};
pub use token::TokenManager;

/// Result type for SMART client operations.
pub type SmartResult<T> = Result<T, SmartError>;
