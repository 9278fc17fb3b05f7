//! Background management of Google Cloud OAuth2 access tokens
//!
//! This library mints short-lived bearer tokens for Google Cloud APIs and
//! keeps them fresh so that consumers need be hardly aware refreshes are
//! happening at all. Each credential identity gets a named, long-lived
//! *token server*: the server mints through the authority, caches the
//! result in a registry for lock-free reads, schedules a proactive refresh
//! ahead of expiry, and retries failures with bounded backoff. Callers ask
//! for tokens by name and either hit the cache without suspending or
//! rendezvous with the owning server, sharing a single in-flight mint with
//! every other concurrent caller.
//!
//! Four credential sources are supported: service account keys (the
//! JWT-bearer grant, including identity tokens via `target_audience`),
//! authorized-user refresh tokens, the per-VM instance metadata service,
//! and workload identity federation with optional service account
//! impersonation. When no source is configured, the ambient environment is
//! probed the way application default credentials are.
//!
//! # General flow
//!
//! On application start-up, start one server per credential identity you
//! need. Afterwards, [`fetch`] by name from anywhere in the process.
//!
//! ```no_run
//! use gcp_tokens::{Credentials, Source, TokenServer};
//!
//! # async fn example() -> Result<(), gcp_tokens::Error> {
//! let key_json = std::fs::read_to_string("service-account.json")
//!     .map_err(|e| gcp_tokens::Error::Config(e.to_string()))?;
//!
//! let source = Source::new(Credentials::from_json(&key_json)?)
//!     .with_scopes(["https://www.googleapis.com/auth/pubsub"]);
//!
//! TokenServer::new("pubsub").with_source(source).start().await?;
//!
//! let token = gcp_tokens::fetch("pubsub").await?;
//! tracing::info!(
//!     token = format_args!("{:#?}", token.access_token()),
//!     "first access token"
//! );
//! # Ok(())
//! # }
//! ```
//!
//! The server keeps refreshing in the background; a later `fetch` under the
//! same name returns the cached token without a network round-trip until
//! the refresh window opens again. A server whose refreshes keep failing
//! retries with backoff up to its retry budget and then terminates;
//! subsequent fetches surface the fatal error so the host can restart it.
//!
//! The HTTP transport is injectable per server through the
//! [`HttpGateway`] trait, which is also how the test suite drives every
//! lifecycle scenario without a network.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::sync::Arc;
use std::time::Duration;

pub mod backoff;
mod braids;
mod error;
pub mod http;
mod jwt;
mod mint;
mod registry;
mod server;
pub mod source;
mod token;

pub use braids::*;
pub use error::Error;
pub use http::{HttpGateway, ReqwestGateway};
pub use jwt::{DEFAULT_SCOPE, DEFAULT_TOKEN_AUDIENCE};
pub use registry::{Registry, Snapshot, DEFAULT_FETCH_TIMEOUT};
pub use server::{Prefetch, ServerConfig, ServerHandle, TokenServer};
pub use source::{Credentials, Options, Source, SubjectTokenSource};
pub use token::Token;

/// Fetches a token from the globally-registered server named `name`
///
/// Equivalent to [`fetch_with_timeout`] with the default five-second
/// deadline. A fresh cached token is returned without suspending.
pub async fn fetch(name: impl AsRef<str>) -> Result<Arc<Token>, Error> {
    Registry::global().fetch(name, DEFAULT_FETCH_TIMEOUT).await
}

/// Fetches a token from the globally-registered server named `name`,
/// waiting at most `timeout` for a mint in progress
pub async fn fetch_with_timeout(
    name: impl AsRef<str>,
    timeout: Duration,
) -> Result<Arc<Token>, Error> {
    Registry::global().fetch(name, timeout).await
}
