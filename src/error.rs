//! The error taxonomy shared by every component
//!
//! Errors cross component boundaries as values. A single mint outcome may be
//! delivered to many concurrent waiters, so the type is cheaply cloneable
//! with underlying causes held behind [`Arc`]s.

use std::sync::Arc;

use thiserror::Error;

use crate::ServerName;

/// An error while obtaining or serving a token
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The HTTP round-trip to the authority failed outright
    #[error("error sending request to the authority: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The authority answered with a non-200 status
    #[error("unexpected status {status} from the authority: {body}")]
    UnexpectedStatus {
        /// The HTTP status code of the response
        status: u16,
        /// The response body, as text
        body: String,
    },

    /// A 200 response whose body could not be interpreted
    #[error("error decoding token response: {0}")]
    Decode(String),

    /// The assertion could not be built or signed
    #[error("error signing token assertion: {0}")]
    Crypto(Arc<jsonwebtoken::errors::Error>),

    /// The credential source definition is invalid
    #[error("invalid credential source: {0}")]
    Config(String),

    /// The per-call fetch deadline elapsed before the server replied
    #[error("timed out waiting for a token")]
    Timeout,

    /// The server was shut down while the caller was waiting
    #[error("token server was shut down")]
    Cancelled,

    /// No server is registered under the requested name
    #[error("no token server registered as {0:?}")]
    NotRegistered(ServerName),

    /// The server exhausted its retry budget and terminated
    #[error("token refresh retries exhausted: {cause}")]
    FatalRefresh {
        /// The error from the final mint attempt
        cause: Box<Error>,
    },
}

impl Error {
    pub(crate) fn transport<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(cause))
    }

    pub(crate) fn decode(cause: impl std::fmt::Display) -> Self {
        Self::Decode(cause.to_string())
    }

    pub(crate) fn config(cause: impl std::fmt::Display) -> Self {
        Self::Config(cause.to_string())
    }

    /// Whether this error is the terminal state of a server
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalRefresh { .. })
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Crypto(Arc::new(err))
    }
}
