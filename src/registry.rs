//! The ledger of named token servers
//!
//! The registry maps server names to the server's static configuration and
//! its most recently published token. Reads are snapshots over a watch
//! channel: they never block the publishing server, and the publisher never
//! waits on readers. The write side for a given name is restricted to the
//! owning server by construction, since only it holds the
//! [`TokenPublisher`] returned from registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use aliri_clock::{Clock, UnixTime};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::Error;
use crate::server::{Command, ServerConfig};
use crate::token::Token;
use crate::{ServerName, ServerNameRef};

/// The fetch deadline used when the caller does not pick one
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The live token state of one server, as seen by readers
#[derive(Clone, Debug, Default)]
pub(crate) enum TokenState {
    /// No token has been published yet
    #[default]
    Pending,
    /// The most recently minted token
    Ready(Arc<Token>),
    /// The server was shut down by its host
    Stopped,
    /// The server exhausted its retries and terminated
    Terminated(Error),
}

struct Entry {
    config: Arc<ServerConfig>,
    state: watch::Receiver<TokenState>,
    mailbox: mpsc::Sender<Command>,
}

/// A concurrent name → token map shared by servers and readers
///
/// Cheap to clone; clones all address the same underlying map. Most hosts
/// use the process-wide instance from [`Registry::global`].
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<ServerName, Entry>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<ServerName> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("Registry").field("servers", &names).finish()
    }
}

impl Registry {
    /// Constructs an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry backing the crate-level API
    pub fn global() -> Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new).clone()
    }

    /// Associates a name with a server and hands back its publish side
    ///
    /// Registration is idempotent: a name that is already present is taken
    /// over by the new server and the stale entry is dropped.
    pub(crate) fn register(
        &self,
        config: Arc<ServerConfig>,
        mailbox: mpsc::Sender<Command>,
    ) -> TokenPublisher {
        let (tx, rx) = watch::channel(TokenState::default());
        let entry = Entry {
            config: config.clone(),
            state: rx,
            mailbox,
        };
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.name.clone(), entry);
        TokenPublisher { tx }
    }

    fn lookup(
        &self,
        name: &ServerNameRef,
    ) -> Option<(Arc<ServerConfig>, watch::Receiver<TokenState>, mpsc::Sender<Command>)> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name)
            .map(|entry| (entry.config.clone(), entry.state.clone(), entry.mailbox.clone()))
    }

    /// Takes a point-in-time view of a server's configuration and token
    pub fn snapshot(&self, name: impl AsRef<str>) -> Result<Snapshot, Error> {
        let name = ServerNameRef::from_str(name.as_ref());
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let entry = map
            .get(name)
            .ok_or_else(|| Error::NotRegistered(name.to_owned()))?;
        let token = match &*entry.state.borrow() {
            TokenState::Ready(token) => Some(token.clone()),
            _ => None,
        };
        Ok(Snapshot {
            config: entry.config.clone(),
            token,
        })
    }

    /// Returns a valid token for the named server
    ///
    /// A fresh cached token is returned without suspending. Otherwise the
    /// call rendezvous with the owning server and waits for the outcome of
    /// its next mint, up to `timeout`. Concurrent callers share a single
    /// in-flight mint.
    pub async fn fetch(
        &self,
        name: impl AsRef<str>,
        timeout: Duration,
    ) -> Result<Arc<Token>, Error> {
        let name = ServerNameRef::from_str(name.as_ref());
        let Some((config, state, mailbox)) = self.lookup(name) else {
            return Err(Error::NotRegistered(name.to_owned()));
        };

        match &*state.borrow() {
            TokenState::Ready(token) if !token.is_expired(config.clock.now()) => {
                return Ok(token.clone());
            }
            TokenState::Terminated(error) => return Err(error.clone()),
            TokenState::Stopped => return Err(Error::Cancelled),
            _ => {}
        }

        let (reply, outcome) = oneshot::channel();
        if mailbox.send(Command::Fetch { reply }).await.is_err() {
            return Err(terminal_error(&state));
        }

        match tokio::time::timeout(timeout, outcome).await {
            Err(_elapsed) => Err(Error::Timeout),
            Ok(Err(_closed)) => Err(terminal_error(&state)),
            Ok(Ok(result)) => result,
        }
    }
}

fn terminal_error(state: &watch::Receiver<TokenState>) -> Error {
    match &*state.borrow() {
        TokenState::Terminated(error) => error.clone(),
        _ => Error::Cancelled,
    }
}

/// The single-writer handle a server publishes through
pub(crate) struct TokenPublisher {
    tx: watch::Sender<TokenState>,
}

impl TokenPublisher {
    pub(crate) fn publish(&self, token: Arc<Token>) {
        let _ = self.tx.send(TokenState::Ready(token));
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(TokenState::Stopped);
    }

    pub(crate) fn terminate(&self, error: Error) {
        let _ = self.tx.send(TokenState::Terminated(error));
    }
}

impl fmt::Debug for TokenPublisher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenPublisher").finish_non_exhaustive()
    }
}

/// A point-in-time view of one registered server
#[derive(Clone, Debug)]
pub struct Snapshot {
    config: Arc<ServerConfig>,
    token: Option<Arc<Token>>,
}

impl Snapshot {
    /// The static configuration of the owning server
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The most recently published token, regardless of freshness
    pub fn token(&self) -> Option<&Arc<Token>> {
        self.token.as_ref()
    }

    /// The published token, but only while it is still valid at `now`
    ///
    /// An expired entry is treated as absent: holding one is never grounds
    /// for skipping a mint.
    pub fn fresh_token(&self, now: UnixTime) -> Option<Arc<Token>> {
        self.token
            .as_ref()
            .filter(|token| !token.is_expired(now))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Prefetch;
    use crate::AccessToken;
    use aliri_clock::{DurationSecs, System};

    fn test_config(name: &str) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            name: ServerName::new(name.to_string()),
            refresh_before: DurationSecs(300),
            max_retries: 20,
            prefetch: Prefetch::Async,
            clock: Arc::new(System),
        })
    }

    fn token(value: &str, expires: u64) -> Arc<Token> {
        Arc::new(Token::new(
            AccessToken::new(value.to_string()),
            "Bearer",
            None,
            None,
            UnixTime(expires),
        ))
    }

    #[test]
    fn publish_then_snapshot_returns_the_token() {
        let registry = Registry::new();
        let (mailbox, _rx) = mpsc::channel(1);
        let publisher = registry.register(test_config("svc"), mailbox);

        assert!(registry.snapshot("svc").unwrap().token().is_none());

        let minted = token("t", u64::MAX);
        publisher.publish(minted.clone());

        let snapshot = registry.snapshot("svc").unwrap();
        assert_eq!(
            snapshot.token().unwrap().access_token(),
            minted.access_token()
        );
        assert_eq!(snapshot.config().name.as_str(), "svc");
    }

    #[test]
    fn expired_tokens_are_treated_as_absent() {
        let registry = Registry::new();
        let (mailbox, _rx) = mpsc::channel(1);
        let publisher = registry.register(test_config("svc"), mailbox);
        publisher.publish(token("t", 1_000));

        let snapshot = registry.snapshot("svc").unwrap();
        assert!(snapshot.fresh_token(UnixTime(999)).is_some());
        assert!(snapshot.fresh_token(UnixTime(1_000)).is_none());
    }

    #[test]
    fn unknown_names_are_not_found() {
        let registry = Registry::new();
        assert!(matches!(
            registry.snapshot("nobody"),
            Err(Error::NotRegistered(_))
        ));
    }

    #[test]
    fn reregistration_replaces_the_entry() {
        let registry = Registry::new();
        let (mailbox_a, _rx_a) = mpsc::channel(1);
        let first = registry.register(test_config("svc"), mailbox_a);
        first.publish(token("old", u64::MAX));

        let (mailbox_b, _rx_b) = mpsc::channel(1);
        let _second = registry.register(test_config("svc"), mailbox_b);
        assert!(registry.snapshot("svc").unwrap().token().is_none());
    }
}
