//! The per-name token server
//!
//! One server owns one credential identity. It runs as a task with a
//! mailbox: callers rendezvous with it through the registry, and because
//! minting happens inline in the task there is never more than one mint in
//! flight for a name. After every successful mint the server arms a
//! proactive refresh timer; failures move it into backoff until either a
//! mint succeeds or the retry budget is exhausted and the server
//! terminates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aliri_clock::{Clock, DurationSecs, System};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::Error;
use crate::http::{HttpGateway, ReqwestGateway};
use crate::mint;
use crate::registry::{Registry, TokenPublisher, DEFAULT_FETCH_TIMEOUT};
use crate::source::{self, Source};
use crate::token::Token;
use crate::{ServerName, ServerNameRef};

const DEFAULT_REFRESH_BEFORE: DurationSecs = DurationSecs(300);
const DEFAULT_MAX_RETRIES: u32 = 20;
const DEFAULT_MAX_RETRIES_CUSTOM_DELAY: u32 = 10;
const MAILBOX_CAPACITY: usize = 16;

/// Whether `start` waits for the first mint attempt
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Prefetch {
    /// `start` returns once one mint attempt has completed, success or not
    Sync,
    /// `start` returns immediately; the first mint runs concurrently
    #[default]
    Async,
}

/// The static configuration of a running server, visible through snapshots
pub struct ServerConfig {
    /// The name the server is registered under
    pub name: ServerName,
    /// How far ahead of expiry the proactive refresh runs
    pub refresh_before: DurationSecs,
    /// How many consecutive failed mints are tolerated before terminating
    pub max_retries: u32,
    /// The prefetch mode the server was started with
    pub prefetch: Prefetch,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("refresh_before", &self.refresh_before)
            .field("max_retries", &self.max_retries)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

pub(crate) enum Command {
    Fetch {
        reply: oneshot::Sender<Result<Arc<Token>, Error>>,
    },
    Shutdown,
}

type RetryDelayFn = dyn Fn(u32) -> Duration + Send + Sync;

enum Delays {
    Backoff(Backoff),
    Custom(Arc<RetryDelayFn>),
}

/// A builder for starting a named token server
///
/// ```no_run
/// # async fn example() -> Result<(), gcp_tokens::Error> {
/// use gcp_tokens::{Credentials, Source, TokenServer};
///
/// let source = Source::new(Credentials::from_json(&std::fs::read_to_string(
///     "service-account.json",
/// ).expect("key file"))?)
/// .with_scopes(["https://www.googleapis.com/auth/devstorage.read_only"]);
///
/// TokenServer::new("gcs").with_source(source).start().await?;
///
/// let token = gcp_tokens::fetch("gcs").await?;
/// println!("bearer {:#}", token.access_token());
/// # Ok(())
/// # }
/// ```
pub struct TokenServer {
    name: ServerName,
    source: Option<Source>,
    http: Option<Arc<dyn HttpGateway>>,
    registry: Option<Registry>,
    refresh_before: DurationSecs,
    backoff: BackoffConfig,
    retry_delay: Option<Arc<RetryDelayFn>>,
    max_retries: Option<u32>,
    prefetch: Prefetch,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for TokenServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenServer")
            .field("name", &self.name)
            .field("refresh_before", &self.refresh_before)
            .field("backoff", &self.backoff)
            .field("max_retries", &self.max_retries)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

impl TokenServer {
    /// Begins configuring a server registered under `name`
    pub fn new(name: impl Into<ServerName>) -> Self {
        Self {
            name: name.into(),
            source: None,
            http: None,
            registry: None,
            refresh_before: DEFAULT_REFRESH_BEFORE,
            backoff: BackoffConfig::default(),
            retry_delay: None,
            max_retries: None,
            prefetch: Prefetch::default(),
            clock: Arc::new(System),
        }
    }

    /// Sets the credential source
    ///
    /// When no source is provided, the ambient environment is probed at
    /// start time ([`source::default::discover`]).
    pub fn with_source(mut self, source: impl Into<Source>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Routes the server's token traffic through a custom gateway
    pub fn with_http(mut self, http: impl HttpGateway + 'static) -> Self {
        self.http = Some(Arc::new(http));
        self
    }

    /// Registers the server somewhere other than the global registry
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets how far ahead of expiry tokens are refreshed
    pub fn with_refresh_before(mut self, refresh_before: DurationSecs) -> Self {
        self.refresh_before = refresh_before;
        self
    }

    /// Sets the backoff configuration used between failed mints
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces backoff with a custom retry delay per attempt number
    ///
    /// The function receives the 1-based retry count. With a custom delay
    /// the default retry budget drops to 10.
    pub fn with_retry_delay(
        mut self,
        delay: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.retry_delay = Some(Arc::new(delay));
        self
    }

    /// Overrides the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the prefetch mode
    pub fn with_prefetch(mut self, prefetch: Prefetch) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Substitutes the clock used for expiry arithmetic
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Starts the server and registers it under its name
    ///
    /// With [`Prefetch::Sync`] the call resolves only after the first mint
    /// attempt has completed (successfully or not); with the default
    /// [`Prefetch::Async`] it returns at once and the first mint runs in
    /// the background.
    pub async fn start(self) -> Result<ServerHandle, Error> {
        let source = match self.source {
            Some(source) => source,
            None => source::default::discover()?,
        };
        let registry = self.registry.unwrap_or_else(Registry::global);
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestGateway::default()));
        let max_retries = self.max_retries.unwrap_or(if self.retry_delay.is_some() {
            DEFAULT_MAX_RETRIES_CUSTOM_DELAY
        } else {
            DEFAULT_MAX_RETRIES
        });
        let delays = match self.retry_delay {
            Some(delay) => Delays::Custom(delay),
            None => Delays::Backoff(Backoff::new(self.backoff)),
        };

        let config = Arc::new(ServerConfig {
            name: self.name.clone(),
            refresh_before: self.refresh_before,
            max_retries,
            prefetch: self.prefetch,
            clock: self.clock.clone(),
        });

        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let publisher = registry.register(config, mailbox_tx.clone());
        let (first_attempt_tx, first_attempt_rx) = oneshot::channel();

        let task = ServerTask {
            name: self.name.clone(),
            source,
            http,
            clock: self.clock,
            publisher,
            mailbox: mailbox_rx,
            refresh_before: self.refresh_before,
            delays,
            max_retries,
            retries: 0,
            backing_off: false,
            terminated: false,
            token: None,
            waiters: Vec::new(),
            next_wake: None,
            first_attempt: Some(first_attempt_tx),
        };
        let join = tokio::spawn(task.run());

        if self.prefetch == Prefetch::Sync {
            // resolves regardless of whether the first mint succeeded
            let _ = first_attempt_rx.await;
        }

        Ok(ServerHandle {
            name: self.name,
            registry,
            mailbox: mailbox_tx,
            join,
        })
    }
}

/// A handle to a running token server
///
/// Dropping the handle leaves the server running; it remains reachable by
/// name through its registry. Use [`shutdown`][ServerHandle::shutdown] to
/// stop it.
pub struct ServerHandle {
    name: ServerName,
    registry: Registry,
    mailbox: mpsc::Sender<Command>,
    join: JoinHandle<()>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// The name the server is registered under
    pub fn name(&self) -> &ServerNameRef {
        &self.name
    }

    /// Fetches a token from this server with the default timeout
    pub async fn fetch(&self) -> Result<Arc<Token>, Error> {
        self.registry
            .fetch(self.name.as_str(), DEFAULT_FETCH_TIMEOUT)
            .await
    }

    /// Fetches a token from this server, waiting up to `timeout`
    pub async fn fetch_with_timeout(&self, timeout: Duration) -> Result<Arc<Token>, Error> {
        self.registry.fetch(self.name.as_str(), timeout).await
    }

    /// Stops the server, cancelling its refresh timer
    ///
    /// Callers waiting on a rendezvous receive `Cancelled`.
    pub async fn shutdown(self) {
        let _ = self.mailbox.send(Command::Shutdown).await;
        let _ = self.join.await;
    }
}

struct ServerTask {
    name: ServerName,
    source: Source,
    http: Arc<dyn HttpGateway>,
    clock: Arc<dyn Clock + Send + Sync>,
    publisher: TokenPublisher,
    mailbox: mpsc::Receiver<Command>,
    refresh_before: DurationSecs,
    delays: Delays,
    max_retries: u32,
    retries: u32,
    backing_off: bool,
    terminated: bool,
    token: Option<Arc<Token>>,
    waiters: Vec<oneshot::Sender<Result<Arc<Token>, Error>>>,
    next_wake: Option<Instant>,
    first_attempt: Option<oneshot::Sender<()>>,
}

impl ServerTask {
    #[tracing::instrument(skip_all, fields(server = %self.name))]
    async fn run(mut self) {
        self.attempt().await;
        if let Some(first_attempt) = self.first_attempt.take() {
            let _ = first_attempt.send(());
        }

        while !self.terminated {
            let wake = self.next_wake;
            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(Command::Fetch { reply }) => self.handle_fetch(reply).await,
                    Some(Command::Shutdown) | None => {
                        self.cancel_waiters();
                        self.publisher.stop();
                        tracing::debug!("token server stopped");
                        return;
                    }
                },
                _ = sleep_until_or_park(wake), if wake.is_some() => {
                    self.next_wake = None;
                    self.attempt().await;
                }
            }
        }
    }

    async fn handle_fetch(&mut self, reply: oneshot::Sender<Result<Arc<Token>, Error>>) {
        if let Some(token) = &self.token {
            if !token.is_expired(self.clock.now()) {
                let _ = reply.send(Ok(token.clone()));
                return;
            }
        }

        self.waiters.push(reply);
        // while backing off, arriving callers wait for the retry timer
        // instead of hammering the authority
        if !self.backing_off {
            self.next_wake = None;
            self.attempt().await;
        }
    }

    async fn attempt(&mut self) {
        match mint::mint(&self.source, &*self.http, &*self.clock).await {
            Ok(token) => self.on_minted(Arc::new(token)),
            Err(error) => self.on_mint_error(error),
        }
    }

    fn on_minted(&mut self, token: Arc<Token>) {
        self.token = Some(token.clone());
        self.publisher.publish(token.clone());
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(token.clone()));
        }

        self.retries = 0;
        self.backing_off = false;
        if let Delays::Backoff(backoff) = &mut self.delays {
            backoff.reset();
        }

        let delay = token.refresh_delay(self.clock.now(), self.refresh_before);
        tracing::debug!(
            expires = token.expires().0,
            delay = delay.0,
            "token minted, refresh scheduled"
        );
        self.next_wake = Some(Instant::now() + Duration::from(delay));
    }

    fn on_mint_error(&mut self, error: Error) {
        if self.retries >= self.max_retries {
            tracing::error!(
                error = (&error as &dyn std::error::Error),
                retries = self.retries,
                "token refresh retries exhausted, terminating"
            );
            let fatal = Error::FatalRefresh {
                cause: Box::new(error),
            };
            self.publisher.terminate(fatal.clone());
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(Err(fatal.clone()));
            }
            self.terminated = true;
            return;
        }

        self.retries += 1;
        self.backing_off = true;
        let delay = match &mut self.delays {
            Delays::Backoff(backoff) => Duration::from_millis(backoff.next()),
            Delays::Custom(delay) => (**delay)(self.retries),
        };
        tracing::warn!(
            error = (&error as &dyn std::error::Error),
            retries = self.retries,
            delay_ms = delay.as_millis() as u64,
            "error requesting token, will retry"
        );
        self.next_wake = Some(Instant::now() + delay);
    }

    fn cancel_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::Cancelled));
        }
    }
}

// select! evaluates disabled branch expressions, so a parked sleep stands
// in when no wake-up is scheduled
fn sleep_until_or_park(wake: Option<Instant>) -> tokio::time::Sleep {
    const PARK: Duration = Duration::from_secs(86_400);
    tokio::time::sleep_until(wake.unwrap_or_else(|| Instant::now() + PARK))
}
