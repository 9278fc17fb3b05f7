//! Retry delay generation
//!
//! Three strategies are available. `exp` doubles from the minimum, `rand`
//! draws uniformly from the configured interval, and `rand_exp` (the
//! default) grows a randomized window so concurrent servers spread out
//! without one of them being permanently unlucky. Every generated delay
//! lies in `[min, max]` milliseconds.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Error;

/// The delay growth strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackoffKind {
    /// Uniformly random delays over `[min, max]`
    Rand,
    /// Deterministic doubling from `min`, capped at `max`
    Exp,
    /// Randomized exponential growth
    #[default]
    RandExp,
}

/// Configuration for how retry delays are generated
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    kind: BackoffKind,
    min: u64,
    max: u64,
}

impl Default for BackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses randomized exponential growth between 1 and 30 seconds.
    fn default() -> Self {
        Self {
            kind: BackoffKind::RandExp,
            min: 1_000,
            max: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Constructs a validated backoff configuration
    ///
    /// `min` and `max` are in milliseconds. Fails when `min > max`.
    pub fn new(kind: BackoffKind, min: u64, max: u64) -> Result<Self, Error> {
        if min > max {
            return Err(Error::config(format!(
                "backoff min ({min} ms) must not exceed max ({max} ms)"
            )));
        }
        Ok(Self { kind, min, max })
    }

    /// The configured strategy
    #[inline]
    pub fn kind(&self) -> BackoffKind {
        self.kind
    }

    /// The smallest delay this configuration will generate, in milliseconds
    #[inline]
    pub fn min(&self) -> u64 {
        self.min
    }

    /// The largest delay this configuration will generate, in milliseconds
    #[inline]
    pub fn max(&self) -> u64 {
        self.max
    }
}

enum State {
    Rand,
    Exp { prev: Option<u64> },
    RandExp { prev: u64, lower: u64 },
}

/// A stateful generator of retry delays
pub struct Backoff {
    config: BackoffConfig,
    state: State,
    rng: StdRng,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Backoff").field("config", &self.config).finish()
    }
}

impl Backoff {
    /// Constructs a fresh generator from a validated configuration
    pub fn new(config: BackoffConfig) -> Self {
        let state = Self::initial_state(&config);
        Self {
            config,
            state,
            rng: StdRng::from_entropy(),
        }
    }

    fn initial_state(config: &BackoffConfig) -> State {
        match config.kind {
            BackoffKind::Rand => State::Rand,
            BackoffKind::Exp => State::Exp { prev: None },
            BackoffKind::RandExp => State::RandExp {
                prev: config.min,
                lower: config.min.max(config.max / 3),
            },
        }
    }

    /// Produces the next delay in milliseconds
    ///
    /// The result always lies in `[min, max]`.
    pub fn next(&mut self) -> u64 {
        let (min, max) = (self.config.min, self.config.max);
        match &mut self.state {
            State::Rand => self.rng.gen_range(min..=max),
            State::Exp { prev } => {
                let next = match *prev {
                    None => min,
                    Some(p) => p.saturating_mul(2).min(max),
                };
                *prev = Some(next);
                next
            }
            State::RandExp { prev, lower } => {
                let lo = (*prev).min(*lower);
                let hi = prev.saturating_mul(3).min(max);
                let next = self.rng.gen_range(lo..=hi);
                *prev = next;
                next
            }
        }
    }

    /// Returns the generator to its freshly-initialized behavior
    ///
    /// For the `rand` strategy this is a no-op so the random sequence
    /// continues uninterrupted.
    pub fn reset(&mut self) {
        match &mut self.state {
            State::Rand => {}
            State::Exp { prev } => *prev = None,
            State::RandExp { prev, .. } => *prev = self.config.min,
        }
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_bounds() {
        assert!(BackoffConfig::new(BackoffKind::Exp, 500, 100).is_err());
        assert!(BackoffConfig::new(BackoffKind::Exp, 100, 100).is_ok());
    }

    #[test]
    fn exp_doubles_from_min_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::new(BackoffKind::Exp, 100, 1_500).unwrap());
        assert_eq!(backoff.next(), 100);
        assert_eq!(backoff.next(), 200);
        assert_eq!(backoff.next(), 400);
        assert_eq!(backoff.next(), 800);
        assert_eq!(backoff.next(), 1_500);
        assert_eq!(backoff.next(), 1_500);
    }

    #[test]
    fn exp_is_monotone_until_the_cap() {
        let mut backoff =
            Backoff::new(BackoffConfig::new(BackoffKind::Exp, 1, 10_000).unwrap());
        let mut prev = 0;
        for _ in 0..20 {
            let next = backoff.next();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn exp_reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(BackoffConfig::new(BackoffKind::Exp, 100, 1_500).unwrap());
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), 100);
    }

    #[test]
    fn rand_stays_within_bounds() {
        let mut backoff =
            Backoff::new(BackoffConfig::new(BackoffKind::Rand, 250, 750).unwrap());
        for _ in 0..200 {
            let delay = backoff.next();
            assert!((250..=750).contains(&delay));
        }
    }

    #[test]
    fn rand_exp_stays_within_bounds() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..200 {
            let delay = backoff.next();
            assert!((1_000..=30_000).contains(&delay));
        }
    }

    #[test]
    fn rand_exp_reset_returns_to_the_initial_window() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..10 {
            backoff.next();
        }
        backoff.reset();
        // freshly initialized, the window tops out at min * 3
        let delay = backoff.next();
        assert!((1_000..=3_000).contains(&delay));
    }

    #[test]
    fn degenerate_interval_is_constant() {
        let mut backoff =
            Backoff::new(BackoffConfig::new(BackoffKind::Rand, 42, 42).unwrap());
        assert_eq!(backoff.next(), 42);
        assert_eq!(backoff.next(), 42);
    }
}
