use aliri_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::AccessToken;

/// A bearer token as minted by the authority
///
/// The value is immutable: servers replace the whole token atomically rather
/// than updating one in place. `expires` is an absolute unix timestamp,
/// derived from the authority's `expires_in` against the local clock at the
/// time of the successful response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    access_token: AccessToken,
    token_type: String,
    scope: Option<String>,
    sub: Option<String>,
    expires: UnixTime,
}

impl Token {
    /// Constructs a token from its parts
    pub fn new(
        access_token: AccessToken,
        token_type: impl Into<String>,
        scope: Option<String>,
        sub: Option<String>,
        expires: UnixTime,
    ) -> Self {
        Self {
            access_token,
            token_type: token_type.into(),
            scope,
            sub,
            expires,
        }
    }

    /// The bearer credential presented as `Authorization: Bearer <token>`
    #[inline]
    pub fn access_token(&self) -> &crate::AccessTokenRef {
        &self.access_token
    }

    /// The token type reported by the authority, typically `"Bearer"`
    #[inline]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// The space-separated scopes the token was granted for, if known
    #[inline]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// The subject the token was minted on behalf of, if any
    #[inline]
    pub fn sub(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    /// The absolute time at which the token stops being valid
    #[inline]
    pub fn expires(&self) -> UnixTime {
        self.expires
    }

    /// Whether the token is stale as of `now`
    #[inline]
    pub fn is_expired(&self, now: UnixTime) -> bool {
        now >= self.expires
    }

    /// How much longer the token remains valid as of `now`
    #[inline]
    pub fn until_expiry(&self, now: UnixTime) -> DurationSecs {
        if now < self.expires {
            self.expires - now
        } else {
            DurationSecs(0)
        }
    }

    /// The delay until a proactive refresh should run
    ///
    /// A result of zero means the token is already within `refresh_before`
    /// of its expiry and should be refreshed immediately.
    #[inline]
    pub fn refresh_delay(&self, now: UnixTime, refresh_before: DurationSecs) -> DurationSecs {
        DurationSecs(
            self.expires
                .0
                .saturating_sub(now.0)
                .saturating_sub(refresh_before.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_expiring_at(expires: u64) -> Token {
        Token::new(
            AccessToken::from_static("t"),
            "Bearer",
            None,
            None,
            UnixTime(expires),
        )
    }

    #[test]
    fn expiry_is_inclusive() {
        let token = token_expiring_at(1000);
        assert!(!token.is_expired(UnixTime(999)));
        assert!(token.is_expired(UnixTime(1000)));
        assert!(token.is_expired(UnixTime(1001)));
    }

    #[test]
    fn refresh_delay_counts_down_to_zero() {
        let token = token_expiring_at(1000);
        assert_eq!(
            token.refresh_delay(UnixTime(400), DurationSecs(300)),
            DurationSecs(300)
        );
        assert_eq!(
            token.refresh_delay(UnixTime(700), DurationSecs(300)),
            DurationSecs(0)
        );
        // already past expiry
        assert_eq!(
            token.refresh_delay(UnixTime(2000), DurationSecs(300)),
            DurationSecs(0)
        );
    }

    #[test]
    fn until_expiry_saturates() {
        let token = token_expiring_at(1000);
        assert_eq!(token.until_expiry(UnixTime(600)), DurationSecs(400));
        assert_eq!(token.until_expiry(UnixTime(1200)), DurationSecs(0));
    }
}
