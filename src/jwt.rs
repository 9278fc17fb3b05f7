//! Assertion construction and RS256 signing
//!
//! The signer is a pure function over a claim set and a PEM key. Claim
//! defaults follow the JWT-bearer profile the Google token endpoint expects;
//! caller-supplied claims always win over the defaults.

use aliri_clock::UnixTime;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::PrivateKeyPemRef;

/// The audience used when a service account key carries no `token_uri`
pub const DEFAULT_TOKEN_AUDIENCE: &str = "https://www.googleapis.com/oauth2/v4/token";

/// The scope requested when the caller specifies none
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const ASSERTION_LIFETIME_SECS: u64 = 3_600;

/// Builds the effective claim set for a JWT-bearer assertion
///
/// Defaults are `iss`, `aud`, `iat` and `exp`; entries in `overrides`
/// replace them key by key. When neither `scope` nor `target_audience`
/// survives the merge, a `scope` claim is added from `scopes` (or the
/// cloud-platform default).
pub(crate) fn assertion_claims(
    client_email: &str,
    token_uri: Option<&str>,
    overrides: Option<&Map<String, Value>>,
    scopes: Option<&[String]>,
    now: UnixTime,
) -> Map<String, Value> {
    let mut claims = Map::new();
    claims.insert("iss".into(), Value::from(client_email));
    claims.insert(
        "aud".into(),
        Value::from(token_uri.unwrap_or(DEFAULT_TOKEN_AUDIENCE)),
    );
    claims.insert("iat".into(), Value::from(now.0));
    claims.insert("exp".into(), Value::from(now.0 + ASSERTION_LIFETIME_SECS));

    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            claims.insert(key.clone(), value.clone());
        }
    }

    if !claims.contains_key("scope") && !claims.contains_key("target_audience") {
        claims.insert("scope".into(), Value::from(join_scopes(scopes)));
    }

    claims
}

pub(crate) fn join_scopes(scopes: Option<&[String]>) -> String {
    match scopes {
        Some(scopes) if !scopes.is_empty() => scopes.join(" "),
        _ => DEFAULT_SCOPE.to_string(),
    }
}

/// Signs `claims` into a compact JWS using RS256
///
/// Fails with a crypto error when the PEM cannot be parsed or the signing
/// operation itself fails.
pub(crate) fn sign(claims: &Map<String, Value>, private_key: &PrivateKeyPemRef) -> Result<String, Error> {
    let key = EncodingKey::from_rsa_pem(private_key.as_str().as_bytes())?;
    let header = Header::new(Algorithm::RS256);
    Ok(jsonwebtoken::encode(&header, claims, &key)?)
}

/// Decodes the payload segment of a compact JWS without verifying it
///
/// The caller already trusts the channel the token arrived on; this is only
/// used to read `exp`, `aud` and `sub` out of identity-token responses.
pub(crate) fn decode_payload(jws: &str) -> Result<Value, Error> {
    let payload = jws
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::decode("identity token is not in compact JWS form"))?;
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| Error::decode(format!("identity token payload is not base64url: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| Error::decode(format!("identity token payload is not JSON: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overrides(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn defaults_cover_the_jwt_bearer_profile() {
        let claims = assertion_claims("sa@example.iam", None, None, None, UnixTime(1_000));
        assert_eq!(claims["iss"], json!("sa@example.iam"));
        assert_eq!(claims["aud"], json!(DEFAULT_TOKEN_AUDIENCE));
        assert_eq!(claims["iat"], json!(1_000));
        assert_eq!(claims["exp"], json!(4_600));
        assert_eq!(claims["scope"], json!(DEFAULT_SCOPE));
    }

    #[test]
    fn token_uri_becomes_the_audience() {
        let claims = assertion_claims(
            "sa@example.iam",
            Some("https://oauth2.googleapis.com/token"),
            None,
            None,
            UnixTime(0),
        );
        assert_eq!(claims["aud"], json!("https://oauth2.googleapis.com/token"));
    }

    #[test]
    fn overrides_win_over_defaults() {
        let claims = assertion_claims(
            "sa@example.iam",
            None,
            Some(&overrides(&[("sub", "bob@x"), ("scope", "s")])),
            Some(&["unused".to_string()]),
            UnixTime(0),
        );
        assert_eq!(claims["sub"], json!("bob@x"));
        assert_eq!(claims["scope"], json!("s"));
    }

    #[test]
    fn requested_scopes_are_joined() {
        let scopes = vec!["a".to_string(), "b".to_string()];
        let claims = assertion_claims("sa@example.iam", None, None, Some(&scopes), UnixTime(0));
        assert_eq!(claims["scope"], json!("a b"));
    }

    #[test]
    fn target_audience_suppresses_the_default_scope() {
        let claims = assertion_claims(
            "sa@example.iam",
            None,
            Some(&overrides(&[("target_audience", "https://svc.example")])),
            None,
            UnixTime(0),
        );
        assert!(!claims.contains_key("scope"));
        assert_eq!(claims["target_audience"], json!("https://svc.example"));
    }

    #[test]
    fn sign_then_verify_recovers_the_claims() {
        const KEY: &str = include_str!("../tests/data/rsa_key.pem");
        const PUB: &str = include_str!("../tests/data/rsa_key.pub.pem");

        let now = UnixTime::from(std::time::SystemTime::now());
        let claims = assertion_claims(
            "sa@example.iam",
            None,
            Some(&overrides(&[("sub", "bob@x")])),
            None,
            now,
        );
        let jws = sign(&claims, PrivateKeyPemRef::from_str(KEY)).unwrap();

        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_audience(&[DEFAULT_TOKEN_AUDIENCE]);
        let verified = jsonwebtoken::decode::<Map<String, Value>>(
            &jws,
            &jsonwebtoken::DecodingKey::from_rsa_pem(PUB.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(verified.claims, claims);
    }

    #[test]
    fn sign_rejects_garbage_pem() {
        let claims = assertion_claims("sa@example.iam", None, None, None, UnixTime(0));
        let err = sign(&claims, PrivateKeyPemRef::from_str("not a pem")).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn decode_payload_reads_the_middle_segment() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"exp":123,"aud":"a","sub":"s"}"#);
        let jws = format!("eyJh.{payload}.sig");
        let decoded = decode_payload(&jws).unwrap();
        assert_eq!(decoded["exp"], json!(123));
        assert_eq!(decoded["aud"], json!("a"));
        assert_eq!(decoded["sub"], json!("s"));
    }

    #[test]
    fn decode_payload_rejects_bare_strings() {
        assert!(matches!(decode_payload("nodots"), Err(Error::Decode(_))));
    }
}
