//! Stateless, source-aware token minting
//!
//! One call performs exactly one mint attempt over the injected gateway.
//! Caching, refresh timers and retries all live in the server; everything
//! here is a straight-line protocol per credential variant.

use aliri_clock::{Clock, DurationSecs, UnixTime};
use serde_json::{json, Value};

use crate::error::Error;
use crate::http::{HttpGateway, Request, Response};
use crate::jwt;
use crate::source::{Credentials, Options, Source, DEFAULT_REFRESH_TOKEN_URL};
use crate::token::Token;
use crate::AccessToken;

pub(crate) mod dto;

const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Mints one token for `source`
///
/// Exactly one attempt; every failure is reported as a value from the
/// shared taxonomy and left for the caller to classify.
pub(crate) async fn mint(
    source: &Source,
    http: &dyn HttpGateway,
    clock: &(dyn Clock + Send + Sync),
) -> Result<Token, Error> {
    tracing::trace!(source = source.credentials.kind(), "requesting token from authority");
    match &source.credentials {
        Credentials::ServiceAccount {
            client_email,
            private_key,
            token_uri,
            ..
        } => {
            mint_service_account(
                client_email,
                private_key,
                token_uri.as_deref(),
                &source.options,
                http,
                clock,
            )
            .await
        }
        Credentials::RefreshToken {
            client_id,
            client_secret,
            refresh_token,
        } => {
            mint_refresh_token(
                client_id.as_str(),
                client_secret.as_str(),
                refresh_token.as_str(),
                &source.options,
                http,
                clock,
            )
            .await
        }
        Credentials::Metadata {
            account,
            base_url,
            audience,
        } => {
            mint_metadata(
                account,
                base_url,
                source.options.audience.as_deref().or(audience.as_deref()),
                http,
                clock,
            )
            .await
        }
        Credentials::WorkloadIdentity {
            token_url,
            audience,
            sa_impersonation_url,
            subject_token_source,
            ..
        } => {
            mint_workload_identity(
                token_url,
                source.options.audience.as_deref().or(audience.as_deref()),
                source.credentials.subject_token_type(),
                sa_impersonation_url.as_deref(),
                subject_token_source,
                &source.options,
                http,
                clock,
            )
            .await
        }
    }
}

impl Credentials {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::ServiceAccount { .. } => "service_account",
            Self::RefreshToken { .. } => "refresh_token",
            Self::Metadata { .. } => "metadata",
            Self::WorkloadIdentity { .. } => "workload_identity",
        }
    }
}

async fn mint_service_account(
    client_email: &str,
    private_key: &crate::PrivateKeyPemRef,
    token_uri: Option<&str>,
    options: &Options,
    http: &dyn HttpGateway,
    clock: &(dyn Clock + Send + Sync),
) -> Result<Token, Error> {
    let claims = jwt::assertion_claims(
        client_email,
        token_uri,
        options.claims.as_ref(),
        options.scopes.as_deref(),
        clock.now(),
    );
    let assertion = jwt::sign(&claims, private_key)?;

    let url = options
        .url
        .as_deref()
        .or(token_uri)
        .unwrap_or(jwt::DEFAULT_TOKEN_AUDIENCE);
    let body = form(&[("grant_type", JWT_BEARER_GRANT_TYPE), ("assertion", &assertion)]);
    let response = expect_ok(post_form(http, url, body).await?)?;

    let parsed: dto::TokenResponse = response.json()?;
    if let Some(access_token) = parsed.access_token {
        let expires_in = parsed
            .expires_in
            .ok_or_else(|| Error::decode("token response is missing expires_in"))?;
        let scope = parsed.scope.or_else(|| claim_string(&claims, "scope"));
        let sub = parsed.sub.or_else(|| claim_string(&claims, "sub"));
        Ok(Token::new(
            access_token,
            parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope,
            sub,
            clock.now() + DurationSecs(expires_in),
        ))
    } else if let Some(id_token) = parsed.id_token {
        token_from_identity_jws(id_token.as_str())
    } else {
        Err(Error::decode(
            "token response carries neither access_token nor id_token",
        ))
    }
}

async fn mint_refresh_token(
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
    options: &Options,
    http: &dyn HttpGateway,
    clock: &(dyn Clock + Send + Sync),
) -> Result<Token, Error> {
    let url = options.url.as_deref().unwrap_or(DEFAULT_REFRESH_TOKEN_URL);
    let body = form(&[
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ]);
    let response = expect_ok(post_form(http, url, body).await?)?;

    let parsed: dto::TokenResponse = response.json()?;
    let access_token = parsed
        .access_token
        .ok_or_else(|| Error::decode("token response is missing access_token"))?;
    let expires_in = parsed
        .expires_in
        .ok_or_else(|| Error::decode("token response is missing expires_in"))?;
    let scope = parsed
        .scope
        .or_else(|| options.scopes.as_deref().map(|s| jwt::join_scopes(Some(s))));
    Ok(Token::new(
        access_token,
        parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
        scope,
        parsed.sub,
        clock.now() + DurationSecs(expires_in),
    ))
}

async fn mint_metadata(
    account: &str,
    base_url: &str,
    audience: Option<&str>,
    http: &dyn HttpGateway,
    clock: &(dyn Clock + Send + Sync),
) -> Result<Token, Error> {
    if let Some(audience) = audience {
        let query = form(&[("audience", audience)]);
        let url = format!(
            "{base_url}/computeMetadata/v1/instance/service-accounts/{account}/identity?{query}"
        );
        let response = expect_ok(metadata_get(http, url).await?)?;
        // the identity endpoint answers with the bare compact JWS
        return token_from_identity_jws(response.text().trim());
    }

    let url =
        format!("{base_url}/computeMetadata/v1/instance/service-accounts/{account}/token");
    let response = expect_ok(metadata_get(http, url).await?)?;

    let parsed: dto::TokenResponse = response.json()?;
    let access_token = parsed
        .access_token
        .ok_or_else(|| Error::decode("metadata response is missing access_token"))?;
    let expires_in = parsed
        .expires_in
        .ok_or_else(|| Error::decode("metadata response is missing expires_in"))?;
    Ok(Token::new(
        access_token,
        parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
        parsed.scope,
        None,
        clock.now() + DurationSecs(expires_in),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn mint_workload_identity(
    token_url: &str,
    audience: Option<&str>,
    subject_token_type: &str,
    sa_impersonation_url: Option<&str>,
    subject_token_source: &crate::source::SubjectTokenSource,
    options: &Options,
    http: &dyn HttpGateway,
    clock: &(dyn Clock + Send + Sync),
) -> Result<Token, Error> {
    let subject_token = subject_token_source.subject_token(http).await?;
    let scope = jwt::join_scopes(options.scopes.as_deref());

    let mut pairs = vec![
        ("grant_type", TOKEN_EXCHANGE_GRANT_TYPE),
        ("requested_token_type", ACCESS_TOKEN_TYPE),
        ("subject_token_type", subject_token_type),
        ("subject_token", &subject_token),
        ("scope", &scope),
    ];
    if let Some(audience) = audience {
        pairs.push(("audience", audience));
    }

    let url = options.url.as_deref().unwrap_or(token_url);
    let response = expect_ok(post_form(http, url, form(&pairs)).await?)?;

    let parsed: dto::TokenResponse = response.json()?;
    let federation_token = parsed
        .access_token
        .ok_or_else(|| Error::decode("exchange response is missing access_token"))?;

    let Some(impersonation_url) = sa_impersonation_url else {
        let expires_in = parsed
            .expires_in
            .ok_or_else(|| Error::decode("exchange response is missing expires_in"))?;
        return Ok(Token::new(
            federation_token,
            parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            parsed.scope.or(Some(scope)),
            None,
            clock.now() + DurationSecs(expires_in),
        ));
    };

    let scopes = match options.scopes.as_deref() {
        Some(scopes) if !scopes.is_empty() => scopes.to_vec(),
        _ => vec![jwt::DEFAULT_SCOPE.to_string()],
    };
    let body = serde_json::to_vec(&json!({ "scope": scopes })).map_err(Error::decode)?;
    let request = Request::post(impersonation_url, body)
        .with_header(
            "Authorization",
            format!("Bearer {}", federation_token.as_str()),
        )
        .with_header("Content-Type", "application/json");
    let response = expect_ok(http.call(request).await?)?;

    let parsed: dto::ImpersonatedTokenResponse = response.json()?;
    let expires = parse_rfc3339(&parsed.expire_time)?;
    Ok(Token::new(parsed.access_token, "Bearer", Some(scope), None, expires))
}

fn token_from_identity_jws(jws: &str) -> Result<Token, Error> {
    let payload = jwt::decode_payload(jws)?;
    let expires = payload
        .get("exp")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::decode("identity token payload is missing exp"))?;
    let scope = payload.get("aud").and_then(Value::as_str).map(str::to_string);
    let sub = payload.get("sub").and_then(Value::as_str).map(str::to_string);
    Ok(Token::new(
        AccessToken::new(jws.to_string()),
        "Bearer",
        scope,
        sub,
        UnixTime(expires),
    ))
}

fn parse_rfc3339(raw: &str) -> Result<UnixTime, Error> {
    let parsed = chrono::DateTime::parse_from_rfc3339(raw)
        .map_err(|err| Error::decode(format!("invalid expireTime {raw:?}: {err}")))?;
    u64::try_from(parsed.timestamp())
        .map(UnixTime)
        .map_err(|_| Error::decode(format!("expireTime {raw:?} predates the epoch")))
}

fn claim_string(claims: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    claims.get(key).and_then(Value::as_str).map(str::to_string)
}

fn form(pairs: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

async fn post_form(
    http: &dyn HttpGateway,
    url: &str,
    body: String,
) -> Result<Response, Error> {
    http.call(
        Request::post(url, body.into_bytes()).with_header("Content-Type", FORM_CONTENT_TYPE),
    )
    .await
}

async fn metadata_get(http: &dyn HttpGateway, url: String) -> Result<Response, Error> {
    http.call(Request::get(url).with_header("Metadata-Flavor", "Google"))
        .await
}

fn expect_ok(response: Response) -> Result<Response, Error> {
    tracing::debug!(response.status = response.status, "received response from authority");
    if response.status == 200 {
        Ok(response)
    } else {
        Err(Error::UnexpectedStatus {
            status: response.status,
            body: response.text(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    fn identity_jws(payload: &str) -> String {
        format!("eyJhbGciOiJSUzI1NiJ9.{}.c2ln", URL_SAFE_NO_PAD.encode(payload))
    }

    #[test]
    fn identity_jws_becomes_a_bearer_token() {
        let jws = identity_jws(r#"{"exp": 1234, "aud": "https://svc", "sub": "robot@x"}"#);
        let token = token_from_identity_jws(&jws).unwrap();
        assert_eq!(token.access_token().as_str(), jws);
        assert_eq!(token.token_type(), "Bearer");
        assert_eq!(token.expires(), UnixTime(1234));
        assert_eq!(token.scope(), Some("https://svc"));
        assert_eq!(token.sub(), Some("robot@x"));
    }

    #[test]
    fn identity_jws_without_exp_is_a_decode_error() {
        let jws = identity_jws(r#"{"aud": "https://svc"}"#);
        assert!(matches!(
            token_from_identity_jws(&jws),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn non_200_status_surfaces_status_and_body() {
        let response = Response {
            status: 503,
            headers: Vec::new(),
            body: b"upstream sad".to_vec(),
        };
        match expect_ok(response) {
            Err(Error::UnexpectedStatus { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "upstream sad");
            }
            other => panic!("expected UnexpectedStatus, got {other:?}"),
        }
    }

    #[test]
    fn form_encoding_escapes_reserved_characters() {
        let body = form(&[("grant_type", JWT_BEARER_GRANT_TYPE), ("assertion", "a.b.c")]);
        assert_eq!(
            body,
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer&assertion=a.b.c"
        );
    }

    #[test]
    fn rfc3339_expiry_parses_to_unix_seconds() {
        assert_eq!(
            parse_rfc3339("1970-01-01T01:00:00Z").unwrap(),
            UnixTime(3600)
        );
        assert!(parse_rfc3339("not-a-time").is_err());
    }
}
