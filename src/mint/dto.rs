//! Wire DTOs for the token and impersonation endpoints

use serde::Deserialize;

use crate::{AccessToken, IdToken};

/// The standard OAuth2 token response
///
/// All fields are optional at the serde layer: the same shape covers the
/// access-token form, the `{"id_token": …}` identity form, and the STS
/// exchange response. The per-flow code decides which fields are required.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub id_token: Option<IdToken>,
}

/// The response of the IAM `generateAccessToken` impersonation endpoint
///
/// Unlike the token endpoint, this one speaks camelCase and reports the
/// expiry as an absolute RFC3339 timestamp.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImpersonatedTokenResponse {
    pub access_token: AccessToken,
    pub expire_time: String,
}
