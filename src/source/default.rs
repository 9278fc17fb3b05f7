//! Ambient credential discovery
//!
//! A one-shot probe of the process environment, run when a server is
//! started with no explicit source. The probe order mirrors application
//! default credentials: inline JSON, then a key file path, then the
//! instance metadata service.

use std::env;

use super::{Credentials, Source};
use crate::error::Error;

/// Environment variable holding inline credential JSON
pub const CREDENTIALS_JSON_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS_JSON";

/// Environment variable pointing at a credential JSON file
pub const CREDENTIALS_PATH_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const PROJECT_VARS: [&str; 3] = [
    "GOOGLE_CLOUD_PROJECT",
    "GCLOUD_PROJECT",
    "DEVSHELL_PROJECT_ID",
];

/// Picks a credential source for the current environment
///
/// Checks, in order: inline JSON in `GOOGLE_APPLICATION_CREDENTIALS_JSON`,
/// a key file named by `GOOGLE_APPLICATION_CREDENTIALS`, and finally the
/// instance metadata service. Only a malformed explicit credential is an
/// error; an empty environment falls through to metadata.
pub fn discover() -> Result<Source, Error> {
    if let Ok(json) = env::var(CREDENTIALS_JSON_VAR) {
        tracing::debug!(var = CREDENTIALS_JSON_VAR, "using inline credential JSON");
        return Credentials::from_json(&json).map(Source::new);
    }

    if let Ok(path) = env::var(CREDENTIALS_PATH_VAR) {
        tracing::debug!(var = CREDENTIALS_PATH_VAR, path = %path, "using credential file");
        let json = std::fs::read_to_string(&path).map_err(|err| {
            Error::config(format!("unable to read credential file {path:?}: {err}"))
        })?;
        return Credentials::from_json(&json).map(Source::new);
    }

    tracing::debug!("no explicit credentials in the environment, using instance metadata");
    Ok(Source::new(Credentials::metadata()))
}

/// A best-effort project ID hint from the environment
///
/// Consults `GOOGLE_CLOUD_PROJECT`, `GCLOUD_PROJECT` and
/// `DEVSHELL_PROJECT_ID` in that order.
pub fn project_id() -> Option<String> {
    PROJECT_VARS
        .iter()
        .find_map(|var| env::var(var).ok().filter(|v| !v.is_empty()))
}
