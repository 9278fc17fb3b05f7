use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// The name a token server is registered under
#[braid(serde)]
pub struct ServerName;

/// An OAuth2 client ID
#[braid(serde)]
pub struct ClientId;

/// An OAuth2 client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

limited_reveal!(ClientSecretRef: "CLIENT SECRET", 5);

/// A bearer access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A signed identity token in compact JWS form
#[braid(serde)]
pub struct IdToken;

/// A long-lived refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// A PEM-armored RSA private key for a service account
#[braid(serde, debug = "owned", display = "owned")]
pub struct PrivateKeyPem;

limited_reveal!(PrivateKeyPemRef: "PRIVATE KEY", 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_redacted_by_default() {
        let secret = ClientSecret::from_static("super-secret-value");
        assert_eq!(format!("{:?}", secret), "***CLIENT SECRET***");
        assert_eq!(format!("{}", secret), "***CLIENT SECRET***");
    }

    #[test]
    fn alternate_debug_reveals_a_prefix() {
        let token = AccessToken::from_static("ya29.a0AfH6SMBx4");
        let shown = format!("{:#?}", token);
        assert!(shown.starts_with('"'));
        assert!(shown.contains('…'));
    }

    #[test]
    fn server_names_compare_by_value() {
        let a = ServerName::from_static("gcs");
        let b = ServerName::new("gcs".to_string());
        assert_eq!(a, b);
    }
}
