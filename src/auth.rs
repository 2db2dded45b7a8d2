use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::HeaderValue;
use subtle::ConstantTimeEq;

/// Error type for proxy authentication
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Proxy-Authorization is required, expected format: <type> <credentials>")]
    Missing,

    #[error("auth type is not supported")]
    UnsupportedScheme,

    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Error type for credential configuration
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("empty usernames are not allowed")]
    EmptyUser,

    #[error("character ':' in usernames is not allowed")]
    ColonInUser,
}

/// Username of an authenticated proxy client, attached to the request
/// extensions once credentials check out.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

/// Store of acceptable `Proxy-Authorization: Basic` credentials.
///
/// Entries are kept as the base64 token bytes the client is expected to
/// send, so the per-request check is a straight byte compare.
#[derive(Debug, Clone, Default)]
pub struct BasicCredentials {
    entries: Vec<Vec<u8>>,
}

impl BasicCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a `user`/`pass` pair. The username must be non-empty and must
    /// not contain `:` (it would corrupt the encoded form).
    pub fn add(&mut self, user: &str, pass: &str) -> Result<(), CredentialError> {
        if user.is_empty() {
            return Err(CredentialError::EmptyUser);
        }
        if user.contains(':') {
            return Err(CredentialError::ColonInUser);
        }
        let token = STANDARD.encode(format!("{user}:{pass}"));
        self.entries.push(token.into_bytes());
        Ok(())
    }

    /// Validate a `Proxy-Authorization` header value.
    ///
    /// The scheme must be `basic` (case-insensitive). The token is compared
    /// against every stored entry in constant time; the first match wins and
    /// yields the decoded username. The compare operates on base64 tokens,
    /// so the length class of credentials remains observable.
    pub fn check(&self, header: Option<&HeaderValue>) -> Result<String, AuthError> {
        let header = header.ok_or(AuthError::Missing)?;
        let value = header.to_str().map_err(|_| AuthError::Missing)?;
        let (scheme, token) = value.split_once(' ').ok_or(AuthError::Missing)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::UnsupportedScheme);
        }
        let token = token.trim();
        for entry in &self.entries {
            if constant_time_eq(entry, token.as_bytes()) {
                return decode_user(entry).ok_or(AuthError::InvalidCredentials);
            }
        }
        Err(AuthError::InvalidCredentials)
    }
}

/// Constant-time byte compare with an equal-length gate.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Decode a known-good base64 `user:pass` entry and extract the username.
fn decode_user(entry: &[u8]) -> Option<String> {
    let decoded = STANDARD.decode(entry).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, _) = decoded.split_once(':')?;
    Some(user.to_string())
}
