use axum::http::{HeaderMap, Uri};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;


/// The federation secret a peer presents as `Authorization: Bearer <secret>`
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

#[derive(Debug, Deserialize)]
struct SecretQuery {
    #[serde(default)]
    secret: Option<String>,
}

/// The federation secret passed as a percent-encoded `?secret=` parameter.
///
/// Browser-style clients cannot set headers on a WebSocket upgrade.
pub fn extract_query_secret(uri: &Uri) -> Result<String, TokenError> {
    let query = uri.query().ok_or(TokenError::Missing)?;
    let parsed: SecretQuery =
        serde_urlencoded::from_str(query).map_err(|_| TokenError::InvalidFormat)?;
    let secret = parsed.secret.ok_or(TokenError::Missing)?;

    if secret.is_empty() {
        return Err(TokenError::Empty);
    }
    Ok(secret)
}

/// Split `<scheme> <secret>`; only the bearer scheme carries a secret
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let (scheme, secret) = header_value
        .split_once(' ')
        .ok_or(TokenError::InvalidFormat)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let secret = secret.trim();
    if secret.is_empty() {
        return Err(TokenError::Empty);
    }
    Ok(secret.to_string())
}

/// Why no federation secret could be read from a handshake
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Neither the header nor the query parameter is there
    Missing,
    /// Header is not `Bearer <secret>`, or the query string does not parse
    InvalidFormat,
    /// Present but blank
    Empty,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Federation secret not provided"),
            TokenError::InvalidFormat => write!(f, "Malformed federation credentials"),
            TokenError::Empty => write!(f, "Federation secret is empty"),
        }
    }
}

impl std::error::Error for TokenError {}

/// What a federation verifier gets to look at
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Presented secret, if any could be extracted
    pub secret: Option<String>,
    pub headers: HeaderMap,
    pub uri: Uri,
}

impl Handshake {
    pub fn from_parts(headers: &HeaderMap, uri: &Uri) -> Self {
        let secret = extract_bearer_token(headers)
            .or_else(|_| extract_query_secret(uri))
            .ok();
        Self {
            secret,
            headers: headers.clone(),
            uri: uri.clone(),
        }
    }
}

/// Decides whether an incoming federation handshake is accepted
#[derive(Clone)]
pub enum SecretVerifier {
    /// Presented secret must equal this one
    Static(String),
    /// Arbitrary predicate over the handshake request
    Custom(Arc<dyn Fn(&Handshake) -> bool + Send + Sync>),
}

impl SecretVerifier {
    pub fn secret(secret: impl Into<String>) -> Self {
        SecretVerifier::Static(secret.into())
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Handshake) -> bool + Send + Sync + 'static,
    {
        SecretVerifier::Custom(Arc::new(predicate))
    }

    pub fn verify(&self, handshake: &Handshake) -> bool {
        match self {
            SecretVerifier::Static(expected) => handshake
                .secret
                .as_deref()
                .map_or(false, |presented| presented == expected),
            SecretVerifier::Custom(predicate) => predicate(handshake),
        }
    }
}

impl fmt::Debug for SecretVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretVerifier::Static(_) => write!(f, "SecretVerifier::Static(..)"),
            SecretVerifier::Custom(_) => write!(f, "SecretVerifier::Custom(..)"),
        }
    }
}
