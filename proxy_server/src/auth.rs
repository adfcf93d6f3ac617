use std::str::FromStr;

use base64::{Engine, prelude::BASE64_STANDARD};
use http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization header missing")]
    Missing,

    #[error("authorization header malformed")]
    Malformed,

    #[error("credentials do not match")]
    Mismatch,

    #[error("no admin token configured")]
    NotConfigured,
}

/// The `username:password` pair data endpoints require
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    username: String,
    password: Secret<String>,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }

    /// Check a `Basic` authorization header
    pub(crate) fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let header = headers.get(AUTHORIZATION).ok_or(AuthError::Missing)?;
        let token = scheme_token(header, &["Basic"])?;
        let decoded = BASE64_STANDARD
            .decode(token)
            .map_err(|_| AuthError::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
        let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;

        if username == self.username && password == self.password.expose_secret() {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }
}

impl FromStr for BasicCredentials {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((username, password)) if !username.is_empty() => {
                Ok(Self::new(username, password))
            }
            _ => Err(format!("expected `username:password`, got '{s}'")),
        }
    }
}

/// The static token of the administrative endpoints
#[derive(Debug, Clone)]
pub(crate) struct AdminToken(Option<Secret<String>>);

impl AdminToken {
    pub(crate) fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()).map(Secret::new))
    }

    /// Check a `Token` or `Bearer` authorization header
    pub(crate) fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let expected = self.0.as_ref().ok_or(AuthError::NotConfigured)?;
        let header = headers.get(AUTHORIZATION).ok_or(AuthError::Missing)?;
        let token = scheme_token(header, &["Token", "Bearer"])?;
        if token == expected.expose_secret() {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }
}

fn scheme_token<'a>(header: &'a HeaderValue, schemes: &[&str]) -> Result<&'a str, AuthError> {
    let mut parts = header
        .to_str()
        .map_err(|_| AuthError::Malformed)?
        .split(' ');
    let scheme = parts.next().ok_or(AuthError::Malformed)?;
    if !schemes.contains(&scheme) {
        return Err(AuthError::Malformed);
    }
    let token = parts.next().ok_or(AuthError::Malformed)?;
    if parts.next().is_some() {
        return Err(AuthError::Malformed);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_header(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn basic_credentials() {
        let credentials: BasicCredentials = "admin:s3cr:et".parse().unwrap();
        let encoded = BASE64_STANDARD.encode("admin:s3cr:et");

        assert_eq!(credentials.verify(&auth_header(&format!("Basic {encoded}"))), Ok(()));
        assert_eq!(
            credentials.verify(&auth_header(&format!("Basic {}", BASE64_STANDARD.encode("admin:x")))),
            Err(AuthError::Mismatch)
        );
        assert_eq!(credentials.verify(&HeaderMap::new()), Err(AuthError::Missing));
        assert_eq!(
            credentials.verify(&auth_header("Basic not-base64!")),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            credentials.verify(&auth_header(&format!("Token {encoded}"))),
            Err(AuthError::Malformed)
        );

        assert!(":password".parse::<BasicCredentials>().is_err());
        assert!("nocolon".parse::<BasicCredentials>().is_err());
    }

    #[test]
    fn admin_token() {
        let token = AdminToken::new(Some("t0ken".to_string()));
        assert_eq!(token.verify(&auth_header("Token t0ken")), Ok(()));
        assert_eq!(token.verify(&auth_header("Bearer t0ken")), Ok(()));
        assert_eq!(token.verify(&auth_header("Token other")), Err(AuthError::Mismatch));
        assert_eq!(token.verify(&auth_header("Token t0ken extra")), Err(AuthError::Malformed));

        let disabled = AdminToken::new(Some(String::new()));
        assert_eq!(disabled.verify(&auth_header("Token ")), Err(AuthError::NotConfigured));
    }
}
