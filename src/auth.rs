//! HTTP authentication for the upgrade request.
//!
//! A 401 answer carries a `WWW-Authenticate` challenge. Its scheme token selects an
//! [`Authenticator`] from the [`AuthConfig`], and that authenticator computes the
//! `Authorization` header sent with the next request.

use crate::{AuthError, Error};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::{Digest, Md5};
use std::{collections::BTreeMap, fmt, sync::Arc};
use url::Url;

pub const BASIC: &str = "Basic";
pub const DIGEST: &str = "Digest";

/// Computes an `Authorization` header value from a server challenge.
pub trait Authenticator: fmt::Debug + Send + Sync {
    fn generate_authorization_header(
        &self,
        uri: &Url,
        challenge: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, Error>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Vec<u8>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Scheme name to authenticator. Lookups ignore case.
#[derive(Clone)]
pub struct AuthConfig {
    // keyed by lowercased scheme
    authenticators: BTreeMap<String, (String, Arc<dyn Authenticator>)>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::builder().build()
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.authenticators.values().map(|(scheme, _)| scheme))
            .finish()
    }
}

impl AuthConfig {
    pub fn builder() -> AuthConfigBuilder {
        let mut builder = AuthConfigBuilder {
            authenticators: BTreeMap::new(),
        };
        builder.insert(BASIC, Arc::new(BasicAuthenticator));
        builder.insert(DIGEST, Arc::new(DigestAuthenticator));
        builder
    }

    /// Configuration with no authenticators at all.
    pub fn empty() -> Self {
        AuthConfig {
            authenticators: BTreeMap::new(),
        }
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Authenticator>> {
        self.authenticators
            .get(&scheme.to_ascii_lowercase())
            .map(|(_, authenticator)| Arc::clone(authenticator))
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.authenticators.values().map(|(scheme, _)| scheme.as_str())
    }
}

pub struct AuthConfigBuilder {
    authenticators: BTreeMap<String, (String, Arc<dyn Authenticator>)>,
}

impl AuthConfigBuilder {
    fn insert(&mut self, scheme: &str, authenticator: Arc<dyn Authenticator>) {
        self.authenticators
            .insert(scheme.to_ascii_lowercase(), (scheme.into(), authenticator));
    }

    /// Adds or replaces the authenticator for `scheme`.
    #[must_use]
    pub fn register(mut self, scheme: &str, authenticator: Arc<dyn Authenticator>) -> Self {
        self.insert(scheme, authenticator);
        self
    }

    #[must_use]
    pub fn disable_basic(mut self) -> Self {
        self.authenticators.remove(&BASIC.to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn disable_digest(mut self) -> Self {
        self.authenticators.remove(&DIGEST.to_ascii_lowercase());
        self
    }

    pub fn build(self) -> AuthConfig {
        AuthConfig {
            authenticators: self.authenticators,
        }
    }
}

/// Splits the scheme token off a `WWW-Authenticate` value.
pub fn challenge_scheme(challenge: &str) -> Option<&str> {
    challenge
        .split_whitespace()
        .next()
        .map(|scheme| scheme.trim_end_matches(','))
        .filter(|scheme| !scheme.is_empty())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAuthenticator;

impl Authenticator for BasicAuthenticator {
    fn generate_authorization_header(
        &self,
        _uri: &Url,
        _challenge: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, Error> {
        let credentials = credentials.ok_or(AuthError::MissingCredentials)?;

        let mut token = latin1(&credentials.username)?;
        token.push(b':');
        token.extend_from_slice(&credentials.password);
        Ok(format!("{} {}", BASIC, BASE64.encode(token)))
    }
}

// Basic credentials are ISO-8859-1 on the wire
fn latin1(text: &str) -> Result<Vec<u8>, Error> {
    text.chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| {
                Error::from(AuthError::Failed(format!(
                    "{:?} is not representable in ISO-8859-1",
                    c
                )))
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DigestAuthenticator;

impl Authenticator for DigestAuthenticator {
    fn generate_authorization_header(
        &self,
        uri: &Url,
        challenge: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, Error> {
        let credentials = credentials.ok_or(AuthError::MissingCredentials)?;
        let challenge = DigestChallenge::parse(challenge)?;

        let mut cnonce = [0u8; 8];
        getrandom::getrandom(&mut cnonce)?;
        let cnonce = hex(&cnonce);

        let digest_uri = match uri.query() {
            Some(query) => format!("{}?{}", uri.path(), query),
            None => uri.path().into(),
        };

        challenge.authorization(credentials, &digest_uri, &cnonce)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: Option<String>,
    qop_auth: bool,
}

impl DigestChallenge {
    fn parse(challenge: &str) -> Result<Self, Error> {
        let trimmed = challenge.trim_start();
        let (scheme, params) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        if !scheme.eq_ignore_ascii_case(DIGEST) {
            return Err(AuthError::InvalidChallenge(challenge.into()).into());
        }

        let mut parsed = DigestChallenge::default();
        let mut nonce = None;
        for (name, value) in split_params(params) {
            match name.to_ascii_lowercase().as_str() {
                "realm" => parsed.realm = value,
                "nonce" => nonce = Some(value),
                "opaque" => parsed.opaque = Some(value),
                "algorithm" => parsed.algorithm = Some(value),
                "qop" => {
                    parsed.qop_auth = value
                        .split(',')
                        .any(|qop| qop.trim().eq_ignore_ascii_case("auth"))
                }
                _ => {}
            }
        }

        parsed.nonce = nonce.ok_or_else(|| AuthError::InvalidChallenge(challenge.into()))?;
        match parsed.algorithm.as_deref() {
            None => {}
            Some(algorithm)
                if algorithm.eq_ignore_ascii_case("MD5")
                    || algorithm.eq_ignore_ascii_case("MD5-sess") => {}
            Some(algorithm) => {
                return Err(AuthError::Failed(format!(
                    "unsupported digest algorithm {}",
                    algorithm
                ))
                .into())
            }
        }
        Ok(parsed)
    }

    fn authorization(
        &self,
        credentials: &Credentials,
        uri: &str,
        cnonce: &str,
    ) -> Result<String, Error> {
        const NONCE_COUNT: &str = "00000001";

        let mut ha1 = md5_hex(&[
            credentials.username.as_bytes(),
            b":",
            self.realm.as_bytes(),
            b":",
            &credentials.password,
        ]);
        let session = self
            .algorithm
            .as_deref()
            .is_some_and(|algorithm| algorithm.eq_ignore_ascii_case("MD5-sess"));
        if session {
            ha1 = md5_hex(&[
                ha1.as_bytes(),
                b":",
                self.nonce.as_bytes(),
                b":",
                cnonce.as_bytes(),
            ]);
        }
        let ha2 = md5_hex(&[b"GET:", uri.as_bytes()]);

        let response = if self.qop_auth {
            md5_hex(&[
                ha1.as_bytes(),
                b":",
                self.nonce.as_bytes(),
                b":",
                NONCE_COUNT.as_bytes(),
                b":",
                cnonce.as_bytes(),
                b":auth:",
                ha2.as_bytes(),
            ])
        } else {
            md5_hex(&[ha1.as_bytes(), b":", self.nonce.as_bytes(), b":", ha2.as_bytes()])
        };

        let mut header = format!(
            "{} username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            DIGEST, credentials.username, self.realm, self.nonce, uri, response
        );
        if let Some(algorithm) = &self.algorithm {
            header.push_str(&format!(", algorithm={}", algorithm));
        }
        if self.qop_auth {
            header.push_str(&format!(
                ", qop=auth, nc={}, cnonce=\"{}\"",
                NONCE_COUNT, cnonce
            ));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        Ok(header)
    }
}

/// `name=value` pairs separated by commas. Values may be quoted, and quoted values may contain
/// commas.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = params.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let name: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if name.trim().is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        pairs.push((name.trim().to_string(), value.trim().to_string()));
    }

    pairs
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://localhost/dir/index.html").unwrap()
    }

    #[test]
    fn basic_header() {
        let header = BasicAuthenticator
            .generate_authorization_header(
                &url(),
                "Basic realm=\"x\"",
                Some(&Credentials::new("Aladdin", "open sesame")),
            )
            .unwrap();
        assert_eq!(header, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn basic_uses_latin1_usernames() {
        let header = BasicAuthenticator
            .generate_authorization_header(&url(), "Basic", Some(&Credentials::new("é", "")))
            .unwrap();
        assert_eq!(header, format!("Basic {}", BASE64.encode([0xe9, b':'])));
    }

    #[test]
    fn missing_credentials_fail() {
        let err = BasicAuthenticator
            .generate_authorization_header(&url(), "Basic", None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn digest_response_matches_rfc_2617() {
        let challenge = DigestChallenge::parse(
            "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        )
        .unwrap();
        let header = challenge
            .authorization(
                &Credentials::new("Mufasa", "Circle Of Life"),
                "/dir/index.html",
                "0a4f113b",
            )
            .unwrap();

        assert!(header.starts_with("Digest username=\"Mufasa\""));
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("qop=auth, nc=00000001, cnonce=\"0a4f113b\""));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn digest_without_nonce_is_invalid() {
        let err = DigestChallenge::parse("Digest realm=\"r\"").unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(AuthError::InvalidChallenge(_))
        ));
    }

    #[test]
    fn quoted_params_may_contain_commas() {
        assert_eq!(
            split_params(" realm=\"a, b\", stale=false"),
            vec![
                ("realm".to_string(), "a, b".to_string()),
                ("stale".to_string(), "false".to_string())
            ]
        );
    }

    #[test]
    fn registry_is_case_insensitive() {
        let config = AuthConfig::default();
        assert!(config.get("basic").is_some());
        assert!(config.get("DIGEST").is_some());
        assert!(config.get("Bearer").is_none());

        let config = AuthConfig::builder()
            .disable_basic()
            .register("bearer", Arc::new(BasicAuthenticator))
            .build();
        assert!(config.get("Basic").is_none());
        assert!(config.get("Bearer").is_some());
        assert_eq!(config.schemes().collect::<Vec<_>>(), vec!["bearer", "Digest"]);
    }

    #[test]
    fn scheme_is_the_first_token() {
        assert_eq!(challenge_scheme("Basic realm=\"x\""), Some("Basic"));
        assert_eq!(challenge_scheme("  NTLM"), Some("NTLM"));
        assert_eq!(challenge_scheme("   "), None);
    }
}
