// RFC 2617 Digest access authentication
//
// Parses `WWW-Authenticate: Digest ...` challenges and computes the
// matching `Authorization` header. MD5 is the RFC default; SHA-256
// (RFC 7616) is selected when the challenge names it, which is what
// Gen2 firmware sends.

use md5::Md5;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};

use crate::auth::Credentials;
use crate::error::Error;

/// Hash function named by the challenge's `algorithm` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn parse(raw: &str) -> Result<Self, Error> {
        match raw.to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA-256" => Ok(Self::Sha256),
            other => Err(Error::InvalidChallenge(format!(
                "unsupported algorithm '{other}'"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    fn hash_hex(self, input: &str) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// A parsed `WWW-Authenticate: Digest` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// `Some("auth")` when the server offers qop=auth; `None` selects the
    /// RFC 2069 compatibility response.
    pub qop: Option<String>,
    pub algorithm: DigestAlgorithm,
    /// Set when the server rejected a request only because its nonce aged out.
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Result<Self, Error> {
        let trimmed = header.trim();
        let rest = match trimmed.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => {
                return Err(Error::InvalidChallenge(format!(
                    "not a Digest challenge: {trimmed}"
                )));
            }
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut stale = false;

        for (key, value) in split_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    // Offered list, e.g. "auth,auth-int". Only `auth` is supported.
                    if value.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                        qop = Some("auth".to_owned());
                    }
                }
                "algorithm" => algorithm = DigestAlgorithm::parse(&value)?,
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| Error::InvalidChallenge("missing realm".into()))?,
            nonce: nonce.ok_or_else(|| Error::InvalidChallenge("missing nonce".into()))?,
            opaque,
            qop,
            algorithm,
            stale,
        })
    }

    /// Compute the `response` value for one request.
    pub fn response(
        &self,
        credentials: &Credentials,
        method: &str,
        uri: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let alg = self.algorithm;
        let ha1 = alg.hash_hex(&format!(
            "{}:{}:{}",
            credentials.username,
            self.realm,
            credentials.password.expose_secret()
        ));
        let ha2 = alg.hash_hex(&format!("{method}:{uri}"));
        match self.qop.as_deref() {
            Some(qop) => alg.hash_hex(&format!(
                "{ha1}:{}:{nc:08x}:{cnonce}:{qop}:{ha2}",
                self.nonce
            )),
            None => alg.hash_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        }
    }

    /// Build the full `Authorization` header value for one request.
    pub fn authorization(
        &self,
        credentials: &Credentials,
        method: &str,
        uri: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let response = self.response(credentials, method, uri, nc, cnonce);
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", algorithm={}, response=\"{response}\"",
            credentials.username,
            self.realm,
            self.nonce,
            self.algorithm.as_str(),
        );
        if let Some(qop) = &self.qop {
            header.push_str(&format!(", qop={qop}, nc={nc:08x}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header
    }
}

/// Fresh client nonce: 16 hex chars from a v4 UUID.
pub fn new_cnonce() -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(16);
    s
}

/// Split `k=v, k="v, with comma"` pairs, honoring quoted strings.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .filter_map(|part| {
            let (k, v) = part.split_once('=')?;
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v);
            Some((k.trim().to_owned(), v.to_owned()))
        })
        .collect()
}
