//! Authentication primitives: HTTP Basic, RFC 2617 Digest, and the digest
//! object RPC devices accept inside request envelopes.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use md5::{Digest as _, Md5};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{TransportError, TransportResult};

/// Nonce count used for the single request that follows a challenge.
pub const DIGEST_NONCE_COUNT: &str = "00000001";

/// Username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
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

/// How HTTP requests are authenticated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthScheme {
    /// No authentication
    #[default]
    None,
    /// Credentials sent on every request.
    Basic(Credentials),
    /// Challenge/response handshake per RFC 2617.
    Digest(Credentials),
}

impl AuthScheme {
    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Self::None => None,
            Self::Basic(creds) | Self::Digest(creds) => Some(creds),
        }
    }
}

/// Value for an `Authorization: Basic ...` header.
pub fn basic_authorization(credentials: &Credentials) -> String {
    let token = STANDARD.encode(format!(
        "{}:{}",
        credentials.username, credentials.password
    ));
    format!("Basic {token}")
}

/// Hash function negotiated by a digest challenge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Parse the `algorithm` challenge parameter. Unknown names are rejected.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "SHA-256" | "SHA256" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    /// Lowercase hex digest of `data`.
    pub fn hash_hex(&self, data: &str) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(data.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(data.as_bytes())),
        }
    }
}

/// Inputs of a digest response computation.
#[derive(Clone, Copy, Debug)]
pub struct DigestParams<'a> {
    pub algorithm: DigestAlgorithm,
    pub username: &'a str,
    pub password: &'a str,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
    pub qop: Option<&'a str>,
    pub method: &'a str,
    pub uri: &'a str,
}

/// Compute the digest `response` value.
///
/// `HA1 = H(user:realm:pass)`, `HA2 = H(method:uri)`, then
/// `H(HA1:nonce:nc:cnonce:qop:HA2)` when a qop is present, else
/// `H(HA1:nonce:HA2)`.
pub fn calculate_digest_response(params: &DigestParams<'_>) -> String {
    let alg = params.algorithm;
    let ha1 = alg.hash_hex(&format!(
        "{}:{}:{}",
        params.username, params.realm, params.password
    ));
    let ha2 = alg.hash_hex(&format!("{}:{}", params.method, params.uri));

    match params.qop {
        Some(qop) => alg.hash_hex(&format!(
            "{ha1}:{}:{}:{}:{qop}:{ha2}",
            params.nonce, params.nc, params.cnonce
        )),
        None => alg.hash_hex(&format!("{ha1}:{}:{ha2}", params.nonce)),
    }
}

/// Random client nonce, hex encoded.
pub fn generate_cnonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub algorithm: DigestAlgorithm,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse a challenge header value.
    pub fn parse(header: &str) -> TransportResult<Self> {
        let header = header.trim();
        let rest = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => {
                return Err(TransportError::auth(format!(
                    "not a digest challenge: {header}"
                )));
            }
        };

        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut opaque = None;

        for (key, value) in split_challenge_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => qop = select_qop(&value),
                "opaque" => opaque = Some(value),
                "algorithm" => {
                    algorithm = DigestAlgorithm::parse(&value).ok_or_else(|| {
                        TransportError::auth(format!("unsupported digest algorithm: {value}"))
                    })?;
                }
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| TransportError::auth("digest challenge without realm"))?,
            nonce: nonce.ok_or_else(|| TransportError::auth("digest challenge without nonce"))?,
            qop,
            algorithm,
            opaque,
        })
    }

    /// Build the `Authorization` header value for `method uri` with an
    /// explicit client nonce.
    pub fn authorization_with_cnonce(
        &self,
        credentials: &Credentials,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let response = calculate_digest_response(&DigestParams {
            algorithm: self.algorithm,
            username: &credentials.username,
            password: &credentials.password,
            realm: &self.realm,
            nonce: &self.nonce,
            nc: DIGEST_NONCE_COUNT,
            cnonce,
            qop: self.qop.as_deref(),
            method,
            uri,
        });

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            credentials.username,
            self.realm,
            self.nonce,
            uri,
            response,
            self.algorithm.as_str()
        );
        if let Some(qop) = &self.qop {
            header.push_str(&format!(
                r#", qop={qop}, nc={DIGEST_NONCE_COUNT}, cnonce="{cnonce}""#
            ));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{opaque}""#));
        }
        header
    }

    /// Build the `Authorization` header value with a fresh client nonce.
    pub fn authorization(&self, credentials: &Credentials, method: &str, uri: &str) -> String {
        self.authorization_with_cnonce(credentials, method, uri, &generate_cnonce())
    }
}

/// Prefer plain `auth` when the server offers several qop values.
fn select_qop(value: &str) -> Option<String> {
    let options: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    if options.iter().any(|v| v.eq_ignore_ascii_case("auth")) {
        Some("auth".to_string())
    } else {
        options.first().map(|v| v.to_string())
    }
}

/// Split `k1="v,1", k2=v2` into pairs, honouring quoted commas.
fn split_challenge_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let flush = |segment: &str, pairs: &mut Vec<(String, String)>| {
        if let Some((key, value)) = segment.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                pairs.push((key.to_string(), value.trim().trim_matches('"').to_string()));
            }
        }
    };

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                flush(&current, &mut pairs);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    flush(&current, &mut pairs);
    pairs
}

/// Challenge carried in the message of an RPC `401` error.
///
/// RPC devices reject unauthenticated envelopes with
/// `{"code":401,"message":"{\"auth_type\":\"digest\",\"nonce\":...}"}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RpcAuthChallenge {
    pub auth_type: String,
    pub nonce: u64,
    #[serde(default = "default_nc")]
    pub nc: u32,
    pub realm: String,
    pub algorithm: String,
}

fn default_nc() -> u32 {
    1
}

impl RpcAuthChallenge {
    pub fn parse(message: &str) -> TransportResult<Self> {
        let challenge: Self = serde_json::from_str(message)?;
        if !challenge.auth_type.eq_ignore_ascii_case("digest") {
            return Err(TransportError::auth(format!(
                "unsupported auth type: {}",
                challenge.auth_type
            )));
        }
        Ok(challenge)
    }
}

/// Digest object sent in the `auth` field of an RPC envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcAuth {
    pub realm: String,
    pub username: String,
    pub nonce: u64,
    pub cnonce: u64,
    pub response: String,
    pub algorithm: String,
}

impl RpcAuth {
    /// Answer `challenge` with a fresh client nonce.
    pub fn from_challenge(
        challenge: &RpcAuthChallenge,
        credentials: &Credentials,
    ) -> TransportResult<Self> {
        let cnonce: u64 = rand::rng().random_range(1..u64::from(u32::MAX));
        Self::with_cnonce(challenge, credentials, cnonce)
    }

    /// Answer `challenge` with an explicit client nonce.
    pub fn with_cnonce(
        challenge: &RpcAuthChallenge,
        credentials: &Credentials,
        cnonce: u64,
    ) -> TransportResult<Self> {
        let algorithm = DigestAlgorithm::parse(&challenge.algorithm).ok_or_else(|| {
            TransportError::auth(format!(
                "unsupported digest algorithm: {}",
                challenge.algorithm
            ))
        })?;

        let nonce = challenge.nonce.to_string();
        let nc = challenge.nc.to_string();
        let cnonce_text = cnonce.to_string();
        // RPC digest hashes a fixed method/uri pair
        let response = calculate_digest_response(&DigestParams {
            algorithm,
            username: &credentials.username,
            password: &credentials.password,
            realm: &challenge.realm,
            nonce: &nonce,
            nc: &nc,
            cnonce: &cnonce_text,
            qop: Some("auth"),
            method: "dummy_method",
            uri: "dummy_uri",
        });

        Ok(Self {
            realm: challenge.realm.clone(),
            username: credentials.username.clone(),
            nonce: challenge.nonce,
            cnonce,
            response,
            algorithm: algorithm.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc2617_params() -> DigestParams<'static> {
        DigestParams {
            algorithm: DigestAlgorithm::Md5,
            username: "Mufasa",
            password: "Circle Of Life",
            realm: "testrealm@host.com",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            nc: "00000001",
            cnonce: "0a4f113b",
            qop: Some("auth"),
            method: "GET",
            uri: "/dir/index.html",
        }
    }

    #[test]
    fn test_md5_of_empty_string() {
        assert_eq!(
            DigestAlgorithm::Md5.hash_hex(""),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            DigestAlgorithm::Sha256.hash_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_rfc2617_worked_example() {
        assert_eq!(
            calculate_digest_response(&rfc2617_params()),
            "6629fae49393a05397450978507c4ef1"
        );
    }

    #[test]
    fn test_digest_response_is_deterministic_hex() {
        let md5 = calculate_digest_response(&rfc2617_params());
        assert_eq!(md5, calculate_digest_response(&rfc2617_params()));
        assert_eq!(md5.len(), 32);
        assert!(md5.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let sha = calculate_digest_response(&DigestParams {
            algorithm: DigestAlgorithm::Sha256,
            ..rfc2617_params()
        });
        assert_eq!(sha.len(), 64);
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_digest_without_qop() {
        let params = DigestParams {
            qop: None,
            ..rfc2617_params()
        };
        let ha1 = DigestAlgorithm::Md5.hash_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = DigestAlgorithm::Md5.hash_hex("GET:/dir/index.html");
        let expected = DigestAlgorithm::Md5.hash_hex(&format!(
            "{ha1}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{ha2}"
        ));
        assert_eq!(calculate_digest_response(&params), expected);
    }

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="shelly", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", qop="auth""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "shelly");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);
        assert_eq!(challenge.opaque, None);
    }

    #[test]
    fn test_parse_challenge_with_quoted_commas_and_sha256() {
        let challenge = DigestChallenge::parse(
            r#"digest realm="a,b", qop="auth,auth-int", algorithm=SHA-256, nonce="n1", opaque="xyz""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "a,b");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.algorithm, DigestAlgorithm::Sha256);
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_parse_rejects_basic_and_missing_nonce() {
        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_err());
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_err());
        assert!(DigestChallenge::parse(r#"Digest realm="x", nonce="n", algorithm=SHA-512"#).is_err());
    }

    #[test]
    fn test_authorization_header() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="shelly", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", qop="auth""#,
        )
        .unwrap();
        let header = challenge.authorization_with_cnonce(
            &Credentials::new("admin", "password"),
            "POST",
            "/rpc",
            "0a4f113b",
        );

        assert!(header.starts_with("Digest "));
        assert!(header.contains(r#"username="admin""#));
        assert!(header.contains(r#"realm="shelly""#));
        assert!(header.contains(r#"nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093""#));
        assert!(header.contains(r#"uri="/rpc""#));
        assert!(header.contains("qop=auth"));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains(r#"cnonce="0a4f113b""#));
    }

    #[test]
    fn test_cnonce_is_random_hex() {
        let a = generate_cnonce();
        let b = generate_cnonce();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_basic_authorization() {
        assert_eq!(
            basic_authorization(&Credentials::new("Aladdin", "open sesame")),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn test_rpc_auth_from_error_message() {
        let challenge = RpcAuthChallenge::parse(
            r#"{"auth_type":"digest","nonce":1625038762,"nc":1,"realm":"shellypro4pm-f008d1d8b8b8","algorithm":"SHA-256"}"#,
        )
        .unwrap();
        let creds = Credentials::new("admin", "secret");
        let auth = RpcAuth::with_cnonce(&challenge, &creds, 313273957).unwrap();

        let ha1 = DigestAlgorithm::Sha256.hash_hex("admin:shellypro4pm-f008d1d8b8b8:secret");
        let ha2 = DigestAlgorithm::Sha256.hash_hex("dummy_method:dummy_uri");
        let expected = DigestAlgorithm::Sha256
            .hash_hex(&format!("{ha1}:1625038762:1:313273957:auth:{ha2}"));

        assert_eq!(auth.response, expected);
        assert_eq!(auth.username, "admin");
        assert_eq!(auth.algorithm, "SHA-256");
        assert_eq!(auth.nonce, 1625038762);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("admin", "hunter2"));
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }
}
