//! SIP Digest Authentication, client side (RFC 2617, RFC 3261 Section 22)

use super::message::{SipError, SipRequest, SipResponse};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Identity used to answer challenges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
    /// Only answer challenges from this realm when set
    #[serde(default)]
    pub realm: Option<String>,
}

impl UserCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            realm: None,
        }
    }
}

/// Parsed `WWW-Authenticate: Digest ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// Selected quality of protection, `auth` when offered
    pub qop: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    /// Extract the first Digest challenge carried by a 401 response
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let value = response
            .header_values("WWW-Authenticate")
            .into_iter()
            .find(|v| digest_params(v).is_some())
            .ok_or_else(|| {
                SipError::Authentication("No Digest WWW-Authenticate header found".to_string())
            })?;

        Self::parse(&value)
    }

    /// Parse a header value of the form `Digest realm="..", nonce=".."`
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let Some(params) = digest_params(value) else {
            return Err(SipError::Authentication(format!(
                "Unsupported authentication scheme: {}",
                value
            )));
        };

        let params = parse_digest_params(params);

        let realm = params
            .get("realm")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        let algorithm = params.get("algorithm").cloned();
        if let Some(alg) = &algorithm {
            if !alg.eq_ignore_ascii_case("MD5") {
                return Err(SipError::Authentication(format!(
                    "Unsupported digest algorithm: {}",
                    alg
                )));
            }
        }

        let qop = match params.get("qop") {
            None => None,
            Some(offered) => {
                if offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    Some("auth".to_string())
                } else {
                    return Err(SipError::Authentication(format!(
                        "Unsupported qop: {}",
                        offered
                    )));
                }
            }
        };

        let stale = params
            .get("stale")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            algorithm,
            qop,
            stale,
        })
    }
}

/// Parameter list following a case-insensitive `Digest` scheme token.
/// Header values come off the wire, so nothing here may split a character.
fn digest_params(value: &str) -> Option<&str> {
    let value = value.trim();
    match value.get(..6) {
        Some(scheme) if scheme.eq_ignore_ascii_case("Digest") => value.get(6..),
        _ => None,
    }
}

/// Parse comma separated `key=value` / `key="value"` pairs.
/// Commas inside quoted strings do not split.
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }

    params
}

/// Calculate digest response
#[allow(clippy::too_many_arguments)]
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: &str,
    cnonce: &str,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    match qop {
        Some(qop) => format!(
            "{:x}",
            md5::compute(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        ),
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

/// Answers digest challenges for one transaction
#[derive(Debug, Clone)]
pub struct DigestClient {
    credentials: UserCredentials,
    last_nonce: Option<String>,
    nonce_count: u32,
}

impl DigestClient {
    pub fn new(credentials: UserCredentials) -> Self {
        Self {
            credentials,
            last_nonce: None,
            nonce_count: 0,
        }
    }

    /// Build the credentialed re-request for `challenge`.
    ///
    /// The returned request carries an `Authorization` header and the next
    /// CSeq number. A re-challenge for a nonce that was already answered and
    /// is not marked stale means the credentials were rejected.
    pub fn authorize(
        &mut self,
        request: &SipRequest,
        challenge: &DigestChallenge,
    ) -> Result<SipRequest, SipError> {
        if let Some(realm) = &self.credentials.realm {
            if realm != &challenge.realm {
                return Err(SipError::Authentication(format!(
                    "No credentials for realm {}",
                    challenge.realm
                )));
            }
        }

        if self.last_nonce.as_deref() == Some(challenge.nonce.as_str()) && !challenge.stale {
            return Err(SipError::Authentication(format!(
                "Credentials for {} rejected by {}",
                self.credentials.username, challenge.realm
            )));
        }

        self.nonce_count = if self.last_nonce.as_deref() == Some(challenge.nonce.as_str()) {
            self.nonce_count + 1
        } else {
            1
        };
        self.last_nonce = Some(challenge.nonce.clone());

        let nc = format!("{:08x}", self.nonce_count);
        let cnonce = generate_cnonce();
        let method = request.inner.method.to_string();
        let uri = request.uri().to_string();

        let response = digest_response(
            &self.credentials.username,
            &self.credentials.password,
            &challenge.realm,
            &challenge.nonce,
            &method,
            &uri,
            challenge.qop.as_deref(),
            &nc,
            &cnonce,
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
            self.credentials.username, challenge.realm, challenge.nonce, uri, response
        );
        if let Some(qop) = &challenge.qop {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        debug!(
            "Answering digest challenge for realm {} as {}",
            challenge.realm, self.credentials.username
        );

        request.with_header("Authorization", &value).with_next_cseq()
    }
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}
