//! Digest access authentication (RFC 7616, with RFC 2617 compatibility)
//! and the client-side challenge controller.
//!
//! [`compute_digest`] is a pure function of its inputs; the nonce-count
//! bookkeeping lives in [`DigestState`] so the `nc` value is monotonic per
//! (realm, nonce). [`handle_client_authenticate`] rebuilds a challenged
//! request (CSeq incremented, fresh top-Via branch, Authorization
//! attached) and hands back a new client transaction for it. Callers
//! enforce the at-most-once retry rule.

use crate::message::{Method, Request, Response, StatusCode};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionKey;
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_branch, random_hex};
use crate::{Error, Result};
use sha2::Digest;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Authentication credentials.
///
/// `realm` restricts the credential to challenges from that realm when
/// set; `display_name` is used when the credential shapes a From header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub display_name: Option<String>,
}

impl Credential {
    pub fn new(username: &str, password: &str) -> Self {
        Credential {
            username: username.to_string(),
            password: password.to_string(),
            realm: None,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    #[default]
    Sha256,
    Sha256Sess,
    Sha512,
    Sha512Sess,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Sha512Sess => "SHA-512-sess",
        }
    }

    pub fn parse(s: &str) -> Option<DigestAlgorithm> {
        let all = [
            DigestAlgorithm::Md5,
            DigestAlgorithm::Md5Sess,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha256Sess,
            DigestAlgorithm::Sha512,
            DigestAlgorithm::Sha512Sess,
        ];
        all.into_iter().find(|a| a.as_str().eq_ignore_ascii_case(s))
    }

    pub fn is_sess(&self) -> bool {
        matches!(
            self,
            DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess | DigestAlgorithm::Sha512Sess
        )
    }

    /// Lowercase hex digest of `data`.
    pub fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                format!("{:x}", md5::compute(data.as_bytes()))
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(sha2::Sha256::digest(data.as_bytes()))
            }
            DigestAlgorithm::Sha512 | DigestAlgorithm::Sha512Sess => {
                hex::encode(sha2::Sha512::digest(data.as_bytes()))
            }
        }
    }

    fn hash_bytes(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                format!("{:x}", md5::compute(data))
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(sha2::Sha256::digest(data))
            }
            DigestAlgorithm::Sha512 | DigestAlgorithm::Sha512Sess => {
                hex::encode(sha2::Sha512::digest(data))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// A parsed Digest challenge from a WWW-Authenticate or
/// Proxy-Authenticate header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Vec<Qop>,
    pub opaque: Option<String>,
    pub stale: bool,
    pub domain: Option<String>,
}

impl DigestChallenge {
    pub fn parse(value: &str) -> Result<DigestChallenge> {
        let rest = value
            .trim()
            .strip_prefix("Digest")
            .or_else(|| value.trim().strip_prefix("digest"))
            .ok_or(Error::AuthFailed("challenge scheme is not Digest".to_string()))?;

        let mut realm = None;
        let mut nonce = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut qop = Vec::new();
        let mut opaque = None;
        let mut stale = false;
        let mut domain = None;

        for (key, val) in split_auth_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "algorithm" => {
                    algorithm = DigestAlgorithm::parse(&val)
                        .ok_or_else(|| Error::AuthFailed(format!("unsupported algorithm {}", val)))?;
                }
                "qop" => {
                    for q in val.split(',') {
                        match q.trim() {
                            "auth" => qop.push(Qop::Auth),
                            "auth-int" => qop.push(Qop::AuthInt),
                            _ => {}
                        }
                    }
                }
                "opaque" => opaque = Some(val),
                "stale" => stale = val.eq_ignore_ascii_case("true"),
                "domain" => domain = Some(val),
                _ => {}
            }
        }

        Ok(DigestChallenge {
            realm: realm.ok_or(Error::AuthFailed("challenge without realm".to_string()))?,
            nonce: nonce.ok_or(Error::AuthFailed("challenge without nonce".to_string()))?,
            algorithm,
            qop,
            opaque,
            stale,
            domain,
        })
    }

    /// The qop this client will negotiate: `auth` when offered, else
    /// `auth-int`, else none.
    pub fn selected_qop(&self) -> Option<Qop> {
        if self.qop.contains(&Qop::Auth) {
            Some(Qop::Auth)
        } else {
            self.qop.first().copied()
        }
    }
}

/// Splits `k=v, k="quoted, value", k=v` respecting quoted strings.
fn split_auth_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    let bytes = s.as_bytes();
    let mut push_item = |item: &str, out: &mut Vec<(String, String)>| {
        let item = item.trim().trim_matches(',').trim();
        if item.is_empty() {
            return;
        }
        if let Some((k, v)) = item.split_once('=') {
            out.push((k.trim().to_string(), v.trim().trim_matches('"').to_string()));
        }
    };
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                push_item(&s[start..i], &mut out);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_item(&s[start..], &mut out);
    out
}

/// Per-facade digest bookkeeping: a monotonically increasing nonce count
/// for each (realm, nonce) pair.
#[derive(Debug, Default)]
pub struct DigestState {
    counters: Mutex<HashMap<(String, String), u32>>,
}

impl DigestState {
    pub fn new() -> Self {
        DigestState::default()
    }

    pub fn next_nc(&self, realm: &str, nonce: &str) -> u32 {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters
            .entry((realm.to_string(), nonce.to_string()))
            .or_insert(0);
        *entry += 1;
        *entry
    }
}

/// A fresh 16-hex-character client nonce.
pub fn make_cnonce() -> String {
    random_hex(16)
}

/// Computes the value of an Authorization/Proxy-Authorization header for
/// one request. Deterministic in all of its inputs.
pub fn compute_digest(
    credential: &Credential,
    challenge: &DigestChallenge,
    method: &Method,
    uri: &str,
    body: Option<&[u8]>,
    nc: u32,
    cnonce: &str,
) -> String {
    let alg = challenge.algorithm;
    let qop = challenge.selected_qop();

    let mut ha1 = alg.hash(&format!(
        "{}:{}:{}",
        credential.username, challenge.realm, credential.password
    ));
    if alg.is_sess() {
        ha1 = alg.hash(&format!("{}:{}:{}", ha1, challenge.nonce, cnonce));
    }

    let ha2 = match qop {
        Some(Qop::AuthInt) => {
            let body_hash = alg.hash_bytes(body.unwrap_or_default());
            alg.hash(&format!("{}:{}:{}", method, uri, body_hash))
        }
        _ => alg.hash(&format!("{}:{}", method, uri)),
    };

    let response = match qop {
        Some(q) => alg.hash(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1,
            challenge.nonce,
            nc,
            cnonce,
            q.as_str(),
            ha2
        )),
        None => alg.hash(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    };

    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
        credential.username,
        challenge.realm,
        challenge.nonce,
        uri,
        alg.as_str(),
        response
    );
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    if let Some(q) = qop {
        value.push_str(&format!(", qop={}, nc={:08x}, cnonce=\"{}\"", q.as_str(), nc, cnonce));
    } else if alg.is_sess() {
        value.push_str(&format!(", cnonce=\"{}\"", cnonce));
    }
    value
}

/// Picks the challenge this client answers from a 401/407 response:
/// all (Proxy-)WWW-Authenticate values are parsed and the preferred
/// algorithm wins when offered, then MD5, then the first challenge.
/// Returns the challenge and whether it came from a proxy.
pub fn challenge_from_response(
    resp: &Response,
    preferred: DigestAlgorithm,
) -> Result<(DigestChallenge, bool)> {
    let proxy = resp.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    let header = if proxy { "Proxy-Authenticate" } else { "WWW-Authenticate" };
    let mut challenges = Vec::new();
    for value in resp.headers.get_all(header) {
        match DigestChallenge::parse(value) {
            Ok(c) => challenges.push(c),
            Err(e) => debug!("skipping unusable challenge: {}", e),
        }
    }
    if challenges.is_empty() {
        return Err(Error::AuthFailed(format!("{} carries no usable Digest challenge", resp.status)));
    }
    let pick = challenges
        .iter()
        .position(|c| c.algorithm == preferred)
        .or_else(|| challenges.iter().position(|c| c.algorithm == DigestAlgorithm::Md5))
        .unwrap_or(0);
    Ok((challenges.swap_remove(pick), proxy))
}

/// Rebuilds a challenged request: the CSeq number becomes `new_seq`, the
/// top Via gets a fresh branch, and the computed Authorization (or
/// Proxy-Authorization, for a 407) replaces any earlier one. Everything
/// else is kept from the original.
pub fn build_authenticated_request(
    endpoint: &EndpointInnerRef,
    new_seq: u32,
    original: &Request,
    resp: &Response,
    credential: &Credential,
    preferred: DigestAlgorithm,
) -> Result<Request> {
    let (challenge, proxy) = challenge_from_response(resp, preferred)?;
    if let Some(wanted) = &credential.realm {
        if !wanted.eq_ignore_ascii_case(&challenge.realm) {
            return Err(Error::AuthFailed(format!(
                "no credential for realm {}",
                challenge.realm
            )));
        }
    }

    let mut request = original.clone();
    let (_, method) = request.cseq()?;
    request
        .headers
        .unique_push("CSeq", format!("{} {}", new_seq, method));
    if let Some(via) = request.headers.get("Via").map(|v| v.to_string()) {
        request.headers.unique_push("Via", refresh_via_branch(&via));
    }

    let nc = endpoint.digest_state.next_nc(&challenge.realm, &challenge.nonce);
    let cnonce = make_cnonce();
    let uri = request.uri.to_string();
    let body = if request.body.is_empty() {
        None
    } else {
        Some(request.body.as_slice())
    };
    let authorization = compute_digest(credential, &challenge, &method, &uri, body, nc, &cnonce);

    let header = if proxy { "Proxy-Authorization" } else { "Authorization" };
    request.headers.remove("Authorization");
    request.headers.remove("Proxy-Authorization");
    request.headers.push(header, authorization);
    debug!("rebuilt {} with {} for realm {}", method, header, challenge.realm);
    Ok(request)
}

/// Consumes a challenged transaction and returns a new one carrying the
/// re-authorized request. The caller sends the returned transaction and
/// must not invoke this twice for the same challenge.
pub async fn handle_client_authenticate(
    new_seq: u32,
    tx: Transaction,
    resp: &Response,
    credential: &Credential,
    preferred: DigestAlgorithm,
) -> Result<Transaction> {
    let endpoint: EndpointInnerRef = tx.endpoint_inner.clone();
    let destination = tx.destination;
    let request =
        build_authenticated_request(&endpoint, new_seq, &tx.original, resp, credential, preferred)?;
    drop(tx);

    let key = TransactionKey::from_request(&request)?;
    let mut new_tx = Transaction::new_client(key, request, endpoint, None);
    new_tx.destination = destination;
    Ok(new_tx)
}

/// The original Via value with its branch parameter replaced by a fresh
/// token.
fn refresh_via_branch(via: &str) -> String {
    let mut parts: Vec<String> = via.split(';').map(|p| p.trim().to_string()).collect();
    let mut replaced = false;
    for part in parts.iter_mut().skip(1) {
        if part.len() >= 7 && part[..7].eq_ignore_ascii_case("branch=") {
            *part = format!("branch={}", make_branch());
            replaced = true;
        }
    }
    if !replaced {
        parts.push(format!("branch={}", make_branch()));
    }
    parts.join(";")
}
