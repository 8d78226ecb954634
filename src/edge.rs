//! Verification of identity tokens forwarded by a trusted load balancer.
//!
//! The proxy authenticates the user, then attaches a compact ES256 JWT to every
//! request. The token header names the signing key (`kid`); the matching PEM
//! public key is published at `<key_endpoint>/<kid>` and never changes for a
//! given kid, so keys are cached for the life of the process.
use crate::errors::GateError;
use crate::identity::Identity;
use crate::settings::Edge;
use base64ct::{Base64UrlUnpadded, Encoding};
use dashmap::DashMap;
use josekit::jws::{JwsVerifier, ES256};
use josekit::jwt::JwtPayload;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;

#[derive(Clone)]
pub struct EdgeVerifier {
    client: reqwest::Client,
    key_endpoint: String,
    verify_expiry: bool,
    keys: Arc<DashMap<String, Arc<OnceCell<Arc<String>>>>>,
}

impl std::fmt::Debug for EdgeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeVerifier")
            .field("key_endpoint", &self.key_endpoint)
            .field("verify_expiry", &self.verify_expiry)
            .field("cached_keys", &self.keys.len())
            .finish()
    }
}

impl EdgeVerifier {
    pub fn new(cfg: &Edge, verify_expiry: bool) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            key_endpoint: cfg.key_endpoint.trim_end_matches('/').to_string(),
            verify_expiry,
            keys: Arc::new(DashMap::new()),
        })
    }

    /// Verify `token` and map its claims to an identity.
    ///
    /// The signature covers the segments exactly as sent, so it is checked
    /// before any padding is removed for decoding.
    pub async fn verify(&self, token: &str) -> Result<Identity, GateError> {
        let (signing_input, header, payload, signature) = split_token(token.trim())?;
        let kid = key_id(header)?;
        let pem = self.public_key(&kid).await?;

        let verifier = ES256
            .verifier_from_pem(pem.as_bytes())
            .map_err(|e| GateError::InvalidToken(format!("unusable key {kid}: {e}")))?;
        verifier
            .verify(signing_input.as_bytes(), &decode_segment(signature)?)
            .map_err(|e| GateError::InvalidToken(e.to_string()))?;

        let claims: Map<String, Value> = serde_json::from_slice(&decode_segment(payload)?)
            .map_err(|_| GateError::InvalidToken("payload is not a JSON object".to_string()))?;
        let payload = JwtPayload::from_map(claims).map_err(|e| GateError::InvalidToken(e.to_string()))?;

        if self.verify_expiry {
            let expires_at = payload
                .expires_at()
                .ok_or_else(|| GateError::InvalidToken("missing exp".to_string()))?;
            if expires_at <= SystemTime::now() {
                return Err(GateError::InvalidToken("token expired".to_string()));
            }
        }

        Identity::from_claims(payload.claims_set())
            .ok_or_else(|| GateError::InvalidToken("missing sub".to_string()))
    }

    /// Number of key ids held by the cache.
    pub fn cached_keys(&self) -> usize {
        self.keys.len()
    }

    async fn public_key(&self, kid: &str) -> Result<Arc<String>, GateError> {
        // One cell per kid: concurrent first requests share a single fetch,
        // and a failed fetch drops the cell so unknown kids are not retained.
        let cell = self.keys.entry(kid.to_string()).or_default().clone();
        match cell.get_or_try_init(|| self.fetch_key(kid)).await {
            Ok(key) => Ok(key.clone()),
            Err(e) => {
                self.keys.remove_if(kid, |_, cell| !cell.initialized());
                Err(e)
            }
        }
    }

    async fn fetch_key(&self, kid: &str) -> Result<Arc<String>, GateError> {
        let url = format!("{}/{}", self.key_endpoint, kid);
        tracing::debug!(%url, "Fetching edge public key");
        let pem = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(Arc::new(pem))
    }
}

/// Split a compact JWS into its signing input and the three raw segments.
fn split_token(token: &str) -> Result<(&str, &str, &str, &str), GateError> {
    let malformed = || GateError::InvalidToken("expected three segments".to_string());
    let (signing_input, signature) = token.rsplit_once('.').ok_or_else(malformed)?;
    let (header, payload) = signing_input.split_once('.').ok_or_else(malformed)?;
    if payload.contains('.') {
        return Err(malformed());
    }
    Ok((signing_input, header, payload, signature))
}

// Some proxies emit padded base64url segments.
fn decode_segment(segment: &str) -> Result<Vec<u8>, GateError> {
    Base64UrlUnpadded::decode_vec(segment.trim_end_matches('='))
        .map_err(|_| GateError::InvalidToken("segment is not base64url".to_string()))
}

/// Read the `kid` from the token header, which must announce ES256.
fn key_id(header: &str) -> Result<String, GateError> {
    let header: Value = serde_json::from_slice(&decode_segment(header)?)
        .map_err(|_| GateError::InvalidToken("header is not JSON".to_string()))?;
    if header.get("alg").and_then(Value::as_str) != Some("ES256") {
        return Err(GateError::InvalidToken("unexpected alg".to_string()));
    }
    let kid = header
        .get("kid")
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::InvalidToken("missing kid".to_string()))?;

    // The kid becomes part of the key URL.
    if kid.is_empty() || !kid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(GateError::InvalidToken("malformed kid".to_string()));
    }
    Ok(kid.to_string())
}
