use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64ct::{Base64Url, Encoding};
use josekit::jws::alg::ecdsa::EcdsaJwsSigner;
use josekit::jws::{JwsHeader, JwsSigner, ES256};
use josekit::jwt::{self, JwtPayload};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub const KID: &str = "3f1c2a9e-5b7d-4c11-9e2a-0d6f8b7a1c42";

#[derive(Default)]
struct Keys {
    pems: Mutex<HashMap<String, String>>,
    fetches: AtomicUsize,
}

/// Public-key endpoint on a random local port serving PEM keys at `/<kid>`.
pub struct KeyServer {
    pub addr: SocketAddr,
    keys: Arc<Keys>,
    signer: EcdsaJwsSigner,
}

impl KeyServer {
    pub async fn start() -> Self {
        let key_pair = ES256.generate_key_pair().unwrap();
        let signer = ES256.signer_from_pem(key_pair.to_pem_private_key()).unwrap();
        let public_pem = String::from_utf8(key_pair.to_pem_public_key()).unwrap();

        let keys = Arc::new(Keys::default());
        keys.pems.lock().unwrap().insert(KID.to_string(), public_pem);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/{kid}", get(public_key))
            .with_state(keys.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, keys, signer }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn fetches(&self) -> usize {
        self.keys.fetches.load(Ordering::SeqCst)
    }

    /// ES256 token signed with the served key. `claims` must be an object.
    pub fn token(&self, kid: &str, claims: Value, expires_at: Option<SystemTime>) -> String {
        sign(&self.signer, kid, claims, expires_at)
    }

    /// Token whose header and payload segments keep their base64 padding,
    /// signed over the padded text as the load balancer does.
    pub fn padded_token(&self, kid: &str, claims: Value) -> String {
        let header = serde_json::json!({ "alg": "ES256", "kid": kid, "typ": "JWT" });
        let signing_input = format!("{}.{}", padded_segment(&header), padded_segment(&claims));
        let signature = self.signer.sign(signing_input.as_bytes()).unwrap();
        format!("{signing_input}.{}", Base64Url::encode_string(&signature))
    }
}

// Trailing whitespace keeps the JSON valid while forcing a length that needs padding.
fn padded_segment(value: &Value) -> String {
    let mut json = value.to_string();
    if json.len() % 3 == 0 {
        json.push(' ');
    }
    let segment = Base64Url::encode_string(json.as_bytes());
    assert!(segment.ends_with('='));
    segment
}

pub fn sign(signer: &EcdsaJwsSigner, kid: &str, claims: Value, expires_at: Option<SystemTime>) -> String {
    let mut header = JwsHeader::new();
    header.set_token_type("JWT");
    header.set_key_id(kid);

    let Value::Object(claims) = claims else {
        panic!("claims must be a JSON object");
    };
    let mut payload = JwtPayload::from_map(claims).unwrap();
    if let Some(exp) = expires_at {
        payload.set_expires_at(&exp);
    }
    jwt::encode_with_signer(&payload, &header, signer).unwrap()
}

/// Signer for a key the server does not publish.
pub fn foreign_signer() -> EcdsaJwsSigner {
    let key_pair = ES256.generate_key_pair().unwrap();
    ES256.signer_from_pem(key_pair.to_pem_private_key()).unwrap()
}

async fn public_key(State(keys): State<Arc<Keys>>, Path(kid): Path<String>) -> Response {
    keys.fetches.fetch_add(1, Ordering::SeqCst);
    match keys.pems.lock().unwrap().get(&kid) {
        Some(pem) => pem.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
