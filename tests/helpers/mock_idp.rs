use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64ct::{Base64UrlUnpadded, Encoding};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ACCESS_TOKEN: &str = "mock-access-token";

#[derive(Debug)]
pub struct IdpState {
    pub id_token_claims: Value,
    pub userinfo: Value,
    pub token_status: StatusCode,
    pub token_delay: Duration,
    pub token_requests: Vec<HashMap<String, String>>,
    pub userinfo_auth: Vec<String>,
}

/// OIDC provider on a random local port: discovery, token and userinfo.
pub struct MockIdp {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<IdpState>>,
}

impl MockIdp {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(IdpState {
            id_token_claims: json!({ "sub": "user-1", "realm_access": { "roles": ["reader"] } }),
            userinfo: json!({ "sub": "user-1", "name": "Ada Lovelace", "email": "ada@example.com" }),
            token_status: StatusCode::OK,
            token_delay: Duration::ZERO,
            token_requests: Vec::new(),
            userinfo_auth: Vec::new(),
        }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let issuer = format!("http://{addr}/realms/test");

        let app = Router::new()
            .route(
                "/realms/test/.well-known/openid-configuration",
                get(move || {
                    let issuer = issuer.clone();
                    async move {
                        Json(json!({
                            "issuer": issuer,
                            "authorization_endpoint": format!("{issuer}/auth"),
                            "token_endpoint": format!("{issuer}/token"),
                            "userinfo_endpoint": format!("{issuer}/userinfo"),
                            "end_session_endpoint": format!("{issuer}/logout"),
                        }))
                    }
                }),
            )
            .route("/realms/test/token", post(token))
            .route("/realms/test/userinfo", get(userinfo))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/realms/test/", self.addr)
    }

    pub fn set_id_token_claims(&self, claims: Value) {
        self.state.lock().unwrap().id_token_claims = claims;
    }

    pub fn set_userinfo(&self, userinfo: Value) {
        self.state.lock().unwrap().userinfo = userinfo;
    }

    pub fn fail_token_requests(&self, status: StatusCode) {
        self.state.lock().unwrap().token_status = status;
    }

    /// Hold every token response for `delay`.
    pub fn delay_token_requests(&self, delay: Duration) {
        self.state.lock().unwrap().token_delay = delay;
    }

    pub fn token_requests(&self) -> Vec<HashMap<String, String>> {
        self.state.lock().unwrap().token_requests.clone()
    }

    pub fn userinfo_auth(&self) -> Vec<String> {
        self.state.lock().unwrap().userinfo_auth.clone()
    }
}

/// Unsigned compact token; the gateway reads ID token claims without verification.
pub fn id_token(claims: &Value) -> String {
    let header = Base64UrlUnpadded::encode_string(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = Base64UrlUnpadded::encode_string(claims.to_string().as_bytes());
    format!("{header}.{payload}.")
}

async fn token(
    State(state): State<Arc<Mutex<IdpState>>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let delay = state.lock().unwrap().token_delay;
    tokio::time::sleep(delay).await;

    let mut state = state.lock().unwrap();
    state.token_requests.push(form);
    if state.token_status != StatusCode::OK {
        return (state.token_status, Json(json!({ "error": "server_error" }))).into_response();
    }
    Json(json!({
        "access_token": ACCESS_TOKEN,
        "token_type": "Bearer",
        "expires_in": 300,
        "id_token": id_token(&state.id_token_claims),
    }))
    .into_response()
}

async fn userinfo(State(state): State<Arc<Mutex<IdpState>>>, headers: HeaderMap) -> Response {
    let mut state = state.lock().unwrap();
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.userinfo_auth.push(auth);
    Json(state.userinfo.clone()).into_response()
}
