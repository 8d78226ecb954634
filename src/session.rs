use crate::identity::Identity;
use axum::http::HeaderMap;
use base64ct::{Base64UrlUnpadded, Encoding};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

pub const SESSION_COOKIE_NAME: &str = "sitegate_session";

type HmacSha256 = Hmac<Sha256>;

/// 256 bits from the OS CSPRNG, base64url without padding (43 chars).
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Per-browser state kept server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// CSRF state bound to the pending authorization request
    pub csrf_state: Option<String>,
    pub nonce: Option<String>,
    /// redirect_uri sent with the pending authorization request
    pub login_redirect: Option<String>,
    /// Page the user was denied, for the post-login redirect
    pub request_path: Option<String>,
    pub identity: Option<Identity>,
    pub auth_debug: bool,
}

impl SessionState {
    /// Current CSRF state, created on first use or when `renew` is set.
    pub fn csrf_state(&mut self, renew: bool) -> String {
        match &self.csrf_state {
            Some(state) if !renew => state.clone(),
            _ => {
                let state = random_token();
                self.csrf_state = Some(state.clone());
                state
            }
        }
    }

    pub fn take_request_path(&mut self) -> Option<String> {
        self.request_path.take()
    }
}

/// Request-side view of a session. Every request on the same session id
/// shares one lock, so changes land on the stored entry and concurrent
/// requests never overwrite each other with stale copies.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    state: Arc<Mutex<SessionState>>,
    renew_id: Arc<AtomicBool>,
}

impl SessionHandle {
    fn new(state: Arc<Mutex<SessionState>>) -> Self {
        Self {
            state,
            renew_id: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An empty session that is not in any store yet.
    pub fn detached() -> Self {
        Self::new(Arc::new(Mutex::new(SessionState::default())))
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Move the session to a fresh id once the response is built. Called when
    /// a user signs in.
    pub fn renew_id(&self) {
        self.renew_id.store(true, Ordering::SeqCst);
    }

    pub fn wants_new_id(&self) -> bool {
        self.renew_id.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct StoredSession {
    state: Arc<Mutex<SessionState>>,
    expires_at: Instant,
}

/// In-memory session store keyed by session id. Sessions expire after
/// `max_age` without a request.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, StoredSession>>,
    max_age: Duration,
}

impl SessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Handle on a live session. Expired entries are dropped.
    pub fn handle(&self, session_id: &str) -> Option<SessionHandle> {
        let now = Instant::now();
        let state = {
            let entry = self.sessions.get(session_id)?;
            (entry.expires_at > now).then(|| entry.state.clone())
        };
        if state.is_none() {
            self.sessions.remove_if(session_id, |_, s| s.expires_at <= now);
        }
        state.map(SessionHandle::new)
    }

    /// Snapshot of a live session.
    pub async fn load(&self, session_id: &str) -> Option<SessionState> {
        let handle = self.handle(session_id)?;
        let state = handle.lock().await.clone();
        Some(state)
    }

    /// Extend the lifetime of a session. Returns false when it is gone.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.expires_at = Instant::now() + self.max_age;
                true
            }
            None => false,
        }
    }

    /// Create a session holding `state` and return its id.
    pub fn create(&self, state: SessionState) -> String {
        self.insert(Arc::new(Mutex::new(state)))
    }

    /// Store a detached session and return its new id.
    pub fn adopt(&self, handle: &SessionHandle) -> String {
        self.insert(handle.state.clone())
    }

    /// Move a session to a fresh id, invalidating the old one. Returns `None`
    /// when the session no longer exists.
    pub fn rotate(&self, session_id: &str) -> Option<String> {
        let (_, stored) = self.sessions.remove(session_id)?;
        Some(self.insert(stored.state))
    }

    fn insert(&self, state: Arc<Mutex<SessionState>>) -> String {
        let id = random_token();
        self.sessions.insert(
            id.clone(),
            StoredSession {
                state,
                expires_at: Instant::now() + self.max_age,
            },
        );
        id
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.sessions.retain(|_, s| s.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Session cookie carrying `<id>.<hmac>` so ids cannot be forged without the secret key.
#[derive(Clone, Debug)]
pub struct SessionCookie {
    pub session_id: String,
}

impl SessionCookie {
    pub fn new(session_id: String) -> Self {
        Self { session_id }
    }

    pub fn from_headers(headers: &HeaderMap, secret_key: &[u8]) -> Option<Self> {
        for header in headers.get_all(axum::http::header::COOKIE) {
            let Ok(cookie_header) = header.to_str() else {
                continue;
            };
            for cookie in cookie_header.split(';') {
                let cookie = cookie.trim();
                if let Some(value) = cookie
                    .strip_prefix(SESSION_COOKIE_NAME)
                    .and_then(|s| s.strip_prefix('='))
                {
                    return Self::verify(value, secret_key);
                }
            }
        }
        None
    }

    /// Signed cookie value for this session.
    pub fn value(&self, secret_key: &[u8]) -> String {
        format!("{}.{}", self.session_id, sign(&self.session_id, secret_key))
    }

    pub fn to_cookie_header(&self, secret_key: &[u8], secure: bool, max_age: Duration) -> String {
        format!(
            "{}={}; HttpOnly; {}SameSite=Lax; Path=/; Max-Age={}",
            SESSION_COOKIE_NAME,
            self.value(secret_key),
            if secure { "Secure; " } else { "" },
            max_age.as_secs()
        )
    }

    fn verify(value: &str, secret_key: &[u8]) -> Option<Self> {
        let (id, mac) = value.rsplit_once('.')?;
        let mac = Base64UrlUnpadded::decode_vec(mac).ok()?;
        let mut verifier = HmacSha256::new_from_slice(secret_key).ok()?;
        verifier.update(id.as_bytes());
        verifier.verify_slice(&mac).ok()?;
        Some(Self::new(id.to_string()))
    }
}

fn sign(session_id: &str, secret_key: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail
    match HmacSha256::new_from_slice(secret_key) {
        Ok(mut mac) => {
            mac.update(session_id.as_bytes());
            Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}
