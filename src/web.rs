//! HTTP surface of the gateway.
//!
//! Middleware runs outermost first: security headers, request tracing, session
//! load/persist, identity resolution, then the route handler. Site content is
//! served by the fallback handler, which applies the access decision and
//! rewrites pages.
use crate::authz::engine;
use crate::authz::types::AccessDecision;
use crate::authz::PolicyStore;
use crate::content::{ContentSource, FsContent, INDEX_PAGE};
use crate::edge::EdgeVerifier;
use crate::errors::GateError;
use crate::identity::Identity;
use crate::oidc::{CallbackParams, OidcClient};
use crate::rewrite;
use crate::session::{random_token, SessionCookie, SessionHandle, SessionState, SessionStore};
use crate::settings::{AuthMode, SecretResolver, Settings};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use miette::IntoDiagnostic;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Served when the site has no index page to build on.
const FALLBACK_INDEX: &str = "<!DOCTYPE html>\n<html><body><nav></nav><main></main></body></html>\n";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub policy: Arc<PolicyStore>,
    pub sessions: SessionStore,
    pub secret_key: Arc<Vec<u8>>,
    pub oidc: Option<Arc<OidcClient>>,
    pub edge: Option<EdgeVerifier>,
    pub content: Arc<dyn ContentSource>,
}

impl AppState {
    pub fn from_settings(settings: Settings) -> Result<Self, GateError> {
        let resolver = settings.clone();
        Self::with_resolver(settings, &resolver)
    }

    pub fn with_resolver(settings: Settings, resolver: &dyn SecretResolver) -> Result<Self, GateError> {
        let secrets = resolver.resolve();

        let secret_key = secrets
            .as_ref()
            .ok()
            .and_then(|s| s.secret_key.clone())
            .or_else(|| settings.session.secret_key.clone())
            .unwrap_or_else(|| {
                tracing::warn!("session.secret_key is not set, sessions will not survive a restart");
                random_token()
            });

        let oidc = match (settings.auth.mode, secrets) {
            (AuthMode::Oidc, Ok(secrets)) => Some(Arc::new(OidcClient::new(
                secrets,
                settings.oidc.scope.clone(),
                Duration::from_secs(settings.oidc.timeout_secs),
            )?)),
            (AuthMode::Oidc, Err(e)) => {
                tracing::warn!(error = %e, "OIDC is not configured, /login will be unavailable");
                None
            }
            (AuthMode::Edge, _) => None,
        };

        let edge = match settings.auth.mode {
            AuthMode::Edge => Some(EdgeVerifier::new(&settings.edge, settings.auth.verify_expiry)?),
            AuthMode::Oidc => None,
        };

        Ok(Self {
            policy: Arc::new(PolicyStore::new(settings.access_file_path())),
            sessions: SessionStore::new(Duration::from_secs(settings.session.max_age_secs)),
            secret_key: Arc::new(secret_key.into_bytes()),
            oidc,
            edge,
            content: Arc::new(FsContent::new(settings.site.root.clone())),
            settings: Arc::new(settings),
        })
    }

    fn secure_cookies(&self) -> bool {
        self.settings
            .server
            .public_base_url
            .as_deref()
            .is_some_and(|url| url.starts_with("https://"))
    }

    fn base_url(&self, headers: &HeaderMap) -> String {
        let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
        self.settings.base_url(host)
    }
}

async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    response
}

/// Attach the session named by the cookie (or a detached empty one) to the
/// request. Handlers change the stored session in place through the handle.
/// Once the response is built the session's lifetime and cookie are renewed,
/// and a session that was asked to rotate moves to a fresh id. A new session
/// is only stored, and a cookie only issued, when something was written to it.
async fn session_layer(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    let existing = SessionCookie::from_headers(request.headers(), &state.secret_key).and_then(|cookie| {
        state
            .sessions
            .handle(&cookie.session_id)
            .map(|handle| (cookie.session_id, handle))
    });
    let (session_id, handle) = match existing {
        Some((id, handle)) => (Some(id), handle),
        None => (None, SessionHandle::detached()),
    };
    request.extensions_mut().insert(handle.clone());

    let mut response = next.run(request).await;

    let issued = match session_id {
        Some(id) if handle.wants_new_id() => {
            let renewed = state.sessions.rotate(&id);
            if renewed.is_some() {
                tracing::debug!("Session id renewed after sign-in");
            }
            renewed
        }
        Some(id) => state.sessions.touch(&id).then_some(id),
        None if *handle.lock().await != SessionState::default() => Some(state.sessions.adopt(&handle)),
        None => None,
    };

    if let Some(id) = issued {
        let cookie = SessionCookie::new(id).to_cookie_header(
            &state.secret_key,
            state.secure_cookies(),
            state.sessions.max_age(),
        );
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::error!(error = %e, "Unable to encode session cookie"),
        }
    }
    response
}

/// In production edge mode the proxy's identity header is verified on every
/// request. A valid token replaces the session identity and a new subject
/// renews the session id. A missing or invalid token clears the identity,
/// leaving the request anonymous.
async fn resolve_identity(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let (Some(edge), true) = (&state.edge, state.settings.is_production()) else {
        return next.run(request).await;
    };
    let Some(handle) = request.extensions().get::<SessionHandle>().cloned() else {
        return next.run(request).await;
    };
    let token = request
        .headers()
        .get(state.settings.edge.header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(token) = token else {
        if handle.lock().await.identity.take().is_some() {
            tracing::info!(header = %state.settings.edge.header, "Edge identity header missing, session identity cleared");
        }
        return next.run(request).await;
    };

    let verified = edge.verify(&token).await;
    let mut session = handle.lock().await;
    match verified {
        Ok(identity) => {
            tracing::debug!(subject = %identity.subject, "Edge identity verified");
            let current = session.identity.as_ref().map(|i| i.subject.as_str());
            if current != Some(identity.subject.as_str()) {
                handle.renew_id();
            }
            session.identity = Some(identity);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Edge identity rejected");
            session.identity = None;
        }
    }
    drop(session);
    next.run(request).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/__gtg", get(good_to_go))
        .route("/login", get(login))
        .route("/oidc-callback", get(oidc_callback))
        .route("/logout", get(logout))
        .route("/auth", get(edge_auth))
        .route("/oauth2/idpresponse", get(edge_auth))
        .fallback(site_content)
        .layer(middleware::from_fn_with_state(state.clone(), resolve_identity))
        .layer(middleware::from_fn_with_state(state.clone(), session_layer))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn serve(settings: Settings) -> miette::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let state = AppState::from_settings(settings)?;
    tracing::info!(
        mode = ?state.settings.auth.mode,
        environment = ?state.settings.auth.environment,
        site_root = %state.settings.site.root.display(),
        "Gateway configured"
    );

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            sessions.purge_expired();
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    tracing::info!(%addr, "Gateway listening");
    axum::serve(listener, router(state)).await.into_diagnostic()?;
    Ok(())
}

async fn good_to_go() -> &'static str {
    "Good to Go!"
}

async fn login(
    State(state): State<AppState>,
    Extension(session): Extension<SessionHandle>,
    headers: HeaderMap,
) -> Response {
    let Some(oidc) = &state.oidc else {
        return unavailable("Login is not configured");
    };
    let redirect_uri = format!("{}/oidc-callback", state.base_url(&headers));
    let mut session = session.lock().await;
    match oidc.begin_login(&mut session, &redirect_uri).await {
        Ok(url) => found(&url),
        Err(e) => {
            tracing::error!(error = %e, "Unable to start login");
            unavailable("Login is temporarily unavailable")
        }
    }
}

async fn oidc_callback(
    State(state): State<AppState>,
    Extension(handle): Extension<SessionHandle>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(oidc) = &state.oidc else {
        return unavailable("Login is not configured");
    };
    let mut session = handle.lock().await;
    match oidc.complete_login(&mut session, &params).await {
        Ok(Some(_)) => {
            handle.renew_id();
            found(&local_redirect(session.take_request_path()))
        }
        Ok(None) => found(&local_redirect(session.take_request_path())),
        Err(e) => {
            tracing::warn!(error = %e, "Login callback failed");
            let path = session.request_path.clone().unwrap_or_else(|| "/".to_string());
            let fragment = rewrite::denied_fragment(
                state.settings.auth.mode,
                None,
                &path,
                "Sign in failed. Please try again.",
            );
            drop(session);
            denied_page(&state, &fragment, &path).await
        }
    }
}

async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<SessionHandle>,
    headers: HeaderMap,
) -> Response {
    let mut session = session.lock().await;
    match &state.oidc {
        Some(oidc) => {
            let target = oidc.logout(&mut session, &state.base_url(&headers)).await;
            found(target.as_deref().unwrap_or("/"))
        }
        None => {
            session.identity = None;
            session.csrf_state = None;
            found("/")
        }
    }
}

/// Landing route after the edge proxy has authenticated the user. Outside
/// production there is no proxy, so the session is only marked as debug.
async fn edge_auth(State(state): State<AppState>, Extension(session): Extension<SessionHandle>) -> Response {
    let mut session = session.lock().await;
    if !state.settings.is_production() {
        session.auth_debug = true;
    }
    found(&local_redirect(session.take_request_path()))
}

async fn site_content(
    State(state): State<AppState>,
    Extension(session): Extension<SessionHandle>,
    uri: Uri,
) -> Response {
    let path = urlencoding::decode(uri.path())
        .map(Cow::into_owned)
        .unwrap_or_else(|_| uri.path().to_string());

    if rewrite::is_policy_path(&path, &state.settings.site.access_file) {
        return found("/");
    }

    let content = read_content(&state, &path).await;

    if rewrite::is_asset(&path) {
        return match content {
            Ok(bytes) => with_content_type(rewrite::content_type(&path), bytes),
            Err(GateError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
            Err(e) => internal_error(&path, &e),
        };
    }

    let bytes = match content {
        Ok(bytes) => bytes,
        Err(GateError::NotFound(_)) => {
            tracing::debug!(%path, "Page not found");
            let index = index_page(&state).await;
            return html_response(rewrite::inject_not_found(&index), false);
        }
        Err(e) => return internal_error(&path, &e),
    };

    let mut session = session.lock().await;
    let identity = session.identity.clone();
    let decision = engine::evaluate(&state.policy.get(), &path, identity.as_ref());
    if !decision.allowed {
        tracing::info!(%path, subject = identity.as_ref().map(|i| i.subject.as_str()), "Access denied");
        session.request_path = Some(path.clone());
    }
    drop(session);

    match String::from_utf8(bytes) {
        Ok(page) => render_page(&state, &page, &path, identity.as_ref(), &decision),
        Err(e) if decision.allowed => with_content_type(rewrite::content_type(&path), e.into_bytes()),
        Err(_) => {
            let index = index_page(&state).await;
            render_page(&state, &index, &path, identity.as_ref(), &decision)
        }
    }
}

fn render_page(
    state: &AppState,
    page: &str,
    path: &str,
    identity: Option<&Identity>,
    decision: &AccessDecision,
) -> Response {
    let mode = state.settings.auth.mode;
    let page = rewrite::inject_login_status(page, &rewrite::login_fragment(mode, identity));
    if decision.allowed {
        return html_response(page, false);
    }
    let fragment = rewrite::denied_fragment(mode, identity, path, &decision.message);
    html_response(rewrite::inject_denied(&page, &fragment, path), true)
}

async fn denied_page(state: &AppState, fragment: &str, path: &str) -> Response {
    let index = index_page(state).await;
    let page = rewrite::inject_login_status(&index, &rewrite::login_fragment(state.settings.auth.mode, None));
    html_response(rewrite::inject_denied(&page, fragment, path), true)
}

async fn read_content(state: &AppState, path: &str) -> Result<Vec<u8>, GateError> {
    let content = state.content.clone();
    let path = path.to_string();
    tokio::task::spawn_blocking(move || content.read(&path))
        .await
        .map_err(|e| GateError::Other(format!("content read task failed: {e}")))?
}

async fn index_page(state: &AppState) -> String {
    match read_content(state, INDEX_PAGE).await {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| FALLBACK_INDEX.to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "Index page unavailable");
            FALLBACK_INDEX.to_string()
        }
    }
}

/// Only same-origin paths are followed after login.
fn local_redirect(target: Option<String>) -> String {
    target
        .filter(|t| t.starts_with('/') && !t.starts_with("//") && !t.starts_with("/\\"))
        .unwrap_or_else(|| "/".to_string())
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn unavailable(message: &'static str) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
}

fn html_response(body: String, no_cache: bool) -> Response {
    let mut response = with_content_type("text/html; charset=utf-8", body.into_bytes());
    if no_cache {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static(rewrite::NO_CACHE));
    }
    response
}

fn with_content_type(content_type: &'static str, body: Vec<u8>) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

fn internal_error(path: &str, error: &GateError) -> Response {
    tracing::error!(%path, error = %error, "Failed to read site content");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}
