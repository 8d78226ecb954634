//! Relying-party side of the OIDC authorization-code flow.
//!
//! A session moves ANONYMOUS → AWAITING_CALLBACK (`begin_login`) →
//! AUTHENTICATED (`complete_login`) and back to ANONYMOUS on `logout` or any
//! failed callback. Every failed callback rotates the CSRF state.
use crate::errors::GateError;
use crate::identity::{roles_from_claims, Identity};
use crate::session::{random_token, SessionState};
use crate::settings::OidcSecrets;
use base64ct::{Base64UrlUnpadded, Encoding};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Subset of the provider discovery document we rely on.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Query parameters the provider sends to the callback route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub session_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

pub struct OidcClient {
    secrets: OidcSecrets,
    scope: String,
    http: reqwest::Client,
    metadata: OnceCell<Arc<ProviderMetadata>>,
}

impl std::fmt::Debug for OidcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcClient")
            .field("endpoint", &self.secrets.endpoint)
            .field("client_id", &self.secrets.client_id)
            .field("scope", &self.scope)
            .field("discovered", &self.metadata.initialized())
            .finish()
    }
}

impl OidcClient {
    pub fn new(secrets: OidcSecrets, scope: impl Into<String>, timeout: Duration) -> Result<Self, GateError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            secrets,
            scope: scope.into(),
            http,
            metadata: OnceCell::new(),
        })
    }

    /// Client with discovery already done, for callers that hold the metadata.
    pub fn with_metadata(
        secrets: OidcSecrets,
        scope: impl Into<String>,
        timeout: Duration,
        metadata: ProviderMetadata,
    ) -> Result<Self, GateError> {
        let mut client = Self::new(secrets, scope, timeout)?;
        client.metadata = OnceCell::new_with(Some(Arc::new(metadata)));
        Ok(client)
    }

    pub fn discovery_url(&self) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            self.secrets.endpoint.trim_end_matches('/')
        )
    }

    /// Provider metadata, fetched on first use. A failed discovery is not
    /// cached, so the next request tries again.
    pub async fn metadata(&self) -> Result<Arc<ProviderMetadata>, GateError> {
        self.metadata
            .get_or_try_init(|| async {
                let url = self.discovery_url();
                tracing::info!(%url, "Fetching OIDC provider metadata");
                let discover = async {
                    let meta: ProviderMetadata = self
                        .http
                        .get(&url)
                        .send()
                        .await?
                        .error_for_status()?
                        .json()
                        .await?;
                    Ok::<_, reqwest::Error>(meta)
                };
                discover.await.map(Arc::new).map_err(|e| {
                    tracing::error!(%url, error = %e, "OIDC discovery failed");
                    GateError::Configuration(format!("OIDC discovery failed: {e}"))
                })
            })
            .await
            .cloned()
    }

    /// Start a login: returns the provider authorization URL and records the
    /// pending redirect URI and nonce in the session.
    pub async fn begin_login(&self, session: &mut SessionState, redirect_uri: &str) -> Result<String, GateError> {
        let meta = self.metadata().await?;
        let nonce = random_token();
        let state = session.csrf_state(false);

        session.nonce = Some(nonce.clone());
        session.login_redirect = Some(redirect_uri.to_string());

        Ok(url_append_query(
            meta.authorization_endpoint.clone(),
            &[
                ("client_id", self.secrets.client_id.clone()),
                ("response_type", "code".to_string()),
                ("scope", self.scope.clone()),
                ("nonce", nonce),
                ("redirect_uri", redirect_uri.to_string()),
                ("state", state),
            ],
        ))
    }

    /// Finish a login from the provider callback.
    ///
    /// Returns `Ok(Some(identity))` and stores it in the session on success,
    /// `Ok(None)` when the provider reports that the user was denied, and an
    /// error for a state mismatch or any provider failure. In every non-success
    /// case the session identity is cleared and the CSRF state rotated.
    pub async fn complete_login(
        &self,
        session: &mut SessionState,
        params: &CallbackParams,
    ) -> Result<Option<Identity>, GateError> {
        let expected = session.csrf_state.clone();
        let pending_redirect = session.login_redirect.take();
        let nonce = session.nonce.take();

        if expected.is_none() || params.state != expected {
            tracing::warn!("Login rejected: callback state does not match session");
            fail_login(session);
            return Err(GateError::StateMismatch);
        }

        if let Some(error) = &params.error {
            tracing::info!(
                %error,
                description = params.error_description.as_deref().unwrap_or(""),
                "Provider denied login"
            );
            fail_login(session);
            return Ok(None);
        }

        match self.fetch_identity(params, pending_redirect, nonce).await {
            Ok(identity) => {
                tracing::info!(subject = %identity.subject, roles = identity.roles.len(), "Login completed");
                session.identity = Some(identity.clone());
                Ok(Some(identity))
            }
            Err(e) => {
                tracing::error!(error = %e, "Login failed");
                fail_login(session);
                Err(e)
            }
        }
    }

    /// Log out locally and return the provider end-session URL, if it has one.
    pub async fn logout(&self, session: &mut SessionState, redirect_uri: &str) -> Option<String> {
        session.identity = None;
        session.csrf_state = None;
        session.nonce = None;

        match self.metadata().await {
            Ok(meta) => meta.end_session_endpoint.clone().map(|endpoint| {
                url_append_query(endpoint, &[("redirect_uri", redirect_uri.to_string())])
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping provider logout");
                None
            }
        }
    }

    async fn fetch_identity(
        &self,
        params: &CallbackParams,
        redirect_uri: Option<String>,
        nonce: Option<String>,
    ) -> Result<Identity, GateError> {
        let code = params
            .code
            .as_deref()
            .ok_or_else(|| GateError::Provider("callback without code".to_string()))?;
        let redirect_uri =
            redirect_uri.ok_or_else(|| GateError::Provider("no pending login in session".to_string()))?;
        let meta = self.metadata().await?;

        let tokens = self.exchange_code(&meta, code, &redirect_uri).await?;

        let id_claims = tokens.id_token.as_deref().map(decode_claims).unwrap_or_default();
        if let Some(token_nonce) = id_claims.get("nonce").and_then(Value::as_str) {
            if nonce.as_deref() != Some(token_nonce) {
                return Err(GateError::InvalidToken("ID token nonce mismatch".to_string()));
            }
        }

        let userinfo = match &meta.userinfo_endpoint {
            Some(endpoint) => Some(self.fetch_userinfo(endpoint, &tokens.access_token).await?),
            None => None,
        };

        // Userinfo must describe the user the ID token was issued for.
        if let (Some(info), Some(subject)) = (&userinfo, id_claims.get("sub").and_then(Value::as_str)) {
            if info.get("sub").and_then(Value::as_str) != Some(subject) {
                return Err(GateError::InvalidToken(
                    "userinfo subject does not match ID token".to_string(),
                ));
            }
        }

        let mut identity = userinfo
            .as_ref()
            .and_then(Identity::from_claims)
            .or_else(|| Identity::from_claims(&id_claims))
            .ok_or_else(|| GateError::Provider("no subject in ID token or userinfo".to_string()))?;
        identity.roles.extend(roles_from_claims(&id_claims));
        Ok(identity)
    }

    async fn exchange_code(
        &self,
        meta: &ProviderMetadata,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, GateError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
        ];
        let response = self.http.post(&meta.token_endpoint).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GateError::Provider(format!("token endpoint returned {status}: {body}")));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| GateError::Provider(format!("unreadable token response: {e}")))
    }

    async fn fetch_userinfo(&self, endpoint: &str, access_token: &str) -> Result<Map<String, Value>, GateError> {
        let response = self.http.get(endpoint).bearer_auth(access_token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GateError::Provider(format!("userinfo endpoint returned {status}")));
        }
        response
            .json::<Map<String, Value>>()
            .await
            .map_err(|e| GateError::Provider(format!("unreadable userinfo response: {e}")))
    }
}

fn fail_login(session: &mut SessionState) {
    session.identity = None;
    session.nonce = None;
    session.login_redirect = None;
    session.csrf_state(true);
}

/// Claims of a compact JWT, read without signature verification. The ID token
/// comes straight from the token endpoint over the authenticated back channel.
/// Anything malformed yields an empty claim set.
pub fn decode_claims(token: &str) -> Map<String, Value> {
    token
        .split('.')
        .nth(1)
        .and_then(|payload| Base64UrlUnpadded::decode_vec(payload.trim_end_matches('=')).ok())
        .and_then(|bytes| serde_json::from_slice::<Map<String, Value>>(&bytes).ok())
        .unwrap_or_default()
}

pub fn url_append_query(mut base: String, params: &[(&str, String)]) -> String {
    let qs = serde_urlencoded::to_string(params).unwrap_or_default();
    if base.contains('?') {
        base.push('&');
    } else {
        base.push('?');
    }
    base.push_str(&qs);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secrets() -> OidcSecrets {
        OidcSecrets {
            endpoint: "https://sso.example.com/realms/main/".into(),
            client_id: "docs".into(),
            client_secret: "secret".into(),
            secret_key: None,
        }
    }

    fn client() -> OidcClient {
        OidcClient::with_metadata(
            secrets(),
            "openid profile email roles",
            Duration::from_secs(5),
            ProviderMetadata {
                issuer: Some("https://sso.example.com/realms/main".into()),
                authorization_endpoint: "https://sso.example.com/auth".into(),
                token_endpoint: "https://sso.example.com/token".into(),
                userinfo_endpoint: None,
                end_session_endpoint: Some("https://sso.example.com/logout".into()),
            },
        )
        .unwrap()
    }

    fn query_param(url: &str, key: &str) -> Option<String> {
        let (_, qs) = url.split_once('?')?;
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(qs).ok()?;
        pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[test]
    fn test_discovery_url_trims_slash() {
        assert_eq!(
            client().discovery_url(),
            "https://sso.example.com/realms/main/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_url_append_query() {
        let url = url_append_query("https://x/auth".into(), &[("a", "1 2".into())]);
        assert_eq!(url, "https://x/auth?a=1+2");
        let url = url_append_query("https://x/auth?kc=1".into(), &[("b", "&".into())]);
        assert_eq!(url, "https://x/auth?kc=1&b=%26");
    }

    #[tokio::test]
    async fn test_begin_login_builds_authorization_url() {
        let mut session = SessionState::default();
        let url = client()
            .begin_login(&mut session, "https://docs.example.com/oidc-callback")
            .await
            .unwrap();

        assert!(url.starts_with("https://sso.example.com/auth?"));
        assert_eq!(query_param(&url, "client_id").as_deref(), Some("docs"));
        assert_eq!(query_param(&url, "response_type").as_deref(), Some("code"));
        assert_eq!(query_param(&url, "scope").as_deref(), Some("openid profile email roles"));
        assert_eq!(
            query_param(&url, "redirect_uri").as_deref(),
            Some("https://docs.example.com/oidc-callback")
        );
        assert_eq!(query_param(&url, "state"), session.csrf_state);
        assert_eq!(query_param(&url, "nonce"), session.nonce);
        assert_eq!(
            session.login_redirect.as_deref(),
            Some("https://docs.example.com/oidc-callback")
        );
    }

    #[tokio::test]
    async fn test_begin_login_reuses_state() {
        let client = client();
        let mut session = SessionState::default();
        let first = client.begin_login(&mut session, "https://d/cb").await.unwrap();
        let second = client.begin_login(&mut session, "https://d/cb").await.unwrap();
        assert_eq!(query_param(&first, "state"), query_param(&second, "state"));
        assert_ne!(query_param(&first, "nonce"), query_param(&second, "nonce"));
    }

    #[tokio::test]
    async fn test_tampered_state_is_rejected() {
        let client = client();
        let mut session = SessionState::default();
        client.begin_login(&mut session, "https://d/cb").await.unwrap();
        let issued = session.csrf_state.clone();

        let params = CallbackParams {
            code: Some("code".into()),
            state: Some("forged".into()),
            ..Default::default()
        };
        let err = client.complete_login(&mut session, &params).await.unwrap_err();
        assert!(matches!(err, GateError::StateMismatch));
        assert!(session.identity.is_none());
        assert!(session.csrf_state.is_some());
        assert_ne!(session.csrf_state, issued, "state rotates after a mismatch");
    }

    #[tokio::test]
    async fn test_callback_without_pending_login() {
        let mut session = SessionState::default();
        let params = CallbackParams {
            code: Some("code".into()),
            state: Some("anything".into()),
            ..Default::default()
        };
        let err = client().complete_login(&mut session, &params).await.unwrap_err();
        assert!(matches!(err, GateError::StateMismatch));
    }

    #[tokio::test]
    async fn test_provider_denial_returns_no_identity() {
        let client = client();
        let mut session = SessionState::default();
        client.begin_login(&mut session, "https://d/cb").await.unwrap();
        let issued = session.csrf_state.clone();

        let params = CallbackParams {
            state: issued.clone(),
            error: Some("access_denied".into()),
            ..Default::default()
        };
        let result = client.complete_login(&mut session, &params).await.unwrap();
        assert!(result.is_none());
        assert!(session.identity.is_none());
        assert_ne!(session.csrf_state, issued);
    }

    #[tokio::test]
    async fn test_logout_clears_session_and_builds_url() {
        let client = client();
        let mut session = SessionState {
            identity: Some(Identity::new("u")),
            request_path: Some("/x".into()),
            ..Default::default()
        };
        session.csrf_state(false);

        let url = client.logout(&mut session, "https://docs.example.com").await.unwrap();
        assert_eq!(url, "https://sso.example.com/logout?redirect_uri=https%3A%2F%2Fdocs.example.com");
        assert!(session.identity.is_none());
        assert!(session.csrf_state.is_none());
        assert_eq!(session.request_path.as_deref(), Some("/x"));
    }

    #[test]
    fn test_decode_claims() {
        let payload = Base64UrlUnpadded::encode_string(
            json!({"sub": "u", "realm_access": {"roles": ["a"]}}).to_string().as_bytes(),
        );
        let claims = decode_claims(&format!("e30.{payload}.sig"));
        assert_eq!(claims["sub"], "u");
        assert_eq!(roles_from_claims(&claims).len(), 1);

        assert!(decode_claims("garbage").is_empty());
        assert!(decode_claims("a.!!!.c").is_empty());
    }
}
