use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::GateError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub site: Site,
    pub auth: Auth,
    pub oidc: Oidc,
    pub edge: Edge,
    pub session: Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Public base URL used for OIDC redirect URIs, e.g. https://docs.example.com.
    /// When unset it is derived from the request `Host` header.
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    /// Directory holding the static site.
    pub root: PathBuf,
    /// Access-control document, relative to `root`. Never served.
    pub access_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// The gateway runs the OIDC authorization-code flow itself.
    #[default]
    Oidc,
    /// A trusted proxy authenticates users and forwards a signed token.
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Debug,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub mode: AuthMode,
    pub environment: Environment,
    /// Reject expired edge tokens.
    pub verify_expiry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Oidc {
    /// Provider root; discovery is read from `<endpoint>/.well-known/openid-configuration`
    pub endpoint: Option<String>,
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    pub scope: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Base URL serving PEM public keys at `<key_endpoint>/<kid>`
    pub key_endpoint: String,
    /// Request header carrying the signed identity token
    pub header: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub max_age_secs: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_base_url: None,
        }
    }
}

impl Default for Site {
    fn default() -> Self {
        Self {
            root: PathBuf::from("site"),
            access_file: "access-control.json".to_string(),
        }
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            mode: AuthMode::Oidc,
            environment: Environment::Debug,
            verify_expiry: true,
        }
    }
}

impl Default for Oidc {
    fn default() -> Self {
        Self {
            endpoint: None,
            client_id: None,
            client_secret: None,
            scope: "openid profile email roles".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for Edge {
    fn default() -> Self {
        Self {
            key_endpoint: "https://public-keys.auth.elb.eu-west-2.amazonaws.com".to_string(),
            header: "x-amzn-oidc-data".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            secret_key: None,
            max_age_secs: 3600,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default("site.root", Site::default().root.to_string_lossy().to_string())
            .into_diagnostic()?
            .set_default("site.access_file", Site::default().access_file)
            .into_diagnostic()?
            .set_default("auth.mode", "oidc")
            .into_diagnostic()?
            .set_default("auth.environment", "debug")
            .into_diagnostic()?
            .set_default("auth.verify_expiry", Auth::default().verify_expiry)
            .into_diagnostic()?
            .set_default("oidc.scope", Oidc::default().scope)
            .into_diagnostic()?
            .set_default("oidc.timeout_secs", Oidc::default().timeout_secs)
            .into_diagnostic()?
            .set_default("edge.key_endpoint", Edge::default().key_endpoint)
            .into_diagnostic()?
            .set_default("edge.header", Edge::default().header)
            .into_diagnostic()?
            .set_default("edge.timeout_secs", Edge::default().timeout_secs)
            .into_diagnostic()?
            .set_default("session.max_age_secs", Session::default().max_age_secs)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: SITEGATE__SERVER__PORT=9090, SITEGATE__OIDC__CLIENT_SECRET=..., etc.
        builder = builder.add_source(config::Environment::with_prefix("SITEGATE").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let mut s: Settings = cfg.try_deserialize().into_diagnostic()?;

        if s.site.root.is_relative() {
            s.site.root = std::env::current_dir().into_diagnostic()?.join(&s.site.root);
        }

        Ok(s)
    }

    /// Base URL for redirects back to this gateway.
    pub fn base_url(&self, host_header: Option<&str>) -> String {
        if let Some(base) = &self.server.public_base_url {
            base.trim_end_matches('/').to_string()
        } else if let Some(host) = host_header {
            format!("http://{host}")
        } else {
            format!("http://{}:{}", self.server.host, self.server.port)
        }
    }

    pub fn access_file_path(&self) -> PathBuf {
        self.site.root.join(&self.site.access_file)
    }

    pub fn is_production(&self) -> bool {
        self.auth.environment == Environment::Production
    }
}

/// Credentials needed to talk to the identity provider and sign sessions.
#[derive(Clone)]
pub struct OidcSecrets {
    pub endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub secret_key: Option<String>,
}

impl std::fmt::Debug for OidcSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcSecrets")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Source of provider credentials. The settings layer (file plus `SITEGATE__`
/// environment overrides) is the built-in implementation; a remote parameter
/// store can be plugged in behind the same trait.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self) -> Result<OidcSecrets, GateError>;
}

impl SecretResolver for Settings {
    fn resolve(&self) -> Result<OidcSecrets, GateError> {
        let missing = |key: &str| GateError::Configuration(format!("oidc.{key} is not set"));
        Ok(OidcSecrets {
            endpoint: self.oidc.endpoint.clone().ok_or_else(|| missing("endpoint"))?,
            client_id: self.oidc.client_id.clone().ok_or_else(|| missing("client_id"))?,
            client_secret: self
                .oidc
                .client_secret
                .clone()
                .ok_or_else(|| missing("client_secret"))?,
            secret_key: self.session.secret_key.clone(),
        })
    }
}
