use sitegate::identity::Identity;
use sitegate::session::{SessionCookie, SessionState, SESSION_COOKIE_NAME};
use sitegate::settings::Settings;
use sitegate::web::AppState;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Docs</title></head>
<body><nav><a href="/">Home</a></nav><main class="content"><h1>Welcome</h1></main><footer>docs</footer></body></html>
"#;

/// Static site in a temporary directory.
pub struct TestSite {
    dir: TempDir,
}

impl TestSite {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(dir.path().join("index.html"), INDEX_HTML).expect("Failed to write index");
        Self { dir }
    }

    pub fn with_page(self, path: &str, body: &str) -> Self {
        self.with_bytes(path, body.as_bytes())
    }

    /// A page whose `<main>` holds `text`, with the standard navigation.
    pub fn with_content_page(self, path: &str, text: &str) -> Self {
        let html = format!(
            r#"<html><body><nav><a href="/">Home</a></nav><main><p>{text}</p></main></body></html>"#
        );
        self.with_page(path, &html)
    }

    pub fn with_bytes(self, path: &str, body: &[u8]) -> Self {
        let target = self.dir.path().join(path.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).expect("Failed to create site directory");
        }
        fs::write(target, body).expect("Failed to write site file");
        self
    }

    pub fn with_policy(self, json: &str) -> Self {
        self.with_page("/access-control.json", json)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.site.root = self.dir.path().to_path_buf();
        settings.session.secret_key = Some("test-secret-key".to_string());
        settings
    }

    pub fn state(&self) -> AppState {
        AppState::from_settings(self.settings()).expect("Failed to build state")
    }
}

/// Builder for sessions placed straight into the store.
pub struct SessionBuilder {
    state: SessionState,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            state: SessionState::default(),
        }
    }

    pub fn user(subject: &str, roles: &[&str]) -> Self {
        Self::new().with_identity(Identity::new(subject).with_roles(roles.iter().copied()))
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.state.identity = Some(identity);
        self
    }

    /// Store the session and return the `Cookie` header value for it.
    pub fn create(self, app_state: &AppState) -> (String, String) {
        let id = app_state.sessions.create(self.state);
        let cookie = format!(
            "{}={}",
            SESSION_COOKIE_NAME,
            SessionCookie::new(id.clone()).value(&app_state.secret_key)
        );
        (id, cookie)
    }
}
