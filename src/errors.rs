use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(sitegate::io))]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    #[diagnostic(code(sitegate::http))]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(sitegate::configuration),
        help("Check the oidc.* and session.* settings or their SITEGATE__ environment overrides")
    )]
    Configuration(String),

    #[error("Login state mismatch")]
    #[diagnostic(code(sitegate::state_mismatch))]
    StateMismatch,

    #[error("Invalid identity token: {0}")]
    #[diagnostic(code(sitegate::invalid_token))]
    InvalidToken(String),

    #[error("Identity provider error: {0}")]
    #[diagnostic(code(sitegate::provider))]
    Provider(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(sitegate::not_found))]
    NotFound(String),

    #[error("{0}")]
    #[diagnostic(code(sitegate::other))]
    Other(String),
}
