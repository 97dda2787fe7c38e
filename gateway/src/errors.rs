use crate::auth::keys::KeyError;
use crate::auth::oidc::OidcError;
use crate::cache::CacheError;
use crate::transform::RuleError;
use shared::http::TlsError;

/// Result type alias for gateway startup operations
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Errors that abort the gateway before or while serving
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not load signing key: {0}")]
    Key(#[from] KeyError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("could not reach cache servers: {0}")]
    Cache(#[from] CacheError),

    #[error("OIDC setup failed: {0}")]
    Oidc(#[from] OidcError),

    #[error("invalid allow-list: {0}")]
    AllowList(#[from] RuleError),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("metrics recorder setup failed: {0}")]
    Metrics(String),

    #[error("{0} listener exited")]
    ListenerExited(&'static str),
}
