pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod forward;
pub mod metrics_defs;
pub mod prompb;
pub mod ratelimit;
pub mod server;
pub mod transform;

use crate::auth::keys::SigningKeys;
use crate::auth::oidc::OidcTokenSource;
use crate::auth::tokens::{TokenSigner, TokenVerifier};
use crate::auth::upstream::{UpstreamAuthorizer, default_client};
use crate::auth::{ClusterAuthorizer, StubAuthorizer};
use crate::cache::CachedAuthorizer;
use crate::cache::memcached::MemcachedCache;
use crate::config::Config;
use crate::errors::GatewayError;
use crate::forward::Forwarder;
use crate::ratelimit::RateLimiter;
use crate::server::{AppState, ExternalService, InternalService};
use crate::transform::{AddLabels, AllowList, Elide, MultiTransformer};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

struct Services {
    external: ExternalService,
    external_tls: Option<TlsAcceptor>,
    internal: InternalService,
    internal_tls: Option<TlsAcceptor>,
}

/// Builds everything and serves. All fallible setup happens before either
/// listener binds.
pub async fn run(config: Config) -> errors::Result<()> {
    let services = build_services(&config).await?;

    let external_listener = TcpListener::bind(&config.listen).await?;
    let internal_listener = TcpListener::bind(&config.listen_internal).await?;
    tracing::info!(
        listen = %config.listen,
        listen_internal = %config.listen_internal,
        "starting metrics gateway"
    );
    serve(services, external_listener, internal_listener).await
}

/// Serves on listeners the caller already bound.
pub async fn run_with_listeners(
    config: Config,
    external_listener: TcpListener,
    internal_listener: TcpListener,
) -> errors::Result<()> {
    let services = build_services(&config).await?;
    serve(services, external_listener, internal_listener).await
}

async fn build_services(config: &Config) -> errors::Result<Services> {
    let prometheus = install_prometheus()?;
    metrics_defs::describe_all();

    let signing_keys = match &config.shared_key {
        Some(path) => SigningKeys::load(&std::fs::read(path)?)?,
        None => {
            tracing::warn!(
                "no --shared-key provided; using a generated signing key, \
                 all outstanding tokens become invalid when this process restarts"
            );
            SigningKeys::generate()?
        }
    };
    let signer = TokenSigner::new(&signing_keys, config.token_lifetime);
    let verifier = TokenVerifier::new(&signing_keys);

    let client = default_client()?;
    let oidc = match &config.oidc {
        Some(oidc) => Some(Arc::new(
            OidcTokenSource::discover(
                client.clone(),
                &oidc.issuer,
                oidc.client_id.clone(),
                oidc.client_secret.clone(),
            )
            .await?,
        )),
        None => None,
    };

    let mut authorizer: Arc<dyn ClusterAuthorizer> = match &config.authorize_url {
        Some(url) => Arc::new(UpstreamAuthorizer::new(url.clone(), client, oidc)),
        None => {
            tracing::warn!("no --authorize endpoint configured; accepting every cluster");
            Arc::new(StubAuthorizer)
        }
    };
    if !config.memcacheds.is_empty() {
        let memcached =
            MemcachedCache::connect(config.memcacheds.clone(), config.memcached_interval).await?;
        authorizer = Arc::new(CachedAuthorizer::new(
            Arc::new(memcached),
            authorizer,
            config.memcached_ttl,
        ));
    }

    let mut transforms = MultiTransformer::default();
    if !config.whitelist.is_empty() {
        transforms = transforms.with(Arc::new(AllowList::new(&config.whitelist)?));
    }
    if !config.labels.is_empty() {
        transforms = transforms.with(Arc::new(AddLabels::new(config.labels.clone())));
    }
    if !config.elide_labels.is_empty() {
        transforms = transforms.with(Arc::new(Elide::new(config.elide_labels.iter().cloned())));
    }

    let state = Arc::new(AppState {
        signer,
        verifier,
        authorizer,
        transforms,
        rate_limiter: RateLimiter::new(config.ratelimit),
        forwarder: Forwarder::new(config.forward_url.clone())?,
        partition_label: config.partition_label.clone(),
        required_labels: config.required_labels.clone(),
        tenant_key: config.tenant_key.clone(),
        limit_bytes: config.limit_bytes,
    });

    let external_tls = config
        .external_tls
        .as_ref()
        .map(|pair| shared::http::load_tls_acceptor(&pair.cert, &pair.key))
        .transpose()?;
    let internal_tls = config
        .internal_tls
        .as_ref()
        .map(|pair| shared::http::load_tls_acceptor(&pair.cert, &pair.key))
        .transpose()?;

    Ok(Services {
        external: ExternalService::new(state),
        external_tls,
        internal: InternalService::new(prometheus),
        internal_tls,
    })
}

/// The two listeners live and die together: when either exits, the other is
/// stopped and this returns.
async fn serve(
    services: Services,
    external_listener: TcpListener,
    internal_listener: TcpListener,
) -> errors::Result<()> {
    let mut external_task = tokio::spawn(shared::http::run_http_service(
        external_listener,
        services.external_tls,
        services.external,
    ));
    let mut internal_task = tokio::spawn(shared::http::run_http_service(
        internal_listener,
        services.internal_tls,
        services.internal,
    ));

    let (name, result) = tokio::select! {
        result = &mut external_task => {
            internal_task.abort();
            ("external", result)
        }
        result = &mut internal_task => {
            external_task.abort();
            ("internal", result)
        }
    };

    match result {
        Ok(Ok(())) => Err(GatewayError::ListenerExited(name)),
        Ok(Err(error)) => {
            tracing::error!(listener = name, error = %error, "listener failed");
            Err(GatewayError::Io(error))
        }
        Err(join_error) => {
            tracing::error!(listener = name, error = %join_error, "listener task failed");
            Err(GatewayError::ListenerExited(name))
        }
    }
}

/// The recorder is process-global; integration tests start several gateways
/// in one process and share it.
fn install_prometheus() -> errors::Result<PrometheusHandle> {
    static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

    let mut guard = HANDLE.lock();
    if let Some(handle) = guard.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GatewayError::Metrics(e.to_string()))?;
    *guard = Some(handle.clone());
    Ok(handle)
}
