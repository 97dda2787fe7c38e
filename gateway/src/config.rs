use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Receive federated metric push events.
///
/// The gateway authenticates pushes, performs local filtering and sanity
/// checking, and forwards accepted batches via remote write to another
/// endpoint.
#[derive(Debug, Parser)]
#[command(name = "metrics-gateway")]
pub struct Options {
    /// A host:port to listen on for upload traffic.
    #[arg(long, default_value = "0.0.0.0:9003")]
    pub listen: String,

    /// A host:port to listen on for health and metrics.
    #[arg(long, default_value = "localhost:9004")]
    pub listen_internal: String,

    /// Path to a certificate to serve TLS for external traffic.
    #[arg(long)]
    pub tls_crt: Option<PathBuf>,

    /// Path to a private key to serve TLS for external traffic.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Path to a certificate to serve TLS for internal traffic.
    #[arg(long)]
    pub internal_tls_crt: Option<PathBuf>,

    /// Path to a private key to serve TLS for internal traffic.
    #[arg(long)]
    pub internal_tls_key: Option<PathBuf>,

    /// The path to a private key file that will be used to sign client tokens.
    #[arg(long)]
    pub shared_key: Option<PathBuf>,

    /// The expiration of auth tokens in seconds.
    #[arg(long, default_value_t = 24 * 60 * 60)]
    pub token_expire_seconds: u64,

    /// A URL against which to authorize client requests.
    #[arg(long)]
    pub authorize: Option<String>,

    /// The OIDC issuer URL used to obtain client-credentials tokens for
    /// upstream calls.
    #[arg(long)]
    pub oidc_issuer: Option<String>,

    /// The OIDC client ID.
    #[arg(long)]
    pub client_id: Option<String>,

    /// The OIDC client secret.
    #[arg(long)]
    pub client_secret: Option<String>,

    /// The JSON key in the bearer token whose value to use as the tenant ID.
    #[arg(long, default_value = "cluster_id")]
    pub tenant_key: String,

    /// One or more memcached server addresses.
    #[arg(long = "memcached")]
    pub memcacheds: Vec<String>,

    /// Time after which keys stored in memcached should expire, in seconds.
    #[arg(long, default_value_t = 24 * 60 * 60)]
    pub memcached_expire: u64,

    /// The interval at which to re-resolve memcached DNS, in seconds; 0 disables.
    #[arg(long, default_value_t = 10)]
    pub memcached_interval: u64,

    /// The label to separate incoming data on. Callers must include it on
    /// every series.
    #[arg(long, default_value = "_id")]
    pub partition_label: String,

    /// Labels to add to each outgoing metric, in key=value form.
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Labels that must be present on each incoming metric, in key=value form.
    #[arg(long = "required-label")]
    pub required_labels: Vec<String>,

    /// Allowed rules for incoming metrics. A series matching none of the
    /// rules is dropped.
    #[arg(long = "whitelist")]
    pub whitelist: Vec<String>,

    /// A file of allowed rules for incoming metrics, one rule per line.
    #[arg(long)]
    pub whitelist_file: Option<PathBuf>,

    /// Labels to be elided from outgoing metrics.
    #[arg(long = "elide-label")]
    pub elide_labels: Vec<String>,

    /// The maximum acceptable size of a request made to the upload endpoint.
    #[arg(long, default_value_t = 500 * 1024)]
    pub limit_bytes: u64,

    /// The rate limit of metric uploads per cluster. Uploads happening more
    /// often than this limit will be rejected.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "4m 30s")]
    pub ratelimit: Duration,

    /// All accepted metric batches are written to this URL.
    #[arg(long)]
    pub forward_url: String,

    /// Log filtering level, e.g. info, debug, warn, error.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("--{flag} must be of the form key=value: {value}")]
    MalformedLabelPair { flag: &'static str, value: String },

    #[error("both --tls-key and --tls-crt must be provided")]
    PartialTls,

    #[error("both --internal-tls-key and --internal-tls-crt must be provided")]
    PartialInternalTls,

    #[error("--oidc-issuer, --client-id and --client-secret must be provided together")]
    PartialOidc,

    #[error("--{flag} must be a valid URL: {source}")]
    InvalidUrl {
        flag: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("unable to read --whitelist-file: {0}")]
    WhitelistFile(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TlsPair {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Validated runtime configuration, derived from [`Options`].
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub listen_internal: String,
    pub external_tls: Option<TlsPair>,
    pub internal_tls: Option<TlsPair>,
    pub shared_key: Option<PathBuf>,
    pub token_lifetime: Duration,
    pub authorize_url: Option<Url>,
    pub oidc: Option<OidcConfig>,
    pub tenant_key: String,
    pub memcacheds: Vec<String>,
    pub memcached_ttl: Duration,
    pub memcached_interval: Duration,
    pub partition_label: String,
    pub labels: BTreeMap<String, String>,
    pub required_labels: BTreeMap<String, String>,
    pub whitelist: Vec<String>,
    pub elide_labels: Vec<String>,
    pub limit_bytes: u64,
    pub ratelimit: Duration,
    pub forward_url: Url,
}

impl Config {
    pub fn from_options(opts: Options) -> Result<Self, ConfigError> {
        let labels = parse_label_pairs("label", &opts.labels)?;
        let required_labels = parse_label_pairs("required-label", &opts.required_labels)?;

        let external_tls =
            tls_pair(opts.tls_crt, opts.tls_key).map_err(|_| ConfigError::PartialTls)?;
        let internal_tls = tls_pair(opts.internal_tls_crt, opts.internal_tls_key)
            .map_err(|_| ConfigError::PartialInternalTls)?;

        let oidc = match (opts.oidc_issuer, opts.client_id, opts.client_secret) {
            (None, None, None) => None,
            (Some(issuer), Some(client_id), Some(client_secret)) => Some(OidcConfig {
                issuer,
                client_id,
                client_secret,
            }),
            _ => return Err(ConfigError::PartialOidc),
        };

        let authorize_url = opts
            .authorize
            .filter(|url| !url.is_empty())
            .map(|url| Url::parse(&url))
            .transpose()
            .map_err(|source| ConfigError::InvalidUrl {
                flag: "authorize",
                source,
            })?;

        let forward_url =
            Url::parse(&opts.forward_url).map_err(|source| ConfigError::InvalidUrl {
                flag: "forward-url",
                source,
            })?;

        let mut whitelist = opts.whitelist;
        if let Some(path) = &opts.whitelist_file {
            let data = std::fs::read_to_string(path)?;
            whitelist.extend(data.lines().map(str::to_string));
        }
        let whitelist = whitelist
            .iter()
            .map(|rule| rule.trim())
            .filter(|rule| !rule.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Config {
            listen: opts.listen,
            listen_internal: opts.listen_internal,
            external_tls,
            internal_tls,
            shared_key: opts.shared_key,
            token_lifetime: Duration::from_secs(opts.token_expire_seconds),
            authorize_url,
            oidc,
            tenant_key: opts.tenant_key,
            memcacheds: opts.memcacheds,
            memcached_ttl: Duration::from_secs(opts.memcached_expire),
            memcached_interval: Duration::from_secs(opts.memcached_interval),
            partition_label: opts.partition_label,
            labels,
            required_labels,
            whitelist,
            elide_labels: opts.elide_labels,
            limit_bytes: opts.limit_bytes,
            ratelimit: opts.ratelimit,
            forward_url,
        })
    }
}

fn parse_label_pairs(
    flag: &'static str,
    pairs: &[String],
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut parsed = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                parsed.insert(name.to_string(), value.to_string());
            }
            _ => {
                return Err(ConfigError::MalformedLabelPair {
                    flag,
                    value: pair.clone(),
                });
            }
        }
    }
    Ok(parsed)
}

fn tls_pair(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<Option<TlsPair>, ()> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some(TlsPair { cert, key })),
        _ => Err(()),
    }
}
