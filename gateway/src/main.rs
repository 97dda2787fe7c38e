use clap::Parser;
use gateway::config::{Config, Options};
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    let options = Options::parse();
    init_tracing(&options.log_level);

    let config = match Config::from_options(options) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(error = %error, "invalid configuration");
            process::exit(1);
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!(error = %error, "failed to create runtime");
            process::exit(1);
        }
    };

    if let Err(error) = rt.block_on(gateway::run(config)) {
        tracing::error!(error = %error, "gateway exited");
        process::exit(1);
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}
