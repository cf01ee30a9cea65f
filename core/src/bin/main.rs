//! CLI entrypoint: parse args, init logging, start the broker, and wait
//! for a shutdown signal.

use clap::Parser;
use mist_core::{Args, Mist};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut mist = match Mist::new(&args).await {
        Ok(mist) => mist,
        Err(e) => {
            tracing::error!(error = %e, "failed to assemble mist core");
            std::process::exit(1);
        }
    };

    if let Err(e) = mist.start().await {
        tracing::error!(error = %e, "failed to start listeners");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
    }

    tracing::info!("shutdown requested");
    if let Err(e) = mist.shutdown().await {
        tracing::error!(error = %e, "error during shutdown");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();
}
