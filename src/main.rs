//! update-all - unified update orchestrator.
//!
//! Runs heterogeneous package-manager plugins through a bounded-concurrency
//! scheduler, recording every run to a local history store.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use update_all::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let default_filter = if cli::is_verbose() {
        "update_all=info"
    } else {
        "update_all=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let exit_code = cli::run().await?;
    std::process::exit(exit_code);
}
