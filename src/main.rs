//! instant-rag CLI entry point

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    // values from .env become ordinary environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = instant_rag::cli::Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(instant_rag::cli::run(cli))
}
