//! Banker server binary

use banker_core::{Banker, Config};
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting banker server");

    // Load configuration
    let config = Config::from_env()?;

    // Open the banker
    let banker = Banker::open(config).await?;
    tracing::info!("Banker opened successfully");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down banker server");
    banker.shutdown().await?;
    Ok(())
}
