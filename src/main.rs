use anyhow::{Context, Result};
use kafka_oauth_relay::{
    Config, EventProcessor, LogFormat, MessageTransformer, SharedHealthState, init_logging,
    run_with_ctrl_c,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    init_logging(LogFormat::from_env())?;

    let config = Config::from_env().context("Failed to load configuration")?;
    let transformer: Arc<dyn MessageTransformer> =
        Arc::new(EventProcessor::new(config.processor_name.clone()));

    run_with_ctrl_c(config, SharedHealthState::default(), transformer).await
}
