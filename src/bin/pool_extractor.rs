use eyre::Result;
use pool_extractor::data_sync::{ExtractorBuilder, ExtractorConfig, LogSubscription};
use pool_extractor::utils::config_loader::ExtractorConfigLoader;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs the extractor against the configured node until Ctrl-C.
///
/// Usage: `pool-extractor [config.toml]`. Without a file the config comes from the environment.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_line_number(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ExtractorConfig::load_section_from_file(path).await?.with_env()?,
        None => ExtractorConfig::from_env()?,
    };
    info!("Starting pool extractor for chain {}", config.chain_id);

    let extractor = ExtractorBuilder::new().with_config(config.clone()).build()?;

    let subscription = LogSubscription::new(
        config.rpc_wss_url.clone(),
        extractor.event_topics(),
        config.ws_connection_timeout(),
        config.max_reconnect_attempts,
        config.reconnect_delay(),
    );
    let (events, shutdown) = subscription.subscribe(config.channel_buffer_size).await?;

    extractor.start(&config.prefetch_tokens, events).await?;
    info!("Extractor running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown.send(()).await;
    extractor.stop().await;

    for (token, count) in extractor.get_tokens_pools_quantity().into_iter().take(10) {
        info!("{} {} {}", token.get_symbol(), token.get_address(), count);
    }
    Ok(())
}
