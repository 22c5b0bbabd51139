//! One-shot historical backfill: pulls hourly bars month by month from the
//! configured start date into the bar store, then exits. Run this before the
//! first live deployment so the model has enough lookback.

use anyhow::{Context, Result};

use quant_rebalancer::alpaca::AlpacaRestClient;
use quant_rebalancer::config::Config;
use quant_rebalancer::store::BarStore;
use quant_rebalancer::updater::Updater;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let symbols = config.portfolio.symbols();
    let client = AlpacaRestClient::new(
        &config.alpaca.trading_base_url,
        &config.alpaca.data_base_url,
        &config.alpaca.api_key,
        &config.alpaca.api_secret,
        &config.portfolio.bar_interval,
    )?;
    let store = BarStore::open(&config.store.path)
        .with_context(|| format!("failed to open bar store at {}", config.store.path))?;
    let mut updater = Updater::new(client, store, symbols.clone());

    tracing::info!(
        symbols = ?symbols,
        from = %config.store.backfill_start,
        "Starting backfill"
    );
    let total = updater.backfill(config.store.backfill_start).await?;
    tracing::info!(total, "Backfill complete");
    Ok(())
}
