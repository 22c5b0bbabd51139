use anyhow::{Context, Result};
use chrono::Duration;

use quant_rebalancer::alpaca::AlpacaRestClient;
use quant_rebalancer::allocate::Allocator;
use quant_rebalancer::config::Config;
use quant_rebalancer::control::ControlLoop;
use quant_rebalancer::execution::ExecutionEngine;
use quant_rebalancer::store::BarStore;
use quant_rebalancer::updater::Updater;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Make sure .env file exists with ALPACA_API_KEY and ALPACA_API_SECRET");
            std::process::exit(1);
        }
    };

    // Log to a file so stdout stays clean for portfolio snapshots.
    let log_file = std::fs::File::create("quant-rebalancer.log")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                config
                    .logging
                    .level
                    .parse()
                    .unwrap_or_else(|_| "info".parse().unwrap())
            }),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    let symbols = config.portfolio.symbols();
    tracing::info!(
        symbols = ?symbols,
        trading_url = %config.alpaca.trading_base_url,
        data_url = %config.alpaca.data_base_url,
        "Starting quant-rebalancer"
    );

    let client = AlpacaRestClient::new(
        &config.alpaca.trading_base_url,
        &config.alpaca.data_base_url,
        &config.alpaca.api_key,
        &config.alpaca.api_secret,
        &config.portfolio.bar_interval,
    )?;

    let store = BarStore::open(&config.store.path)
        .with_context(|| format!("failed to open bar store at {}", config.store.path))?;
    let updater = Updater::new(client.clone(), store, symbols.clone());
    let engine = ExecutionEngine::new(client, symbols, &config.execution);
    let allocator = Allocator::new(config.allocation.lambda_reg);

    let bar_period: Duration = config.portfolio.bar_period()?;
    let mut control = ControlLoop::new(
        updater,
        engine,
        allocator,
        &config.model,
        &config.runner,
        bar_period,
    );
    control.run().await
}
