use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub alpaca: AlpacaConfig,
    pub portfolio: PortfolioConfig,
    pub model: ModelConfig,
    pub allocation: AllocationConfig,
    pub execution: ExecutionConfig,
    pub runner: RunnerConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaConfig {
    pub trading_base_url: String,
    pub data_base_url: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioConfig {
    /// Asset universe: symbol to initial USD allocation. Symbols trade in
    /// the order given by the map (sorted, so cycles are reproducible).
    pub assets: BTreeMap<String, f64>,
    pub bar_interval: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Largest VAR lag order considered during selection.
    pub max_lag: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AllocationConfig {
    /// Shrinkage strength applied to the diagonal covariance.
    pub lambda_reg: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ExecutionConfig {
    /// Fraction shaved off buy-side deltas to avoid overdrawing cash.
    pub margin_buffer: f64,
    pub qty_decimals: u32,
    pub max_balance_retries: usize,
    pub failure_limit: usize,
    pub failure_window_minutes: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RunnerConfig {
    pub poll_interval_secs: u64,
    /// A most-recent broker order older than this forces a rebalance at
    /// startup regardless of data freshness.
    pub stale_order_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: String,
    pub backfill_start: chrono::NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Parse a bar interval string (e.g. "1m", "1h", "1d") into milliseconds.
pub fn parse_interval_ms(s: &str) -> Result<u64> {
    if s.len() < 2 {
        bail!("invalid interval '{}': expected format like '1h'", s);
    }

    let (num_str, suffix) = s.split_at(s.len() - 1);
    let n: u64 = num_str.parse().with_context(|| {
        format!(
            "invalid interval '{}': quantity must be a positive integer",
            s
        )
    })?;
    if n == 0 {
        bail!("invalid interval '{}': quantity must be > 0", s);
    }

    let unit_ms = match suffix {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => bail!(
            "invalid interval '{}': unsupported suffix '{}', expected one of m/h/d",
            s,
            suffix
        ),
    };

    n.checked_mul(unit_ms)
        .with_context(|| format!("invalid interval '{}': value is too large", s))
}

impl PortfolioConfig {
    pub fn symbols(&self) -> Vec<String> {
        self.assets.keys().cloned().collect()
    }

    pub fn bar_interval_ms(&self) -> Result<u64> {
        parse_interval_ms(&self.bar_interval)
    }

    pub fn bar_period(&self) -> Result<chrono::Duration> {
        Ok(chrono::Duration::milliseconds(self.bar_interval_ms()? as i64))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = Path::new("config/default.toml");
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;

        let mut config: Config =
            toml::from_str(&config_str).context("failed to parse config/default.toml")?;

        config.alpaca.api_key = std::env::var("ALPACA_API_KEY")
            .context("ALPACA_API_KEY not set in .env or environment")?;
        config.alpaca.api_secret = std::env::var("ALPACA_API_SECRET")
            .context("ALPACA_API_SECRET not set in .env or environment")?;

        if config.portfolio.assets.is_empty() {
            bail!("portfolio.assets must name at least one symbol");
        }
        config
            .portfolio
            .bar_interval_ms()
            .context("portfolio.bar_interval is invalid")?;

        Ok(config)
    }
}
