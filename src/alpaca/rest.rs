use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;

use crate::broker::{
    Broker, BrokerAccount, BrokerOrder, BrokerPosition, MarketData, OrderRequest,
    OrderStatusFilter,
};
use crate::error::BrokerError;
use crate::model::bar::Bar;

const BARS_PAGE_LIMIT: usize = 10_000;

/// REST client for Alpaca's crypto trading and market-data APIs.
///
/// Credentials ride in default headers so every request is authenticated
/// without threading them through call sites. Cloning is cheap: the inner
/// `reqwest::Client` is reference-counted.
#[derive(Clone)]
pub struct AlpacaRestClient {
    http: reqwest::Client,
    trading_base_url: String,
    data_base_url: String,
    timeframe: &'static str,
}

#[derive(Debug, Deserialize)]
struct AlpacaPositionResponse {
    symbol: String,
    qty: String,
    #[serde(default)]
    current_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaAccountResponse {
    equity: String,
    cash: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrderResponse {
    id: String,
    symbol: String,
    status: String,
    created_at: String,
}

impl AlpacaRestClient {
    pub fn new(
        trading_base_url: &str,
        data_base_url: &str,
        api_key: &str,
        api_secret: &str,
        bar_interval: &str,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("APCA-API-KEY-ID", HeaderValue::from_str(api_key)?);
        headers.insert("APCA-API-SECRET-KEY", HeaderValue::from_str(api_secret)?);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build Alpaca HTTP client")?;
        Ok(Self {
            http,
            trading_base_url: trading_base_url.trim_end_matches('/').to_string(),
            data_base_url: data_base_url.trim_end_matches('/').to_string(),
            timeframe: map_timeframe(bar_interval),
        })
    }

    fn compact_error_body(body: &str) -> String {
        let normalized = body.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.len() > 180 {
            format!("{}...", &normalized[..180])
        } else {
            normalized
        }
    }
}

impl Broker for AlpacaRestClient {
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/v2/positions", self.trading_base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!(
                "list positions failed: {}",
                Self::compact_error_body(&body)
            )));
        }
        let raw: Vec<AlpacaPositionResponse> = response.json().await?;
        let mut positions = Vec::with_capacity(raw.len());
        for pos in raw {
            let price = match &pos.current_price {
                Some(p) => parse_f64(p, "current_price")?,
                None => 0.0,
            };
            positions.push(BrokerPosition {
                symbol: normalize_symbol(&pos.symbol),
                qty: parse_f64(&pos.qty, "qty")?,
                current_price: price,
            });
        }
        Ok(positions)
    }

    async fn get_account(&self) -> Result<BrokerAccount, BrokerError> {
        let url = format!("{}/v2/account", self.trading_base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!(
                "get account failed: {}",
                Self::compact_error_body(&body)
            )));
        }
        let raw: AlpacaAccountResponse = response.json().await?;
        Ok(BrokerAccount {
            equity: parse_f64(&raw.equity, "equity")?,
            cash: parse_f64(&raw.cash, "cash")?,
        })
    }

    async fn list_orders(
        &self,
        filter: OrderStatusFilter,
        limit: usize,
    ) -> Result<Vec<BrokerOrder>, BrokerError> {
        let url = format!("{}/v2/orders", self.trading_base_url);
        let limit_s = limit.to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("status", filter.as_query_str()),
                ("limit", limit_s.as_str()),
                ("direction", "desc"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!(
                "list orders failed: {}",
                Self::compact_error_body(&body)
            )));
        }
        let raw: Vec<AlpacaOrderResponse> = response.json().await?;
        let mut orders = Vec::with_capacity(raw.len());
        for order in raw {
            orders.push(BrokerOrder {
                id: order.id,
                symbol: normalize_symbol(&order.symbol),
                status: order.status,
                created_at: parse_rfc3339_utc(&order.created_at)?,
            });
        }
        Ok(orders)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.trading_base_url, order_id);
        let response = self.http.delete(&url).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!(
                "cancel order {} failed: {}",
                order_id,
                Self::compact_error_body(&body)
            )));
        }
        Ok(())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError> {
        let url = format!("{}/v2/orders", self.trading_base_url);
        let body = serde_json::json!({
            "symbol": request.symbol,
            "side": request.side.as_alpaca_str(),
            "type": "market",
            "time_in_force": "gtc",
            "qty": format!("{}", request.qty),
            "client_order_id": request.client_order_id,
        });
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_rejection(&text));
        }
        let order: AlpacaOrderResponse = response.json().await?;
        Ok(BrokerOrder {
            id: order.id,
            symbol: normalize_symbol(&order.symbol),
            status: order.status,
            created_at: parse_rfc3339_utc(&order.created_at)?,
        })
    }

    async fn latest_trade_price(&self, symbol: &str) -> Result<Option<f64>, BrokerError> {
        let url = format!(
            "{}/v1beta3/crypto/us/latest/trades",
            self.data_base_url
        );
        let response = self
            .http
            .get(&url)
            .query(&[("symbols", symbol)])
            .send()
            .await?;
        if !response.status().is_success() {
            // Permission or symbol mismatches show up here; the caller
            // treats a missing price as a transient failure, not a crash.
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = %status,
                symbol,
                detail = %Self::compact_error_body(&body),
                "latest trade returned non-success"
            );
            return Ok(None);
        }
        let root: Value = response.json().await?;
        let price = root
            .get("trades")
            .and_then(|t| t.get(symbol))
            .and_then(|t| t.get("p"))
            .and_then(Value::as_f64);
        match price {
            Some(p) if p > 0.0 => Ok(Some(p)),
            _ => Ok(None),
        }
    }
}

impl MarketData for AlpacaRestClient {
    async fn get_bars(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, BrokerError> {
        let url = format!("{}/v1beta3/crypto/us/bars", self.data_base_url);
        let joined = symbols.join(",");
        let limit_s = BARS_PAGE_LIMIT.to_string();
        let start_s = start.format("%Y-%m-%d").to_string();
        let end_s = end.format("%Y-%m-%d").to_string();

        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.http.get(&url).query(&[
                ("symbols", joined.as_str()),
                ("timeframe", self.timeframe),
                ("start", start_s.as_str()),
                ("end", end_s.as_str()),
                ("limit", limit_s.as_str()),
                ("sort", "asc"),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("page_token", token.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(BrokerError::Api(format!(
                    "get bars failed: {}",
                    Self::compact_error_body(&body)
                )));
            }
            let root: Value = response.json().await?;

            if let Some(by_symbol) = root.get("bars").and_then(Value::as_object) {
                for (symbol, entries) in by_symbol {
                    let Some(entries) = entries.as_array() else {
                        continue;
                    };
                    for entry in entries {
                        bars.push(parse_bar(symbol, entry)?);
                    }
                }
            }

            page_token = root
                .get("next_page_token")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            if page_token.is_none() {
                break;
            }
        }

        bars.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        Ok(bars)
    }
}

fn parse_bar(symbol: &str, entry: &Value) -> Result<Bar, BrokerError> {
    let ts = entry
        .get("t")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Api(format!("bar for {} missing timestamp", symbol)))?;
    let timestamp = parse_rfc3339_utc(ts)?.naive_utc();
    let open = entry.get("o").and_then(Value::as_f64).unwrap_or(0.0);
    Ok(Bar {
        timestamp,
        symbol: normalize_symbol(symbol),
        open,
        high: entry.get("h").and_then(Value::as_f64).unwrap_or(open),
        low: entry.get("l").and_then(Value::as_f64).unwrap_or(open),
        close: entry.get("c").and_then(Value::as_f64).unwrap_or(open),
        volume: entry.get("v").and_then(Value::as_f64).unwrap_or(0.0),
        trade_count: entry.get("n").and_then(Value::as_u64).unwrap_or(0),
        vwap: entry.get("vw").and_then(Value::as_f64).unwrap_or(open),
    })
}

/// Alpaca's trading endpoints report crypto positions without the slash
/// ("BTCUSD") while the data endpoints key everything by pair ("BTC/USD").
/// Everything internal uses the slashed form.
fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_ascii_uppercase();
    if upper.contains('/') {
        return upper;
    }
    if upper.len() > 3 && upper.ends_with("USD") {
        let split = upper.len() - 3;
        return format!("{}/{}", &upper[..split], &upper[split..]);
    }
    upper
}

/// Map an order-rejection body onto the structured error variants the
/// execution engine retries on. Anything unrecognized stays a plain API
/// error and propagates.
fn classify_rejection(body: &str) -> BrokerError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| body.to_string());
    let lowered = message.to_ascii_lowercase();

    if lowered.contains("insufficient balance") {
        if let (Some(requested), Some(available)) = (
            parse_labeled_number(&lowered, "requested:"),
            parse_labeled_number(&lowered, "available:"),
        ) {
            return BrokerError::InsufficientBalance {
                requested,
                available,
            };
        }
    }
    if lowered.contains("minimal amount of order") || lowered.contains("minimum order") {
        return BrokerError::MinimumOrderSize;
    }
    BrokerError::Api(message)
}

/// Pull the number that follows `label` out of a rejection message, e.g.
/// "requested: 120.5" yields 120.5.
fn parse_labeled_number(message: &str, label: &str) -> Option<f64> {
    let rest = &message[message.find(label)? + label.len()..];
    let rest = rest.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(rest.len());
    rest[..end].parse::<f64>().ok()
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, BrokerError> {
    raw.parse::<f64>()
        .map_err(|_| BrokerError::Api(format!("unparseable {} '{}'", field, raw)))
}

fn parse_rfc3339_utc(raw: &str) -> Result<DateTime<Utc>, BrokerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| BrokerError::Api(format!("invalid timestamp '{}'", raw)))
}

fn map_timeframe(interval: &str) -> &'static str {
    match interval {
        "1m" => "1Min",
        "1h" => "1Hour",
        "1d" => "1Day",
        _ => "1Hour",
    }
}
