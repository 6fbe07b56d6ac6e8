//! Gate.io APIv4 integration.
//!
//! USDT-settled perpetual futures plus unified-account spot trading.
//! Public market data needs no auth; account and order endpoints are
//! signed with HMAC-SHA512 over method, path, query, body hash and
//! timestamp.
//!
//! Mainnet: https://api.gateio.ws/api/v4
//! Testnet: https://api-testnet.gateapi.io/api/v4

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::platforms::Exchange;
use crate::types::{
    ArbError, ArbResult, Contract, OrderRequest, OrderResult, Quote, Side,
    SpotMarketInfo, Venue, VenuePosition,
};

type HmacSha512 = Hmac<Sha512>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const MAINNET_URL: &str = "https://api.gateio.ws/api/v4";
const TESTNET_URL: &str = "https://api-testnet.gateapi.io/api/v4";
/// Path prefix that is part of the signed payload.
const API_PREFIX: &str = "/api/v4";
const SETTLE: &str = "usdt";
const QUOTE_CURRENCY: &str = "USDT";
const HTTP_TIMEOUT_SECS: u64 = 10;
/// Spot market buys are sized in quote; pad so the base fill is not short.
const MARKET_BUY_BUFFER: Decimal = dec!(0.002);
/// 1-minute candles inspected for recent spot activity.
const ACTIVITY_CANDLES: u32 = 5;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GateContract {
    name: String,
    funding_rate: Decimal,
    funding_interval: u64,
    quanto_multiplier: Decimal,
    mark_price: Decimal,
    #[serde(default)]
    in_delisting: bool,
}

impl From<GateContract> for Contract {
    fn from(c: GateContract) -> Self {
        Contract {
            spot_pair: c.name.clone(),
            id: c.name,
            funding_rate: c.funding_rate,
            funding_interval_secs: c.funding_interval,
            multiplier: c.quanto_multiplier,
            mark_price: c.mark_price,
            delisting: c.in_delisting,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GateTicker {
    #[serde(default)]
    lowest_ask: String,
    #[serde(default)]
    highest_bid: String,
}

#[derive(Debug, Deserialize)]
struct GateCurrencyPair {
    id: String,
    amount_precision: u32,
    #[serde(default)]
    min_base_amount: Option<String>,
    #[serde(default)]
    trade_status: String,
}

#[derive(Debug, Deserialize)]
struct GateFuturesOrder {
    id: i64,
    size: i64,
    #[serde(default)]
    left: i64,
    #[serde(default)]
    fill_price: Option<String>,
    #[serde(default)]
    finish_as: String,
}

#[derive(Debug, Deserialize)]
struct GateSpotOrder {
    id: String,
    #[serde(default)]
    filled_amount: Option<String>,
    #[serde(default)]
    filled_total: Option<String>,
    #[serde(default)]
    avg_deal_price: Option<String>,
    #[serde(default)]
    fee: Option<String>,
    #[serde(default)]
    fee_currency: String,
}

#[derive(Debug, Deserialize)]
struct GateSpotAccount {
    currency: String,
    available: String,
}

#[derive(Debug, Deserialize)]
struct GatePosition {
    contract: String,
    size: i64,
    #[serde(default)]
    entry_price: Option<String>,
    #[serde(default)]
    pnl_fund: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GateErrorBody {
    #[serde(default)]
    label: String,
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GateClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl GateClient {
    pub fn new(credentials: Credentials, testnet: bool) -> ArbResult<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| ArbError::Configuration(format!("failed to build Gate HTTP client: {e}")))?;

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        info!(base_url, "Gate client ready");

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            credentials,
        })
    }

    /// Switch futures to single-position (one-way) mode. A hedge needs
    /// exactly one net futures position per contract.
    pub async fn set_single_position_mode(&self) -> ArbResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                &format!("/futures/{SETTLE}/dual_mode"),
                &[("dual_mode", "false".to_string())],
                None,
                true,
            )
            .await?;
        info!("Futures account set to single-position mode");
        Ok(())
    }

    /// Send a request and decode the JSON body, mapping failures onto
    /// the engine's error taxonomy.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        signed: bool,
    ) -> ArbResult<T> {
        let query_string = encode_query(query);
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();

        let mut url = format!("{}{}", self.base_url, path);
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");

        if signed {
            let timestamp = Utc::now().timestamp().to_string();
            let signature = sign_request(
                self.credentials.secret(),
                method.as_str(),
                path,
                &query_string,
                &body_text,
                &timestamp,
            )?;
            request = request
                .header("KEY", self.credentials.api_key.as_str())
                .header("Timestamp", timestamp)
                .header("SIGN", signature);
        }

        if !body_text.is_empty() {
            request = request.body(body_text);
        }

        debug!(%method, path, query = %query_string, "Gate request");

        let resp = request
            .send()
            .await
            .map_err(|e| ArbError::Transient(format!("{path}: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ArbError::Transient(format!("{path}: reading body: {e}")))?;

        if !status.is_success() {
            let err = classify_http_error(status.as_u16(), &text);
            debug!(path, status = status.as_u16(), error = %err, "Gate request failed");
            return Err(err);
        }

        decode_body(path, &text)
    }

    async fn fetch_pair(&self, pair: &str) -> ArbResult<GateCurrencyPair> {
        self.call(Method::GET, &format!("/spot/currency_pairs/{pair}"), &[], None, false)
            .await
    }

    async fn fetch_last_trade(&self, pair: &str) -> ArbResult<Option<DateTime<Utc>>> {
        let candles: Vec<Vec<Value>> = self
            .call(
                Method::GET,
                "/spot/candlesticks",
                &[
                    ("currency_pair", pair.to_string()),
                    ("interval", "1m".to_string()),
                    ("limit", ACTIVITY_CANDLES.to_string()),
                ],
                None,
                false,
            )
            .await?;
        Ok(latest_traded_candle(&candles))
    }
}

#[async_trait]
impl Exchange for GateClient {
    async fn fetch_contracts(&self) -> ArbResult<Vec<Contract>> {
        let raw: Vec<GateContract> = self
            .call(Method::GET, &format!("/futures/{SETTLE}/contracts"), &[], None, false)
            .await?;
        debug!(count = raw.len(), "Fetched Gate contracts");
        Ok(raw.into_iter().map(Contract::from).collect())
    }

    async fn fetch_futures_quote(&self, contract: &str) -> ArbResult<Quote> {
        let tickers: Vec<GateTicker> = self
            .call(
                Method::GET,
                &format!("/futures/{SETTLE}/tickers"),
                &[("contract", contract.to_string())],
                None,
                false,
            )
            .await?;
        first_book(&tickers, contract)
    }

    async fn fetch_spot_quote(&self, pair: &str) -> ArbResult<Quote> {
        let tickers: Vec<GateTicker> = self
            .call(
                Method::GET,
                "/spot/tickers",
                &[("currency_pair", pair.to_string())],
                None,
                false,
            )
            .await?;
        first_book(&tickers, pair)
    }

    async fn fetch_spot_market(&self, pair: &str) -> ArbResult<SpotMarketInfo> {
        let (meta, last_trade_at) =
            tokio::try_join!(self.fetch_pair(pair), self.fetch_last_trade(pair))?;

        Ok(SpotMarketInfo {
            pair: meta.id,
            tradable: meta.trade_status == "tradable",
            amount_precision: meta.amount_precision,
            min_base_amount: lenient_decimal(&meta.min_base_amount),
            last_trade_at,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> ArbResult<OrderResult> {
        match request.venue {
            Venue::Futures => {
                let body = futures_order_body(request)?;
                let order: GateFuturesOrder = self
                    .call(Method::POST, &format!("/futures/{SETTLE}/orders"), &[], Some(body), true)
                    .await?;
                let result = futures_fill(&order);
                if !result.is_filled() {
                    warn!(
                        contract = %request.instrument,
                        finish_as = %order.finish_as,
                        "Futures order finished without a fill"
                    );
                }
                Ok(result)
            }
            Venue::Spot => {
                let body = spot_order_body(request);
                let order: GateSpotOrder = self
                    .call(Method::POST, "/spot/orders", &[], Some(body), true)
                    .await?;
                Ok(spot_fill(&order, &request.instrument))
            }
        }
    }

    async fn fetch_balance(&self) -> ArbResult<Decimal> {
        let accounts: Vec<GateSpotAccount> = self
            .call(
                Method::GET,
                "/spot/accounts",
                &[("currency", QUOTE_CURRENCY.to_string())],
                None,
                true,
            )
            .await?;
        Ok(accounts
            .iter()
            .find(|a| a.currency.eq_ignore_ascii_case(QUOTE_CURRENCY))
            .and_then(|a| Decimal::from_str(&a.available).ok())
            .unwrap_or(Decimal::ZERO))
    }

    async fn fetch_open_positions(&self) -> ArbResult<Vec<VenuePosition>> {
        let positions: Vec<GatePosition> = self
            .call(Method::GET, &format!("/futures/{SETTLE}/positions"), &[], None, true)
            .await?;
        Ok(positions
            .into_iter()
            .filter(|p| p.size != 0)
            .map(|p| VenuePosition {
                size: Decimal::from(p.size),
                entry_price: lenient_decimal(&p.entry_price),
                contract: p.contract,
            })
            .collect())
    }

    async fn fetch_funding_income(&self, contract: &str) -> ArbResult<Decimal> {
        let position: GatePosition = self
            .call(
                Method::GET,
                &format!("/futures/{SETTLE}/positions/{contract}"),
                &[],
                None,
                true,
            )
            .await?;
        Ok(lenient_decimal(&position.pnl_fund))
    }

    async fn set_leverage(&self, contract: &str, leverage: u32) -> ArbResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                &format!("/futures/{SETTLE}/positions/{contract}/leverage"),
                &[("leverage", leverage.to_string())],
                None,
                true,
            )
            .await?;
        debug!(contract, leverage, "Leverage set");
        Ok(())
    }

    async fn set_spot_leverage(&self, currency: &str, leverage: u32) -> ArbResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                "/unified/leverage/user_currency_setting",
                &[],
                Some(unified_leverage_body(currency, leverage)),
                true,
            )
            .await?;
        debug!(currency, leverage, "Unified borrow leverage set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signing and error mapping
// ---------------------------------------------------------------------------

fn signature_payload(method: &str, path: &str, query: &str, body: &str, timestamp: &str) -> String {
    let body_hash = hex::encode(Sha512::digest(body.as_bytes()));
    format!("{method}\n{API_PREFIX}{path}\n{query}\n{body_hash}\n{timestamp}")
}

fn sign_request(
    secret: &str,
    method: &str,
    path: &str,
    query: &str,
    body: &str,
    timestamp: &str,
) -> ArbResult<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ArbError::Configuration(format!("invalid API secret: {e}")))?;
    mac.update(signature_payload(method, path, query, body, timestamp).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn encode_query(query: &[(&str, String)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Some write endpoints answer 204 with nothing in the body.
fn decode_body<T: DeserializeOwned>(path: &str, text: &str) -> ArbResult<T> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text)
        .map_err(|e| ArbError::Transient(format!("{path}: malformed response: {e}")))
}

fn classify_http_error(status: u16, body: &str) -> ArbError {
    let parsed: GateErrorBody = serde_json::from_str(body).unwrap_or_default();
    let detail = if parsed.label.is_empty() {
        format!("HTTP {status}: {body}")
    } else {
        format!("{}: {}", parsed.label, parsed.message)
    };

    match status {
        429 | 500..=599 => ArbError::Transient(detail),
        404 => ArbError::NotFound(detail),
        _ if parsed.label.contains("NOT_FOUND") || parsed.label == "INVALID_CURRENCY_PAIR" => {
            ArbError::NotFound(detail)
        }
        _ => ArbError::Rejected(detail),
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn lenient_decimal(raw: &Option<String>) -> Decimal {
    raw.as_deref()
        .and_then(|s| Decimal::from_str(s.trim()).ok())
        .unwrap_or(Decimal::ZERO)
}

fn first_book(tickers: &[GateTicker], instrument: &str) -> ArbResult<Quote> {
    let ticker = tickers
        .first()
        .ok_or_else(|| ArbError::NotFound(format!("no ticker for {instrument}")))?;
    let parse = |s: &str| Decimal::from_str(s.trim()).ok();
    match (parse(&ticker.highest_bid), parse(&ticker.lowest_ask)) {
        (Some(bid), Some(ask)) => Ok(Quote { bid, ask }),
        _ => Err(ArbError::DataUnavailable(format!("empty book for {instrument}"))),
    }
}

/// Open time of the newest candle that carries volume.
fn latest_traded_candle(candles: &[Vec<Value>]) -> Option<DateTime<Utc>> {
    candles
        .iter()
        .filter(|row| {
            row.get(1)
                .and_then(value_decimal)
                .map(|quote_volume| quote_volume > Decimal::ZERO)
                .unwrap_or(false)
        })
        .filter_map(|row| row.first().and_then(value_decimal))
        .filter_map(|ts| ts.to_i64())
        .max()
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

fn value_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn futures_order_body(req: &OrderRequest) -> ArbResult<Value> {
    let lots = req
        .size
        .trunc()
        .to_i64()
        .filter(|l| *l > 0)
        .ok_or_else(|| ArbError::Rejected(format!("invalid futures size {}", req.size)))?;
    let signed_size = match req.side {
        Side::Buy => lots,
        Side::Sell => -lots,
    };
    Ok(json!({
        "contract": req.instrument,
        "size": signed_size,
        "price": "0",
        "tif": "ioc",
        "reduce_only": req.reduce_only,
        "text": req.client_tag,
    }))
}

fn spot_order_body(req: &OrderRequest) -> Value {
    let side = match req.side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    };
    // Market buys are denominated in quote currency on Gate.
    let amount = match req.side {
        Side::Buy => {
            (req.size * req.reference_price * (Decimal::ONE + MARKET_BUY_BUFFER)).round_dp(8)
        }
        Side::Sell => req.size,
    };
    json!({
        "currency_pair": req.instrument,
        "side": side,
        "type": "market",
        "time_in_force": "ioc",
        "amount": amount.normalize().to_string(),
        "account": "unified",
        "auto_borrow": true,
        "auto_repay": true,
        "text": req.client_tag,
    })
}

fn unified_leverage_body(currency: &str, leverage: u32) -> Value {
    json!({
        "currency": currency,
        "leverage": leverage.to_string(),
    })
}

fn futures_fill(order: &GateFuturesOrder) -> OrderResult {
    let filled = (order.size - order.left).abs();
    OrderResult {
        order_id: order.id.to_string(),
        filled_size: Decimal::from(filled),
        avg_price: if filled > 0 {
            lenient_decimal(&order.fill_price)
        } else {
            Decimal::ZERO
        },
        fee: None,
    }
}

/// Reconcile a spot fill into base quantity held, net of any fee
/// charged in the base currency.
fn spot_fill(order: &GateSpotOrder, pair: &str) -> OrderResult {
    let avg = lenient_decimal(&order.avg_deal_price);
    let total = lenient_decimal(&order.filled_total);
    let reported = lenient_decimal(&order.filled_amount);

    let gross_base = if reported > Decimal::ZERO {
        reported
    } else if avg > Decimal::ZERO {
        (total / avg).round_dp(12)
    } else {
        Decimal::ZERO
    };

    let fee = lenient_decimal(&order.fee);
    let base_currency = pair.split('_').next().unwrap_or_default();

    let (net_base, fee_quote) = if order.fee_currency.eq_ignore_ascii_case(base_currency) {
        (gross_base - fee, Some(fee * avg))
    } else if order.fee_currency.eq_ignore_ascii_case(QUOTE_CURRENCY) {
        (gross_base, Some(fee))
    } else {
        // Fee paid in a third currency (e.g. GT); leave it to estimation.
        (gross_base, None)
    };

    OrderResult {
        order_id: order.id.clone(),
        filled_size: net_base.max(Decimal::ZERO),
        avg_price: avg,
        fee: fee_quote,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
