//! # exchange::binance
//!
//! USDⓈ-M futures over the signed REST API. Every private call carries
//! `timestamp` + `recvWindow`, signed with HMAC-SHA256 (hex) over the query
//! string, and the key in `X-MBX-APIKEY`.
//!
//! Order flow: set leverage → MARKET order (client id = idempotency key)
//! → protective STOP_MARKET / TAKE_PROFIT_MARKET with `closePosition=true`.
//! A failed protective order is logged but does not undo the fill.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::VenueConfig;
use crate::credentials::ApiCredentials;
use crate::exchange::retry::RetryPolicy;
use crate::exchange::signing::hmac_sha256_hex;
use crate::exchange::{
    format_decimal, json_f64, price_decimals, quantity_decimals, BalanceSnapshot, ExchangeAdapter,
    ExchangeError, OrderRequest, OrderResult, PositionSnapshot,
};
use crate::models::{Side, Venue};

const QUOTE_ASSET: &str = "USDT";

pub struct BinanceAdapter {
    client:     reqwest::Client,
    base_url:   String,
    recv_window_ms: u64,
    timeout:    Duration,
    reads:      RetryPolicy,
    submits:    RetryPolicy,
}

impl BinanceAdapter {
    pub fn new(client: reqwest::Client, config: &VenueConfig, reads: RetryPolicy) -> Self {
        Self {
            client,
            base_url: config.binance_base_url.trim_end_matches('/').to_string(),
            recv_window_ms: config.recv_window_ms,
            timeout: config.request_timeout,
            reads,
            submits: RetryPolicy::submissions(),
        }
    }

    async fn signed(
        &self,
        creds: &ApiCredentials,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        query.push(format!("recvWindow={}", self.recv_window_ms));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");
        let signature = hmac_sha256_hex(&creds.api_secret, &query)?;
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ExchangeError::from_transport(&e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Ambiguous(format!("reading {path} body: {e}")))?;
        debug!(path, %status, "binance response");
        parse_response(status, &body)
    }
}

/// Maps a Binance HTTP answer to a value or a classified error.
fn parse_response(status: StatusCode, body: &str) -> Result<Value, ExchangeError> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        if status.is_success() {
            ExchangeError::Decode(format!("{e}: {body}"))
        } else {
            status_error(status, body)
        }
    })?;

    if let Some(code) = value.get("code").and_then(Value::as_i64) {
        if code != 0 && code != 200 {
            let msg = value.get("msg").and_then(Value::as_str).unwrap_or_default().to_string();
            return Err(code_error(code, msg));
        }
    }
    if !status.is_success() {
        return Err(status_error(status, body));
    }
    Ok(value)
}

fn code_error(code: i64, msg: String) -> ExchangeError {
    match code {
        -2014 | -2015 | -1022 => ExchangeError::Auth(format!("{code}: {msg}")),
        -1003 | -1015 => ExchangeError::RateLimited(format!("{code}: {msg}")),
        _ => ExchangeError::Rejected { code: code.to_string(), message: msg },
    }
}

fn status_error(status: StatusCode, body: &str) -> ExchangeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Auth(body.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
            ExchangeError::RateLimited(body.to_string())
        }
        s if s.is_server_error() => ExchangeError::Ambiguous(format!("{s}: {body}")),
        s => ExchangeError::Rejected { code: s.as_u16().to_string(), message: body.to_string() },
    }
}

fn order_side(buy: bool) -> &'static str {
    if buy { "BUY" } else { "SELL" }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    async fn submit_order(
        &self,
        creds: &ApiCredentials,
        order: &OrderRequest,
    ) -> Result<OrderResult, ExchangeError> {
        let symbol = order.symbol.to_uppercase();

        // Leverage is a setting, safe to repeat.
        let lev_params = [("symbol", symbol.clone()), ("leverage", order.leverage.to_string())];
        let leverage = self
            .reads
            .run("binance.leverage", || {
                self.signed(creds, Method::POST, "/fapi/v1/leverage", &lev_params)
            })
            .await?;

        let qty = format_decimal(order.quantity, quantity_decimals(order.reference_price));
        let mut params = vec![
            ("symbol", symbol.clone()),
            ("side", order_side(order.is_buy()).to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty),
            ("newClientOrderId", order.client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let filled = self
            .submits
            .run("binance.order", || {
                self.signed(creds, Method::POST, "/fapi/v1/order", &params)
            })
            .await?;

        let order_id = filled
            .get("orderId")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| ExchangeError::Decode(format!("order response without orderId: {filled}")))?;

        let mut protection = Vec::new();
        let exit_side = order_side(!order.is_buy());
        let decimals = price_decimals(order.reference_price);
        for (kind, trigger) in [
            ("STOP_MARKET", order.stop_loss),
            ("TAKE_PROFIT_MARKET", order.take_profit),
        ] {
            let Some(trigger) = trigger else { continue };
            let params = [
                ("symbol", symbol.clone()),
                ("side", exit_side.to_string()),
                ("type", kind.to_string()),
                ("stopPrice", format_decimal(trigger, decimals)),
                ("closePosition", "true".to_string()),
                ("workingType", "MARK_PRICE".to_string()),
            ];
            match self.signed(creds, Method::POST, "/fapi/v1/order", &params).await {
                Ok(resp) => protection.push(resp),
                Err(e) => {
                    warn!(symbol = %symbol, kind, error = %e, "⚠️ protective order failed — position is unprotected");
                    protection.push(json!({ "type": kind, "error": e.to_string() }));
                }
            }
        }

        Ok(OrderResult {
            order_id,
            fill_price: json_f64(&filled, "avgPrice").filter(|p| *p > 0.0),
            fill_quantity: json_f64(&filled, "executedQty").filter(|q| *q > 0.0),
            raw: json!({ "leverage": leverage, "order": filled, "protection": protection }),
        })
    }

    async fn query_balance(&self, creds: &ApiCredentials) -> Result<BalanceSnapshot, ExchangeError> {
        let params: [(&str, String); 0] = [];
        let balances = self
            .reads
            .run("binance.balance", || {
                self.signed(creds, Method::GET, "/fapi/v2/balance", &params)
            })
            .await?;

        let entry = balances
            .as_array()
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row.get("asset").and_then(Value::as_str) == Some(QUOTE_ASSET))
            })
            .ok_or_else(|| ExchangeError::Decode(format!("no {QUOTE_ASSET} balance in response")))?;

        Ok(BalanceSnapshot {
            currency: QUOTE_ASSET.to_string(),
            total: json_f64(entry, "balance").unwrap_or(0.0),
            available: json_f64(entry, "availableBalance").unwrap_or(0.0),
        })
    }

    async fn query_position(
        &self,
        creds: &ApiCredentials,
        symbol: &str,
    ) -> Result<Option<PositionSnapshot>, ExchangeError> {
        let symbol = symbol.to_uppercase();
        let params = [("symbol", symbol.clone())];
        let rows = self
            .reads
            .run("binance.position", || {
                self.signed(creds, Method::GET, "/fapi/v2/positionRisk", &params)
            })
            .await?;

        let rows = rows
            .as_array()
            .ok_or_else(|| ExchangeError::Decode(format!("positionRisk is not a list: {rows}")))?;
        Ok(rows.iter().find_map(|row| position_from_row(&symbol, row)))
    }
}

fn position_from_row(symbol: &str, row: &Value) -> Option<PositionSnapshot> {
    let amount = json_f64(row, "positionAmt")?;
    if amount == 0.0 {
        return None;
    }
    Some(PositionSnapshot {
        symbol: symbol.to_string(),
        side: if amount > 0.0 { Side::Long } else { Side::Short },
        quantity: amount.abs(),
        entry_price: json_f64(row, "entryPrice").unwrap_or(0.0),
        mark_price: json_f64(row, "markPrice"),
        unrealized_pnl: json_f64(row, "unRealizedProfit"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_code_is_a_rejection_even_with_200() {
        let err = parse_response(StatusCode::OK, r#"{"code":-2019,"msg":"Margin is insufficient."}"#)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { ref code, .. } if code == "-2019"));
    }

    #[test]
    fn auth_and_rate_limit_codes_are_classified() {
        let auth = parse_response(StatusCode::UNAUTHORIZED, r#"{"code":-2015,"msg":"Invalid API-key"}"#);
        assert!(matches!(auth, Err(ExchangeError::Auth(_))));
        let limited = parse_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        assert!(matches!(limited, Err(ExchangeError::RateLimited(_))));
    }

    #[test]
    fn success_body_passes_through() {
        let v = parse_response(StatusCode::OK, r#"{"orderId":123,"avgPrice":"45000.5","executedQty":"0.01"}"#)
            .unwrap();
        assert_eq!(json_f64(&v, "avgPrice"), Some(45000.5));
    }

    #[test]
    fn garbage_success_body_is_decode_error() {
        let err = parse_response(StatusCode::OK, "<html>").unwrap_err();
        assert!(err.needs_reconciliation());
    }

    #[test]
    fn flat_position_rows_are_ignored() {
        let flat = json!({ "positionAmt": "0.000", "entryPrice": "0.0" });
        assert!(position_from_row("BTCUSDT", &flat).is_none());

        let short = json!({ "positionAmt": "-0.010", "entryPrice": "45000", "markPrice": "44000", "unRealizedProfit": "10" });
        let snap = position_from_row("BTCUSDT", &short).unwrap();
        assert_eq!(snap.side, Side::Short);
        assert!((snap.quantity - 0.01).abs() < 1e-12);
    }
}
