//! # exchange::okx
//!
//! OKX v5 perpetual swaps. Requests are signed with base64 HMAC-SHA256 over
//! `timestamp + METHOD + requestPath + body` and carry the passphrase.
//! Sizes are expressed in contracts, so quantities are divided by the
//! instrument's contract value.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::VenueConfig;
use crate::credentials::ApiCredentials;
use crate::exchange::retry::RetryPolicy;
use crate::exchange::signing::hmac_sha256_base64;
use crate::exchange::{
    format_decimal, json_f64, price_decimals, BalanceSnapshot, ExchangeAdapter, ExchangeError,
    OrderRequest, OrderResult, PositionSnapshot,
};
use crate::models::{Side, Venue};

const QUOTE_CCY: &str = "USDT";

pub struct OkxAdapter {
    client:   reqwest::Client,
    base_url: String,
    timeout:  Duration,
    reads:    RetryPolicy,
    submits:  RetryPolicy,
}

/// `BTCUSDT` → `BTC-USDT-SWAP`. Symbols already in OKX form pass through.
pub fn inst_id(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    if symbol.contains('-') {
        return symbol;
    }
    match symbol.strip_suffix(QUOTE_CCY) {
        Some(base) if !base.is_empty() => format!("{base}-{QUOTE_CCY}-SWAP"),
        _ => symbol,
    }
}

/// Base-asset units per contract.
fn contract_value(inst_id: &str) -> f64 {
    match inst_id.split('-').next() {
        Some("BTC") => 0.01,
        Some("ETH") => 0.1,
        _ => 1.0,
    }
}

impl OkxAdapter {
    pub fn new(client: reqwest::Client, config: &VenueConfig, reads: RetryPolicy) -> Self {
        Self {
            client,
            base_url: config.okx_base_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout,
            reads,
            submits: RetryPolicy::submissions(),
        }
    }

    /// `path` includes the query string; it is part of the signed payload.
    async fn send(
        &self,
        creds: &ApiCredentials,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ExchangeError> {
        let passphrase = creds
            .passphrase
            .as_deref()
            .ok_or_else(|| ExchangeError::Auth("okx credentials need a passphrase".into()))?;
        let body = body.map(Value::to_string).unwrap_or_default();
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let prehash = format!("{timestamp}{}{path}{body}", method.as_str());
        let signature = hmac_sha256_base64(&creds.api_secret, &prehash)?;

        let mut request = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", passphrase)
            .timeout(self.timeout);
        if !body.is_empty() {
            request = request.header("Content-Type", "application/json").body(body);
        }

        let resp = request.send().await.map_err(|e| ExchangeError::from_transport(&e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Ambiguous(format!("reading {path} body: {e}")))?;
        debug!(path, %status, "okx response");
        parse_response(status, &text)
    }
}

/// OKX answers `{"code":"0","data":[..]}`; anything else is a failure, and
/// order endpoints also carry a per-item `sCode`.
fn parse_response(status: StatusCode, body: &str) -> Result<Value, ExchangeError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) if status == StatusCode::TOO_MANY_REQUESTS => {
            return Err(ExchangeError::RateLimited(body.to_string()))
        }
        Err(_) if status.is_server_error() => {
            return Err(ExchangeError::Ambiguous(format!("{status}: {body}")))
        }
        Err(e) => return Err(ExchangeError::Decode(format!("{e}: {body}"))),
    };

    let code = value.get("code").and_then(Value::as_str).unwrap_or("");
    if code != "0" {
        let msg = value.get("msg").and_then(Value::as_str).unwrap_or_default();
        return Err(code_error(code, msg, status));
    }
    if let Some(item) = value["data"]
        .as_array()
        .and_then(|items| items.iter().find(|i| i.get("sCode").and_then(Value::as_str).is_some_and(|c| c != "0")))
    {
        let code = item["sCode"].as_str().unwrap_or_default();
        let msg = item.get("sMsg").and_then(Value::as_str).unwrap_or_default();
        return Err(code_error(code, msg, status));
    }
    Ok(value)
}

fn code_error(code: &str, msg: &str, status: StatusCode) -> ExchangeError {
    match code {
        "50011" | "50061" => ExchangeError::RateLimited(format!("{code}: {msg}")),
        "50100" | "50101" | "50103" | "50104" | "50105" | "50111" | "50113" => {
            ExchangeError::Auth(format!("{code}: {msg}"))
        }
        "" if status == StatusCode::UNAUTHORIZED => ExchangeError::Auth(msg.to_string()),
        "" if status.is_server_error() => ExchangeError::Ambiguous(format!("{status}: {msg}")),
        "" => ExchangeError::Decode(format!("response without code ({status})")),
        _ => ExchangeError::Rejected { code: code.to_string(), message: msg.to_string() },
    }
}

fn first_item(value: &Value) -> Option<&Value> {
    value["data"].as_array().and_then(|items| items.first())
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    async fn submit_order(
        &self,
        creds: &ApiCredentials,
        order: &OrderRequest,
    ) -> Result<OrderResult, ExchangeError> {
        let inst = inst_id(&order.symbol);

        let leverage_body = json!({
            "instId": inst,
            "lever": order.leverage.to_string(),
            "mgnMode": "cross",
        });
        let leverage = self
            .reads
            .run("okx.leverage", || {
                self.send(creds, Method::POST, "/api/v5/account/set-leverage", Some(&leverage_body))
            })
            .await?;

        let contracts = order.quantity / contract_value(&inst);
        let mut body = json!({
            "instId": inst,
            "tdMode": "cross",
            "side": if order.is_buy() { "buy" } else { "sell" },
            "ordType": "market",
            "sz": format_decimal(contracts, 2),
            "clOrdId": order.client_order_id,
            "reduceOnly": order.reduce_only,
        });
        if order.stop_loss.is_some() || order.take_profit.is_some() {
            let decimals = price_decimals(order.reference_price);
            let mut algo = serde_json::Map::new();
            if let Some(sl) = order.stop_loss {
                algo.insert("slTriggerPx".into(), json!(format_decimal(sl, decimals)));
                algo.insert("slOrdPx".into(), json!("-1"));
            }
            if let Some(tp) = order.take_profit {
                algo.insert("tpTriggerPx".into(), json!(format_decimal(tp, decimals)));
                algo.insert("tpOrdPx".into(), json!("-1"));
            }
            body["attachAlgoOrds"] = json!([Value::Object(algo)]);
        }

        let placed = self
            .submits
            .run("okx.order", || {
                self.send(creds, Method::POST, "/api/v5/trade/order", Some(&body))
            })
            .await?;

        let order_id = first_item(&placed)
            .and_then(|item| item.get("ordId"))
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Decode(format!("order response without ordId: {placed}")))?
            .to_string();

        Ok(OrderResult {
            order_id,
            // Market order acks carry no fill; callers fall back to the reference price.
            fill_price: None,
            fill_quantity: None,
            raw: json!({ "leverage": leverage, "order": placed }),
        })
    }

    async fn query_balance(&self, creds: &ApiCredentials) -> Result<BalanceSnapshot, ExchangeError> {
        let path = format!("/api/v5/account/balance?ccy={QUOTE_CCY}");
        let resp = self
            .reads
            .run("okx.balance", || self.send(creds, Method::GET, &path, None))
            .await?;

        let detail = first_item(&resp)
            .and_then(|acct| acct["details"].as_array())
            .and_then(|details| {
                details
                    .iter()
                    .find(|d| d.get("ccy").and_then(Value::as_str) == Some(QUOTE_CCY))
            })
            .ok_or_else(|| ExchangeError::Decode(format!("no {QUOTE_CCY} balance in response")))?;

        Ok(BalanceSnapshot {
            currency: QUOTE_CCY.to_string(),
            total: json_f64(detail, "eq").unwrap_or(0.0),
            available: json_f64(detail, "availBal")
                .or_else(|| json_f64(detail, "availEq"))
                .unwrap_or(0.0),
        })
    }

    async fn query_position(
        &self,
        creds: &ApiCredentials,
        symbol: &str,
    ) -> Result<Option<PositionSnapshot>, ExchangeError> {
        let inst = inst_id(symbol);
        let path = format!("/api/v5/account/positions?instId={inst}");
        let resp = self
            .reads
            .run("okx.position", || self.send(creds, Method::GET, &path, None))
            .await?;

        let rows = resp["data"].as_array().cloned().unwrap_or_default();
        Ok(rows.iter().find_map(|row| position_from_row(symbol, &inst, row)))
    }
}

fn position_from_row(symbol: &str, inst: &str, row: &Value) -> Option<PositionSnapshot> {
    let contracts = json_f64(row, "pos")?;
    if contracts == 0.0 {
        return None;
    }
    let side = match row.get("posSide").and_then(Value::as_str) {
        Some("long") => Side::Long,
        Some("short") => Side::Short,
        _ if contracts > 0.0 => Side::Long,
        _ => Side::Short,
    };
    Some(PositionSnapshot {
        symbol: symbol.to_string(),
        side,
        quantity: contracts.abs() * contract_value(inst),
        entry_price: json_f64(row, "avgPx").unwrap_or(0.0),
        mark_price: json_f64(row, "markPx"),
        unrealized_pnl: json_f64(row, "upl"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_map_to_swap_instruments() {
        assert_eq!(inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(inst_id("ethusdt"), "ETH-USDT-SWAP");
        assert_eq!(inst_id("SOL-USDT-SWAP"), "SOL-USDT-SWAP");
        assert_eq!(inst_id("USDT"), "USDT");
    }

    #[test]
    fn per_order_scode_failure_is_rejection() {
        let body = r#"{"code":"0","msg":"","data":[{"ordId":"","sCode":"51008","sMsg":"Insufficient balance"}]}"#;
        let err = parse_response(StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { ref code, .. } if code == "51008"));
    }

    #[test]
    fn top_level_code_must_be_zero() {
        let body = r#"{"code":"50113","msg":"Invalid Sign","data":[]}"#;
        assert!(matches!(parse_response(StatusCode::UNAUTHORIZED, body), Err(ExchangeError::Auth(_))));

        let ok = r#"{"code":"0","msg":"","data":[{"ordId":"123","sCode":"0"}]}"#;
        let value = parse_response(StatusCode::OK, ok).unwrap();
        assert_eq!(first_item(&value).unwrap()["ordId"], "123");
    }

    #[test]
    fn net_mode_positions_use_sign_and_contract_value() {
        let row = json!({ "pos": "-3", "posSide": "net", "avgPx": "3000", "markPx": "2990", "upl": "3" });
        let snap = position_from_row("ETHUSDT", "ETH-USDT-SWAP", &row).unwrap();
        assert_eq!(snap.side, Side::Short);
        assert!((snap.quantity - 0.3).abs() < 1e-12);
    }
}
