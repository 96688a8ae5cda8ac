use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{
    AccountBalance, ExchangeApi, ExchangeError, OrderParams, Ticker, VenueOrder, VenueOrderStatus,
    VenuePosition,
};
use crate::execution::{OrderSide, OrderType};
use crate::models::Direction;
use async_trait::async_trait;

type HmacSha256 = Hmac<Sha256>;

pub const OKX_REST_URL: &str = "https://www.okx.com";

#[derive(Debug, Clone)]
pub struct OkxCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

/// OKX v5 REST client.
///
/// Private endpoints are signed with HMAC-SHA256 over
/// `timestamp + method + path + body`, base64-encoded.
pub struct OkxClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<OkxCredentials>,
}

/// Standard OKX response envelope
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct OkxEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OkxOrderData {
    #[serde(rename = "ordId", default)]
    ord_id: String,
    #[serde(rename = "clOrdId", default)]
    cl_ord_id: String,
    #[serde(default)]
    state: String,
    #[serde(rename = "accFillSz", default)]
    acc_fill_sz: String,
    #[serde(rename = "avgPx", default)]
    avg_px: String,
    #[serde(default)]
    fee: String,
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct OkxTickerData {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
    #[serde(rename = "bidPx", default)]
    bid_px: String,
    #[serde(rename = "askPx", default)]
    ask_px: String,
}

#[derive(Debug, Deserialize)]
struct OkxBalanceData {
    #[serde(default)]
    details: Vec<OkxBalanceDetail>,
}

#[derive(Debug, Deserialize)]
struct OkxBalanceDetail {
    ccy: String,
    #[serde(default)]
    eq: String,
    #[serde(rename = "availBal", default)]
    avail_bal: String,
}

#[derive(Debug, Deserialize)]
struct OkxPositionData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "posSide", default)]
    pos_side: String,
    #[serde(default)]
    pos: String,
    #[serde(rename = "avgPx", default)]
    avg_px: String,
}

#[derive(Debug, Serialize)]
struct PlaceOrderBody {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tdMode")]
    td_mode: &'static str,
    side: &'static str,
    #[serde(rename = "posSide", skip_serializing_if = "Option::is_none")]
    pos_side: Option<&'static str>,
    #[serde(rename = "ordType")]
    ord_type: String,
    sz: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    px: Option<String>,
    #[serde(rename = "triggerPx", skip_serializing_if = "Option::is_none")]
    trigger_px: Option<String>,
    #[serde(rename = "clOrdId", skip_serializing_if = "Option::is_none")]
    cl_ord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelOrderBody {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "ordId")]
    ord_id: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

fn map_state(state: &str) -> VenueOrderStatus {
    match state {
        "filled" => VenueOrderStatus::Filled,
        "canceled" | "cancelled" => VenueOrderStatus::Cancelled,
        "rejected" => VenueOrderStatus::Rejected,
        _ => VenueOrderStatus::Open,
    }
}

impl OkxClient {
    pub fn new(base_url: impl Into<String>, credentials: Option<OkxCredentials>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credentials,
        }
    }

    fn sign(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>, ExchangeError> {
        let Some(creds) = &self.credentials else {
            return Ok(Vec::new());
        };

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let message = format!("{}{}{}{}", timestamp, method, path, body);

        let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Rejected(format!("bad API secret: {}", e)))?;
        mac.update(message.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        Ok(vec![
            ("OK-ACCESS-KEY".to_string(), creds.api_key.clone()),
            ("OK-ACCESS-SIGN".to_string(), signature),
            ("OK-ACCESS-TIMESTAMP".to_string(), timestamp),
            ("OK-ACCESS-PASSPHRASE".to_string(), creds.passphrase.clone()),
        ])
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Result<Vec<T>, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let body_str = body.clone().unwrap_or_default();

        let mut request = self.http.request(method.clone(), &url);
        for (name, value) in self.sign(method.as_str(), path, &body_str)? {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if response.status().as_u16() == 429 {
            return Err(ExchangeError::RateLimited(format!(
                "HTTP 429 from {}",
                path
            )));
        }

        let envelope: OkxEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Network(format!("bad response body: {}", e)))?;

        if envelope.code != "0" {
            return Err(ExchangeError::Rejected(format!(
                "code {}: {}",
                envelope.code, envelope.msg
            )));
        }

        Ok(envelope.data)
    }

    fn order_from_data(&self, symbol: &str, data: OkxOrderData) -> VenueOrder {
        VenueOrder {
            id: data.ord_id,
            client_order_id: if data.cl_ord_id.is_empty() {
                None
            } else {
                Some(data.cl_ord_id)
            },
            symbol: symbol.to_string(),
            status: map_state(&data.state),
            filled: parse_f64(&data.acc_fill_sz),
            average_price: parse_f64(&data.avg_px),
            fee: parse_f64(&data.fee).abs(),
        }
    }
}

#[async_trait]
impl ExchangeApi for OkxClient {
    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
        params: &OrderParams,
    ) -> Result<VenueOrder, ExchangeError> {
        let ord_type = match order_type {
            OrderType::Market => "market".to_string(),
            OrderType::Limit => "limit".to_string(),
            // Trigger orders go through the algo endpoint on OKX; the plain
            // order endpoint accepts them as conditional orders
            OrderType::Stop | OrderType::StopLimit => "conditional".to_string(),
        };

        let body = PlaceOrderBody {
            inst_id: symbol.to_string(),
            td_mode: "cross",
            side: match side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            pos_side: params.pos_side.map(|d| match d {
                Direction::Long => "long",
                Direction::Short => "short",
            }),
            ord_type,
            sz: amount.to_string(),
            px: price.map(|p| p.to_string()),
            trigger_px: params.stop_price.map(|p| p.to_string()),
            cl_ord_id: params.client_order_id.clone(),
            tag: params.tag.clone(),
        };

        let body_str = serde_json::to_string(&body)
            .map_err(|e| ExchangeError::Rejected(format!("unserializable order: {}", e)))?;

        let mut data: Vec<OkxOrderData> = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(body_str))
            .await?;

        let data = data
            .pop()
            .ok_or_else(|| ExchangeError::Rejected("empty order response".into()))?;

        // Per-order result code inside a successful envelope
        if !data.s_code.is_empty() && data.s_code != "0" {
            return Err(ExchangeError::Rejected(format!(
                "order rejected ({}): {}",
                data.s_code, data.s_msg
            )));
        }

        Ok(self.order_from_data(symbol, data))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let body = CancelOrderBody {
            inst_id: symbol.to_string(),
            ord_id: order_id.to_string(),
        };
        let body_str = serde_json::to_string(&body)
            .map_err(|e| ExchangeError::Rejected(format!("unserializable cancel: {}", e)))?;

        let _: Vec<OkxOrderData> = self
            .request(
                reqwest::Method::POST,
                "/api/v5/trade/cancel-order",
                Some(body_str),
            )
            .await?;
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<VenueOrder, ExchangeError> {
        let path = format!("/api/v5/trade/order?instId={}&ordId={}", symbol, order_id);
        let mut data: Vec<OkxOrderData> =
            self.request(reqwest::Method::GET, &path, None).await?;

        let data = data
            .pop()
            .ok_or_else(|| ExchangeError::Rejected(format!("order {} not found", order_id)))?;

        Ok(self.order_from_data(symbol, data))
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let path = format!("/api/v5/market/ticker?instId={}", symbol);
        let mut data: Vec<OkxTickerData> =
            self.request(reqwest::Method::GET, &path, None).await?;

        let data = data
            .pop()
            .ok_or_else(|| ExchangeError::Rejected(format!("ticker {} not found", symbol)))?;

        Ok(Ticker {
            symbol: data.inst_id,
            last: parse_f64(&data.last),
            bid: parse_f64(&data.bid_px),
            ask: parse_f64(&data.ask_px),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_balance(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        let data: Vec<OkxBalanceData> = self
            .request(reqwest::Method::GET, "/api/v5/account/balance", None)
            .await?;

        Ok(data
            .into_iter()
            .flat_map(|d| d.details)
            .map(|d| AccountBalance {
                currency: d.ccy,
                total: parse_f64(&d.eq),
                available: parse_f64(&d.avail_bal),
            })
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        let data: Vec<OkxPositionData> = self
            .request(reqwest::Method::GET, "/api/v5/account/positions", None)
            .await?;

        Ok(data
            .into_iter()
            .map(|d| VenuePosition {
                symbol: d.inst_id,
                side: if d.pos_side == "short" {
                    Direction::Short
                } else {
                    Direction::Long
                },
                size: parse_f64(&d.pos),
                entry_price: parse_f64(&d.avg_px),
            })
            .collect())
    }
}
