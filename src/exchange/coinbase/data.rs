//! Wire-format data for the Coinbase Advanced Trade API.
//!
//! Raw serde types mirror the JSON the exchange sends; `TryFrom`
//! conversions normalize them into the crate's exchange types.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::exchange::{Candle, Fill, OrderRecord, OrderStatus, Product, Ticker};
use crate::point::Side;
use crate::utils::parse_rfc3339;

/// `GET /api/v3/brokerage/time` response.
#[derive(Deserialize, Debug)]
pub struct ServerTimeRes {
    /// Server time, RFC3339.
    pub iso: String,
    /// Server time, milliseconds since the epoch.
    #[serde(rename = "epochMillis")]
    pub epoch_millis: String,
}

/// `GET /api/v3/brokerage/products` response.
#[derive(Deserialize, Debug)]
pub struct ProductsRes {
    /// Listed products.
    #[serde(default)]
    pub products: Vec<ProductRes>,
}

/// One product as the exchange reports it.
#[derive(Deserialize, Debug)]
pub struct ProductRes {
    /// Product identifier.
    pub product_id: String,
    /// Smallest order size.
    pub base_min_size: Decimal,
    /// Largest order size.
    pub base_max_size: Decimal,
    /// Base size quantum.
    pub base_increment: Decimal,
    /// Price quantum.
    pub quote_increment: Decimal,
}

impl From<ProductRes> for Product {
    fn from(value: ProductRes) -> Self {
        Product {
            product_id: value.product_id,
            base_min_size: value.base_min_size,
            base_max_size: value.base_max_size,
            base_increment: value.base_increment,
            quote_increment: value.quote_increment,
        }
    }
}

/// `GET /api/v3/brokerage/products/{id}/candles` response.
#[derive(Deserialize, Debug)]
pub struct CandlesRes {
    /// Fetched candles, newest first.
    #[serde(default)]
    pub candles: Vec<CandleRes>,
}

/// One candle as the exchange reports it.
#[derive(Deserialize, Debug)]
pub struct CandleRes {
    /// Bucket start, seconds since the epoch.
    pub start: String,
    /// Lowest trade price.
    pub low: Decimal,
    /// Highest trade price.
    pub high: Decimal,
    /// First trade price.
    pub open: Decimal,
    /// Last trade price.
    pub close: Decimal,
    /// Base volume traded.
    pub volume: Decimal,
}

impl TryFrom<CandleRes> for Candle {
    type Error = EngineError;

    fn try_from(value: CandleRes) -> Result<Self, Self::Error> {
        let secs: i64 = value
            .start
            .parse()
            .map_err(|err| EngineError::invalid(format!("candle start: {err}")))?;
        let start = chrono::DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| EngineError::invalid(format!("candle start out of range: {secs}")))?;

        Ok(Candle {
            start,
            low: value.low,
            high: value.high,
            open: value.open,
            close: value.close,
            volume: value.volume,
        })
    }
}

/// `GET /api/v3/brokerage/orders/historical/{id}` response.
#[derive(Deserialize, Debug)]
pub struct GetOrderRes {
    /// The order.
    pub order: OrderRes,
}

/// `GET /api/v3/brokerage/orders/historical/batch` response.
#[derive(Deserialize, Debug)]
pub struct ListOrdersRes {
    /// Orders of this page.
    #[serde(default)]
    pub orders: Vec<OrderRes>,
    /// Whether another page exists.
    #[serde(default)]
    pub has_next: bool,
    /// Cursor of the next page.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// One order as the REST API reports it.
#[derive(Deserialize, Debug)]
pub struct OrderRes {
    /// Server order ID.
    pub order_id: String,
    /// Client order ID used at creation.
    #[serde(default)]
    pub client_order_id: String,
    /// Product traded.
    pub product_id: String,
    /// `BUY` or `SELL`.
    pub side: String,
    /// Lifecycle status string.
    pub status: String,
    /// Cumulative executed base size.
    #[serde(default)]
    pub filled_size: Decimal,
    /// Average execution price.
    #[serde(default)]
    pub average_filled_price: Decimal,
    /// Cumulative fees.
    #[serde(default)]
    pub total_fees: Decimal,
    /// Creation timestamp, RFC3339.
    pub created_time: String,
    /// Most recent fill timestamp, RFC3339.
    #[serde(default)]
    pub last_fill_time: Option<String>,
    /// Exchange reason for a terminal status.
    #[serde(default)]
    pub reject_reason: Option<String>,
}

impl TryFrom<OrderRes> for OrderRecord {
    type Error = EngineError;

    fn try_from(value: OrderRes) -> Result<Self, Self::Error> {
        let status = parse_status(&value.status)?;
        let last_fill_time = match value.last_fill_time.as_deref() {
            Some("") | None => None,
            Some(raw) => Some(parse_rfc3339(raw)?),
        };

        Ok(OrderRecord {
            server_id: value.order_id,
            client_id: value.client_order_id,
            product_id: value.product_id,
            side: parse_side(&value.side)?,
            status,
            filled_size: value.filled_size,
            filled_price: value.average_filled_price,
            fee: value.total_fees,
            created_at: parse_rfc3339(&value.created_time)?,
            finished_at: status.is_done().then_some(last_fill_time).flatten(),
            done_reason: value.reject_reason.filter(|reason| !reason.is_empty()),
            last_fill_time,
        })
    }
}

/// `GET /api/v3/brokerage/orders/historical/fills` response.
#[derive(Deserialize, Debug)]
pub struct FillsRes {
    /// Fills of this page.
    #[serde(default)]
    pub fills: Vec<FillRes>,
    /// Cursor of the next page.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// One fill as the exchange reports it.
#[derive(Deserialize, Debug)]
pub struct FillRes {
    /// Server order ID the fill belongs to.
    pub order_id: String,
    /// Trade timestamp, RFC3339.
    pub trade_time: String,
    /// Execution price.
    #[serde(default)]
    pub price: Decimal,
    /// Executed base size.
    #[serde(default)]
    pub size: Decimal,
    /// Fee charged for the fill.
    #[serde(default)]
    pub commission: Decimal,
    /// `BUY` or `SELL`.
    pub side: String,
}

impl TryFrom<FillRes> for Fill {
    type Error = EngineError;

    fn try_from(value: FillRes) -> Result<Self, Self::Error> {
        Ok(Fill {
            order_id: value.order_id,
            trade_time: parse_rfc3339(&value.trade_time)?,
            price: value.price,
            size: value.size,
            fee: value.commission,
            side: parse_side(&value.side)?,
        })
    }
}

/// `POST /api/v3/brokerage/orders` body.
#[derive(Serialize, Debug)]
pub struct CreateOrderBody {
    /// Caller-chosen deduplication ID.
    pub client_order_id: String,
    /// Product to trade.
    pub product_id: String,
    /// `BUY` or `SELL`.
    pub side: String,
    /// Order type and its parameters.
    pub order_configuration: OrderConfiguration,
}

/// The one order configuration the engine uses.
#[derive(Serialize, Debug)]
pub struct OrderConfiguration {
    /// Good-till-cancelled limit order.
    pub limit_limit_gtc: LimitLimitGtc,
}

/// Good-till-cancelled limit order parameters.
#[derive(Serialize, Debug)]
pub struct LimitLimitGtc {
    /// Base size to place.
    pub base_size: Decimal,
    /// Limit price.
    pub limit_price: Decimal,
    /// Reject instead of crossing the spread.
    pub post_only: bool,
}

/// `POST /api/v3/brokerage/orders` response.
#[derive(Deserialize, Debug)]
pub struct CreateOrderRes {
    /// Whether the order was accepted.
    pub success: bool,
    /// Present on success.
    #[serde(default)]
    pub success_response: Option<CreateOrderSuccessRes>,
    /// Present on failure.
    #[serde(default)]
    pub error_response: Option<CreateOrderErrorRes>,
    /// Top-level failure reason on some error shapes.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Success payload of a create order call.
#[derive(Deserialize, Debug)]
pub struct CreateOrderSuccessRes {
    /// Assigned server order ID.
    pub order_id: String,
    /// Echoed client order ID.
    #[serde(default)]
    pub client_order_id: String,
}

/// Error payload of a create order call.
#[derive(Deserialize, Debug)]
pub struct CreateOrderErrorRes {
    /// Machine-readable failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

impl CreateOrderRes {
    /// The best failure description available in the response.
    #[must_use]
    pub fn failure(&self) -> String {
        if let Some(ref err) = self.error_response {
            if let Some(ref reason) = err.error {
                return reason.clone();
            }
            if let Some(ref message) = err.message {
                return message.clone();
            }
        }

        self.failure_reason
            .clone()
            .unwrap_or_else(|| "UNKNOWN_FAILURE_REASON".to_owned())
    }
}

/// `POST /api/v3/brokerage/orders/batch_cancel` body.
#[derive(Serialize, Debug)]
pub struct BatchCancelBody {
    /// Server order IDs to cancel.
    pub order_ids: Vec<String>,
}

/// `POST /api/v3/brokerage/orders/batch_cancel` response.
#[derive(Deserialize, Debug)]
pub struct BatchCancelRes {
    /// Per-order outcomes.
    #[serde(default)]
    pub results: Vec<CancelResultRes>,
}

/// One outcome within a batch cancel response.
#[derive(Deserialize, Debug)]
pub struct CancelResultRes {
    /// Whether the cancel was accepted.
    pub success: bool,
    /// The order the entry refers to.
    pub order_id: String,
    /// Failure reason when not successful.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Client → server websocket frame.
#[derive(Serialize, Debug)]
pub struct SubscribeMsg {
    /// `subscribe` or `unsubscribe`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Channel to change.
    pub channel: String,
    /// Products to add or remove.
    pub product_ids: Vec<String>,
    /// API key.
    pub api_key: String,
    /// Unix seconds as text.
    pub timestamp: String,
    /// HMAC signature of `timestamp ‖ channel ‖ product_ids`.
    pub signature: String,
}

/// Server → client websocket frame envelope.
#[derive(Deserialize, Debug, Clone)]
pub struct WsEnvelope {
    /// Originating channel.
    pub channel: String,
    /// Monotonic per-connection sequence number.
    #[serde(default)]
    pub sequence_num: u64,
    /// Frame timestamp, RFC3339-nano.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Channel-specific event payloads.
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

/// One event on the `ticker` channel.
#[derive(Deserialize, Debug)]
pub struct TickerEventRes {
    /// Updated tickers.
    #[serde(default)]
    pub tickers: Vec<TickerRes>,
}

/// One ticker inside a ticker event.
#[derive(Deserialize, Debug)]
pub struct TickerRes {
    /// Product the price belongs to.
    pub product_id: String,
    /// Last trade price.
    pub price: Decimal,
}

impl TickerRes {
    /// Normalize with the envelope timestamp.
    #[must_use]
    pub fn into_ticker(self, time: chrono::DateTime<Utc>) -> Ticker {
        Ticker {
            product_id: self.product_id,
            price: self.price,
            time,
        }
    }
}

/// One event on the `user` channel.
#[derive(Deserialize, Debug)]
pub struct UserEventRes {
    /// `snapshot` or `update`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Orders carried by the event.
    #[serde(default)]
    pub orders: Vec<UserOrderRes>,
}

/// One order as the `user` channel reports it.
#[derive(Deserialize, Debug)]
pub struct UserOrderRes {
    /// Server order ID.
    pub order_id: String,
    /// Client order ID used at creation.
    #[serde(default)]
    pub client_order_id: String,
    /// Product traded.
    pub product_id: String,
    /// `BUY` or `SELL`.
    pub order_side: String,
    /// Lifecycle status string.
    pub status: String,
    /// Cumulative executed base size.
    #[serde(default)]
    pub cumulative_quantity: Decimal,
    /// Average execution price.
    #[serde(default)]
    pub avg_price: Decimal,
    /// Cumulative fees.
    #[serde(default)]
    pub total_fees: Decimal,
    /// Creation timestamp, RFC3339.
    pub creation_time: String,
}

impl TryFrom<UserOrderRes> for OrderRecord {
    type Error = EngineError;

    fn try_from(value: UserOrderRes) -> Result<Self, Self::Error> {
        let status = parse_status(&value.status)?;

        Ok(OrderRecord {
            server_id: value.order_id,
            client_id: value.client_order_id,
            product_id: value.product_id,
            side: parse_side(&value.order_side)?,
            status,
            filled_size: value.cumulative_quantity,
            filled_price: value.avg_price,
            fee: value.total_fees,
            created_at: parse_rfc3339(&value.creation_time)?,
            finished_at: None,
            done_reason: None,
            last_fill_time: None,
        })
    }
}

fn parse_side(value: &str) -> Result<Side, EngineError> {
    match value {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(EngineError::invalid(format!("unknown order side {other:?}"))),
    }
}

fn parse_status(value: &str) -> Result<OrderStatus, EngineError> {
    match value {
        "PENDING" | "QUEUED" => Ok(OrderStatus::Pending),
        "OPEN" | "CANCEL_QUEUED" => Ok(OrderStatus::Open),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELLED" => Ok(OrderStatus::Cancelled),
        "EXPIRED" => Ok(OrderStatus::Expired),
        "FAILED" => Ok(OrderStatus::Failed),
        other => Err(EngineError::invalid(format!("unknown order status {other:?}"))),
    }
}

/// The query value the exchange expects for an [`OrderStatus`].
#[must_use]
pub fn status_query_value(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "PENDING",
        OrderStatus::Open => "OPEN",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Expired => "EXPIRED",
        OrderStatus::Failed => "FAILED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_order_normalizes() {
        let raw: UserOrderRes = serde_json::from_str(
            r#"{
                "order_id": "srv-1",
                "client_order_id": "cli-1",
                "product_id": "BTC-USD",
                "order_side": "BUY",
                "status": "OPEN",
                "cumulative_quantity": "0.5",
                "avg_price": "100.25",
                "total_fees": "0.1",
                "creation_time": "2024-01-02T03:04:05.123456789Z"
            }"#,
        )
        .unwrap();

        let order = OrderRecord::try_from(raw).unwrap();
        assert_eq!(order.server_id, "srv-1");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.status, OrderStatus::Open);
        assert!(!order.done());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let raw = UserOrderRes {
            order_id: "srv".into(),
            client_order_id: "cli".into(),
            product_id: "BTC-USD".into(),
            order_side: "BUY".into(),
            status: "HALF_OPEN".into(),
            cumulative_quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            creation_time: "2024-01-02T03:04:05Z".into(),
        };

        assert!(OrderRecord::try_from(raw).is_err());
    }
}
