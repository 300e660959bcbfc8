//! The abstract exchange contract and normalized data types.
//!
//! Supervisors and the reconciliation layer only ever speak this
//! interface; the Coinbase adapter in [`coinbase`] is one implementation
//! and the test suite provides an in-memory one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::point::Side;
use crate::topic::Subscription;

pub mod coinbase;

/// A spot product (trading pair) listed on the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Exchange product identifier, e.g. `BTC-USD`.
    pub product_id: String,
    /// Smallest allowed order size in base units.
    pub base_min_size: Decimal,
    /// Largest allowed order size in base units.
    pub base_max_size: Decimal,
    /// Base size quantum.
    pub base_increment: Decimal,
    /// Price quantum.
    pub quote_increment: Decimal,
}

/// One minute of price history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Start of the minute.
    pub start: DateTime<Utc>,
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

/// A normalized ticker update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    /// Product the price belongs to.
    pub product_id: String,
    /// Last trade price.
    pub price: Decimal,
    /// Exchange timestamp of the update.
    pub time: DateTime<Utc>,
}

/// A single (possibly partial) execution against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Server order ID the fill belongs to.
    pub order_id: String,
    /// When the trade printed.
    pub trade_time: DateTime<Utc>,
    /// Execution price.
    pub price: Decimal,
    /// Executed base size.
    pub size: Decimal,
    /// Fee charged in quote units.
    pub fee: Decimal,
    /// Taker side of the trade.
    pub side: Side,
}

/// Exchange-side order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Accepted but not yet on the book; cancellation is rejected here.
    Pending,
    /// Resting on the book.
    Open,
    /// Fully executed.
    Filled,
    /// Cancelled by us or the exchange.
    Cancelled,
    /// Expired server-side.
    Expired,
    /// Rejected or failed server-side.
    Failed,
}

impl OrderStatus {
    /// Whether the order can no longer change.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Failed
        )
    }

    /// Whether the order has left the transient PENDING window, i.e. it
    /// is now safe to cancel.
    #[must_use]
    pub fn is_ready(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// Our view of one exchange order, updated exclusively by the
/// reconciliation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Exchange-assigned identifier.
    pub server_id: String,
    /// Caller-chosen identifier used for deduplication.
    pub client_id: String,
    /// Product the order trades.
    pub product_id: String,
    /// Order side.
    pub side: Side,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Cumulative executed base size.
    pub filled_size: Decimal,
    /// Average execution price.
    pub filled_price: Decimal,
    /// Cumulative fees in quote units.
    pub fee: Decimal,
    /// When the order was created on the exchange.
    pub created_at: DateTime<Utc>,
    /// When the order reached a done status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exchange-reported reason for the done status.
    pub done_reason: Option<String>,
    /// Time of the most recent fill, used to bucket saved orders.
    pub last_fill_time: Option<DateTime<Utc>>,
}

impl OrderRecord {
    /// Whether the order can no longer change.
    #[must_use]
    pub fn done(&self) -> bool {
        self.status.is_done()
    }
}

/// Request to place a post-only limit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Deterministic caller-chosen ID; retries reuse the same value.
    pub client_id: String,
    /// Product to trade.
    pub product_id: String,
    /// Order side.
    pub side: Side,
    /// Base size to place.
    pub base_size: Decimal,
    /// Limit price.
    pub limit_price: Decimal,
    /// Reject instead of crossing the spread.
    pub post_only: bool,
}

/// Result of one entry in a batch cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// Server order ID the entry refers to.
    pub server_id: String,
    /// Whether the exchange accepted the cancel.
    pub success: bool,
    /// Exchange failure reason when not successful.
    pub failure_reason: Option<String>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Entries of this page.
    pub items: Vec<T>,
    /// Cursor of the next page, when one exists.
    pub cursor: Option<String>,
}

/// The abstract exchange surface the engine is written against.
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    /// All spot products currently listed.
    async fn get_products(&self) -> Result<Vec<Product>, EngineError>;

    /// One-minute candles for `product_id` in `[start, end)`; the
    /// exchange caps one call at 300 candles.
    async fn get_candles(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, EngineError>;

    /// Fetch one order by server ID.
    async fn get_order(&self, server_id: &str) -> Result<OrderRecord, EngineError>;

    /// Orders whose status is in `statuses`, created or finalized after
    /// `start`, one page at a time.
    async fn list_orders(
        &self,
        statuses: &[OrderStatus],
        start: DateTime<Utc>,
        cursor: Option<String>,
    ) -> Result<Page<OrderRecord>, EngineError>;

    /// Fills after `start`, one page at a time.
    async fn list_fills(
        &self,
        start: DateTime<Utc>,
        cursor: Option<String>,
    ) -> Result<Page<Fill>, EngineError>;

    /// Submit a limit order. A success response carries the server ID;
    /// the returned record is typically still PENDING.
    async fn create_order(&self, req: &CreateOrderRequest) -> Result<OrderRecord, EngineError>;

    /// Cancel a batch of orders. `DUPLICATE_CANCEL_REQUEST` from the
    /// exchange is reported as success.
    async fn cancel_orders(&self, server_ids: &[String]) -> Result<Vec<CancelOutcome>, EngineError>;

    /// Subscribe to ticker updates for `product_id`, registering the
    /// product on the websocket when necessary. The subscription holds
    /// the latest value only and primes new subscribers with it.
    async fn watch_tickers(&self, product_id: &str) -> Subscription<Ticker>;

    /// Subscribe to the normalized user-order event stream.
    async fn watch_orders(&self) -> Subscription<OrderRecord>;
}
