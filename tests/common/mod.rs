//! Shared test fixtures: an in-memory exchange and store helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use gridbot::error::EngineError;
use gridbot::exchange::{
    Candle, CancelOutcome, CreateOrderRequest, Exchange, Fill, OrderRecord, OrderStatus, Page,
    Product, Ticker,
};
use gridbot::topic::{Subscription, Topic};
use gridbot::utils::config::Config;

/// The product every test trades.
pub fn product() -> Product {
    Product {
        product_id: "BTC-USD".to_owned(),
        base_min_size: dec!(0.01),
        base_max_size: dec!(10000),
        base_increment: dec!(0.0001),
        quote_increment: dec!(0.01),
    }
}

/// A config with intervals tightened for tests.
pub fn config() -> Config {
    Config {
        poll_orders_retry_interval: Duration::from_millis(50),
        fetch_candles_interval: Duration::from_secs(3600),
        fetch_products_interval: Duration::from_secs(3600),
        ..Config::default()
    }
}

/// An in-memory exchange driving the engine in tests.
///
/// Orders are created PENDING and flipped OPEN immediately (like the
/// real exchange's transient window resolving); fills happen on demand
/// via [`MockExchange::fill_order`].
pub struct MockExchange {
    products: Vec<Product>,
    orders: Mutex<HashMap<String, OrderRecord>>,
    by_client: Mutex<HashMap<String, String>>,
    // Orders only visible through the historical listing, to exercise
    // the REST fallback path.
    listed_only: Mutex<Vec<OrderRecord>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    duplicate_creates: AtomicUsize,
    cancelled: AtomicUsize,
    fail_next_create: AtomicBool,
    suppress_websocket: AtomicBool,
    ticker_topics: DashMap<String, Arc<Topic<Ticker>>>,
    order_topic: Topic<OrderRecord>,
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            products: vec![product()],
            orders: Mutex::new(HashMap::new()),
            by_client: Mutex::new(HashMap::new()),
            listed_only: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            duplicate_creates: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            fail_next_create: AtomicBool::new(false),
            suppress_websocket: AtomicBool::new(false),
            ticker_topics: DashMap::new(),
            order_topic: Topic::new(),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn duplicate_create_count(&self) -> usize {
        self.duplicate_creates.load(Ordering::SeqCst)
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Make the next create fail with a transient error.
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Stop publishing order updates on the websocket topic; updates
    /// remain visible via `get_order` and the historical listing.
    pub fn suppress_websocket(&self, on: bool) {
        self.suppress_websocket.store(on, Ordering::SeqCst);
    }

    /// Server IDs of every order created, oldest first.
    pub fn server_ids(&self) -> Vec<String> {
        let orders = self.orders.lock().unwrap();
        let mut ids: Vec<String> = orders.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The most recently created live order, if any.
    pub fn live_order(&self) -> Option<OrderRecord> {
        let orders = self.orders.lock().unwrap();
        orders.values().find(|order| !order.done()).cloned()
    }

    /// Publish a ticker.
    pub fn push_ticker(&self, product_id: &str, price: Decimal) {
        let topic = self
            .ticker_topics
            .entry(product_id.to_owned())
            .or_insert_with(|| Arc::new(Topic::new()))
            .clone();
        topic.publish(Ticker {
            product_id: product_id.to_owned(),
            price,
            time: Utc::now(),
        });
    }

    /// Fully fill an order and publish the update.
    pub fn fill_order(&self, server_id: &str, size: Decimal, price: Decimal) {
        let update = {
            let mut orders = self.orders.lock().unwrap();
            let order = orders.get_mut(server_id).expect("unknown order");
            order.status = OrderStatus::Filled;
            order.filled_size = size;
            order.filled_price = price;
            order.fee = price * size * dec!(0.001);
            order.last_fill_time = Some(Utc::now());
            order.finished_at = Some(Utc::now());
            order.clone()
        };
        self.publish_order(update);
    }

    /// Seed an order that only the historical listing returns.
    pub fn seed_listed_order(&self, order: OrderRecord) {
        self.listed_only.lock().unwrap().push(order);
    }

    fn publish_order(&self, order: OrderRecord) {
        if !self.suppress_websocket.load(Ordering::SeqCst) {
            self.order_topic.publish(order);
        }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_products(&self) -> Result<Vec<Product>, EngineError> {
        Ok(self.products.clone())
    }

    async fn get_candles(
        &self,
        _product_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, EngineError> {
        Ok(Vec::new())
    }

    async fn get_order(&self, server_id: &str) -> Result<OrderRecord, EngineError> {
        self.orders
            .lock()
            .unwrap()
            .get(server_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("order {server_id}")))
    }

    async fn list_orders(
        &self,
        statuses: &[OrderStatus],
        _start: DateTime<Utc>,
        _cursor: Option<String>,
    ) -> Result<Page<OrderRecord>, EngineError> {
        let mut items: Vec<OrderRecord> = self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|order| statuses.contains(&order.status))
            .cloned()
            .collect();
        items.extend(
            self.listed_only
                .lock()
                .unwrap()
                .iter()
                .filter(|order| statuses.contains(&order.status))
                .cloned(),
        );

        Ok(Page {
            items,
            cursor: None,
        })
    }

    async fn list_fills(
        &self,
        _start: DateTime<Utc>,
        _cursor: Option<String>,
    ) -> Result<Page<Fill>, EngineError> {
        Ok(Page {
            items: Vec::new(),
            cursor: None,
        })
    }

    async fn create_order(&self, req: &CreateOrderRequest) -> Result<OrderRecord, EngineError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(EngineError::transient("injected create failure"));
        }

        // The engine must never resubmit a known client ID; count it if
        // it ever does.
        let existing_server_id = self
            .by_client
            .lock()
            .unwrap()
            .get(&req.client_id)
            .cloned();
        if let Some(server_id) = existing_server_id {
            self.duplicate_creates.fetch_add(1, Ordering::SeqCst);
            return self.get_order(&server_id).await;
        }

        let server_id = format!("srv-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let order = OrderRecord {
            server_id: server_id.clone(),
            client_id: req.client_id.clone(),
            product_id: req.product_id.clone(),
            side: req.side,
            status: OrderStatus::Pending,
            filled_size: Decimal::ZERO,
            filled_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            created_at: Utc::now(),
            finished_at: None,
            done_reason: None,
            last_fill_time: None,
        };

        self.orders
            .lock()
            .unwrap()
            .insert(server_id.clone(), order.clone());
        self.by_client
            .lock()
            .unwrap()
            .insert(req.client_id.clone(), server_id.clone());
        self.created.fetch_add(1, Ordering::SeqCst);

        // The transient PENDING window resolves immediately.
        let open = {
            let mut orders = self.orders.lock().unwrap();
            let entry = orders.get_mut(&server_id).unwrap();
            entry.status = OrderStatus::Open;
            entry.clone()
        };
        self.publish_order(open);

        Ok(order)
    }

    async fn cancel_orders(&self, server_ids: &[String]) -> Result<Vec<CancelOutcome>, EngineError> {
        let mut outcomes = Vec::with_capacity(server_ids.len());
        for server_id in server_ids {
            let update = {
                let mut orders = self.orders.lock().unwrap();
                match orders.get_mut(server_id) {
                    Some(order) if !order.done() => {
                        order.status = OrderStatus::Cancelled;
                        order.finished_at = Some(Utc::now());
                        Some(order.clone())
                    }
                    Some(_) => None,
                    None => {
                        outcomes.push(CancelOutcome {
                            server_id: server_id.clone(),
                            success: false,
                            failure_reason: Some("UNKNOWN_CANCEL_ORDER".to_owned()),
                        });
                        continue;
                    }
                }
            };

            if let Some(update) = update {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                self.publish_order(update);
            }
            outcomes.push(CancelOutcome {
                server_id: server_id.clone(),
                success: true,
                failure_reason: None,
            });
        }

        Ok(outcomes)
    }

    async fn watch_tickers(&self, product_id: &str) -> Subscription<Ticker> {
        self.ticker_topics
            .entry(product_id.to_owned())
            .or_insert_with(|| Arc::new(Topic::new()))
            .subscribe(1, true)
    }

    async fn watch_orders(&self) -> Subscription<OrderRecord> {
        self.order_topic.subscribe_unbounded()
    }
}

/// Poll until `check` passes or the timeout expires.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}
