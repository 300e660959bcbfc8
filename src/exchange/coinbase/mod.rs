//! Coinbase Advanced Trade adapter.
//!
//! [`Coinbase`] combines the signed REST client and the multiplexed
//! websocket behind the crate's abstract [`Exchange`] contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::exchange::{
    Candle, CancelOutcome, CreateOrderRequest, Exchange, Fill, OrderRecord, OrderStatus, Page,
    Product, Ticker,
};
use crate::shutdown::StopToken;
use crate::topic::Subscription;
use crate::utils::config::Config;

pub mod client;
pub mod data;
pub mod sign;
mod websocket;

use client::RestClient;
use websocket::{Subscriptions, WsTopics, CHANNEL_HEARTBEATS, CHANNEL_TICKER, CHANNEL_USER};

/// The Coinbase exchange adapter.
#[derive(Debug)]
pub struct Coinbase {
    rest: RestClient,
    subscriptions: Arc<Subscriptions>,
    topics: Arc<WsTopics>,
    websocket_task: JoinHandle<()>,
}

impl Coinbase {
    /// Connect the adapter: build the signed REST client (measuring the
    /// server clock) and start the websocket maintenance task.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::FatalInit`] when credentials are
    /// missing or the local clock diverges beyond the configured bound.
    pub async fn connect(config: &Config, stop: StopToken) -> Result<Self, EngineError> {
        let rest = RestClient::connect(config).await?;

        let subscriptions = Arc::new(Subscriptions::default());
        let topics = Arc::new(WsTopics::default());

        subscriptions.add(CHANNEL_HEARTBEATS, &[]);
        if !config.watch_product_ids.is_empty() {
            subscriptions.add(CHANNEL_TICKER, &config.watch_product_ids);
            subscriptions.add(CHANNEL_USER, &config.watch_product_ids);
        }

        let (api_key, secret_key) = rest.ws_credentials();
        let websocket_task = websocket::spawn(
            config,
            api_key,
            secret_key,
            Arc::clone(&subscriptions),
            Arc::clone(&topics),
            stop,
        );

        Ok(Self {
            rest,
            subscriptions,
            topics,
            websocket_task,
        })
    }

    /// The measured local-minus-server clock offset.
    #[must_use]
    pub fn time_adjustment(&self) -> chrono::Duration {
        self.rest.time_adjustment()
    }

    /// Wait for the websocket task to finish after its stop token fired.
    pub async fn join(self) {
        if let Err(err) = self.websocket_task.await {
            log::warn!("Websocket task ended abnormally: {err}");
        }
    }
}

#[async_trait]
impl Exchange for Coinbase {
    async fn get_products(&self) -> Result<Vec<Product>, EngineError> {
        self.rest.get_products().await
    }

    async fn get_candles(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, EngineError> {
        self.rest.get_candles(product_id, start, end).await
    }

    async fn get_order(&self, server_id: &str) -> Result<OrderRecord, EngineError> {
        self.rest.get_order(server_id).await
    }

    async fn list_orders(
        &self,
        statuses: &[OrderStatus],
        start: DateTime<Utc>,
        cursor: Option<String>,
    ) -> Result<Page<OrderRecord>, EngineError> {
        self.rest.list_orders(statuses, start, cursor).await
    }

    async fn list_fills(
        &self,
        start: DateTime<Utc>,
        cursor: Option<String>,
    ) -> Result<Page<Fill>, EngineError> {
        self.rest.list_fills(start, cursor).await
    }

    async fn create_order(&self, req: &CreateOrderRequest) -> Result<OrderRecord, EngineError> {
        self.rest.create_order(req).await
    }

    async fn cancel_orders(&self, server_ids: &[String]) -> Result<Vec<CancelOutcome>, EngineError> {
        self.rest.cancel_orders(server_ids).await
    }

    async fn watch_tickers(&self, product_id: &str) -> Subscription<Ticker> {
        let products = [product_id.to_owned()];
        self.subscriptions.add(CHANNEL_TICKER, &products);
        self.subscriptions.add(CHANNEL_USER, &products);

        self.topics.tickers(product_id).subscribe(1, true)
    }

    async fn watch_orders(&self) -> Subscription<OrderRecord> {
        self.topics.orders().subscribe_unbounded()
    }
}
