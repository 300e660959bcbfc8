//! Crate config module.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The config of the engine, this is passed often through the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User API key.
    pub api_key: Option<String>,
    /// User secret.
    pub secret_key: Option<String>,
    /// REST API hostname.
    pub rest_hostname: String,
    /// Websocket API hostname.
    pub websocket_hostname: String,
    /// Timeout applied to every REST request.
    pub http_client_timeout: Duration,
    /// Pause between websocket reconnect attempts.
    pub websocket_retry_interval: Duration,
    /// Maximum tolerated offset between the local and the server clock;
    /// startup fails beyond it.
    pub max_time_adjustment: Duration,
    /// How many messages a ticker stream may run ahead of a sequence gap
    /// before the connection is considered lost and reset.
    pub max_websocket_out_of_order_allowance: u64,
    /// Pause between REST order polling sweeps.
    pub poll_orders_retry_interval: Duration,
    /// Pause between product catalog refreshes.
    pub fetch_products_interval: Duration,
    /// Pause between candle sync sweeps.
    pub fetch_candles_interval: Duration,
    /// Products whose order stream and candles are always watched.
    pub watch_product_ids: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            secret_key: None,
            rest_hostname: "api.coinbase.com".to_owned(),
            websocket_hostname: "advanced-trade-ws.coinbase.com".to_owned(),
            http_client_timeout: Duration::from_secs(30),
            websocket_retry_interval: Duration::from_secs(5),
            max_time_adjustment: Duration::from_secs(60),
            max_websocket_out_of_order_allowance: 100,
            poll_orders_retry_interval: Duration::from_secs(5),
            fetch_products_interval: Duration::from_secs(3600),
            fetch_candles_interval: Duration::from_secs(300),
            watch_product_ids: Vec::new(),
        }
    }
}

impl Config {
    /// The base REST URL implied by the hostname.
    #[must_use]
    pub fn rest_url(&self) -> String {
        format!("https://{}", self.rest_hostname)
    }

    /// The websocket URL implied by the hostname.
    #[must_use]
    pub fn websocket_url(&self) -> String {
        format!("wss://{}", self.websocket_hostname)
    }
}
