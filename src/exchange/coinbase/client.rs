//! Rate-limited signed REST client.

use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::EngineError;
use crate::exchange::coinbase::data::{
    status_query_value, BatchCancelBody, BatchCancelRes, CandlesRes, CreateOrderBody,
    CreateOrderRes, FillsRes, GetOrderRes, LimitLimitGtc, ListOrdersRes, OrderConfiguration,
    ProductsRes,
};
use crate::exchange::coinbase::sign::{measure_time_adjustment, sign_request};
use crate::exchange::{
    Candle, CancelOutcome, CreateOrderRequest, Fill, OrderRecord, OrderStatus, Page, Product,
};
use crate::utils::config::Config;

/// Shared REST budget: roughly 25 requests per second, no bursting.
const REQUESTS_PER_SECOND: u32 = 25;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A signed Coinbase Advanced Trade REST client.
///
/// Construction measures the offset between the local clock and the
/// server clock and fails when it exceeds the configured maximum, so a
/// machine with a broken clock never signs a request.
pub struct RestClient {
    http: reqwest::Client,
    base_url: url::Url,
    api_key: String,
    secret_key: String,
    time_adjustment: chrono::Duration,
    limiter: DirectLimiter,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("time_adjustment", &self.time_adjustment)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Build a client from the config, measuring the clock adjustment.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::FatalInit`] when credentials are
    /// missing, the clock cannot be sampled, or the measured adjustment
    /// exceeds `max_time_adjustment`.
    pub async fn connect(config: &Config) -> Result<Self, EngineError> {
        let Some(ref api_key) = config.api_key else {
            return Err(EngineError::FatalInit("api_key is not set".to_owned()));
        };
        let Some(ref secret_key) = config.secret_key else {
            return Err(EngineError::FatalInit("secret_key is not set".to_owned()));
        };

        let http = reqwest::Client::builder()
            .timeout(config.http_client_timeout)
            .build()
            .map_err(|err| EngineError::FatalInit(format!("http client: {err}")))?;

        let base_url = url::Url::parse(&config.rest_url())
            .map_err(|err| EngineError::FatalInit(format!("rest hostname: {err}")))?;
        let time_adjustment = measure_time_adjustment(&http, &base_url).await?;

        let max_adjustment = chrono::Duration::from_std(config.max_time_adjustment)
            .map_err(|err| EngineError::FatalInit(format!("max_time_adjustment: {err}")))?;
        if time_adjustment.abs() > max_adjustment {
            return Err(EngineError::FatalInit(format!(
                "local clock is {time_adjustment} away from the server clock, max allowed {max_adjustment}"
            )));
        }

        log::info!("coinbase REST client ready, time adjustment {time_adjustment}");

        let quota = Quota::per_second(
            NonZeroU32::new(REQUESTS_PER_SECOND).expect("requests per second is non-zero"),
        )
        .allow_burst(NonZeroU32::new(1).expect("burst is non-zero"));

        Ok(Self {
            http,
            base_url,
            api_key: api_key.clone(),
            secret_key: secret_key.clone(),
            time_adjustment,
            limiter: RateLimiter::direct(quota),
        })
    }

    /// The measured local-minus-server clock offset.
    #[must_use]
    pub fn time_adjustment(&self) -> chrono::Duration {
        self.time_adjustment
    }

    /// Unix seconds on the server clock, derived from the local clock
    /// and the measured adjustment.
    #[must_use]
    pub fn server_timestamp(&self) -> i64 {
        (Utc::now() - self.time_adjustment).timestamp()
    }

    /// Credentials for signing websocket frames: `(api_key, secret_key)`.
    #[must_use]
    pub(crate) fn ws_credentials(&self) -> (String, String) {
        (self.api_key.clone(), self.secret_key.clone())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, EngineError> {
        self.limiter.until_ready().await;

        let timestamp = self.server_timestamp();
        let signature = sign_request(&self.secret_key, timestamp, "GET", path, "");

        let endpoint = self
            .base_url
            .join(path)
            .map_err(|err| EngineError::invalid(format!("request path {path}: {err}")))?;
        let response = self
            .http
            .get(endpoint)
            .query(query)
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp.to_string())
            .send()
            .await?;

        Self::decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, EngineError> {
        self.limiter.until_ready().await;

        let raw_body = serde_json::to_string(body)?;
        let timestamp = self.server_timestamp();
        let signature = sign_request(&self.secret_key, timestamp, "POST", path, &raw_body);

        let endpoint = self
            .base_url
            .join(path)
            .map_err(|err| EngineError::invalid(format!("request path {path}: {err}")))?;
        let response = self
            .http
            .post(endpoint)
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(raw_body)
            .send()
            .await?;

        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(EngineError::transient(format!("http {status}: {body}")));
        }
        if status.as_u16() == 404 {
            return Err(EngineError::NotFound(body));
        }

        Err(EngineError::invalid(format!("http {status}: {body}")))
    }

    /// All spot products currently listed.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] on wire failures.
    pub async fn get_products(&self) -> Result<Vec<Product>, EngineError> {
        let res: ProductsRes = self
            .get(
                "/api/v3/brokerage/products",
                &[("product_type", "SPOT".to_owned())],
            )
            .await?;

        Ok(res.products.into_iter().map(Product::from).collect())
    }

    /// One-minute candles for `product_id` within `[start, end)`.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] on wire failures and
    /// [`EngineError::Invalid`] when a candle timestamp is malformed.
    pub async fn get_candles(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, EngineError> {
        let res: CandlesRes = self
            .get(
                &format!("/api/v3/brokerage/products/{product_id}/candles"),
                &[
                    ("start", start.timestamp().to_string()),
                    ("end", end.timestamp().to_string()),
                    ("granularity", "ONE_MINUTE".to_owned()),
                ],
            )
            .await?;

        let mut candles = res
            .candles
            .into_iter()
            .map(Candle::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        candles.sort_by_key(|candle| candle.start);

        Ok(candles)
    }

    /// Fetch one order by server ID.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] when the exchange does not
    /// know the ID and [`EngineError::Transient`] on wire failures.
    pub async fn get_order(&self, server_id: &str) -> Result<OrderRecord, EngineError> {
        let res: GetOrderRes = self
            .get(
                &format!("/api/v3/brokerage/orders/historical/{server_id}"),
                &[],
            )
            .await?;

        OrderRecord::try_from(res.order)
    }

    /// One page of historical orders.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] on wire failures.
    pub async fn list_orders(
        &self,
        statuses: &[OrderStatus],
        start: DateTime<Utc>,
        cursor: Option<String>,
    ) -> Result<Page<OrderRecord>, EngineError> {
        let mut query: Vec<(&str, String)> = vec![("start_date", start.to_rfc3339())];
        for status in statuses {
            query.push(("order_status", status_query_value(*status).to_owned()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let res: ListOrdersRes = self
            .get("/api/v3/brokerage/orders/historical/batch", &query)
            .await?;

        let mut items = Vec::with_capacity(res.orders.len());
        for raw in res.orders {
            match OrderRecord::try_from(raw) {
                Ok(order) => items.push(order),
                // A malformed historical order must not wedge the poll loop.
                Err(err) => log::warn!("Skipping malformed order in listing: {err}"),
            }
        }

        Ok(Page {
            items,
            cursor: res.cursor.filter(|_| res.has_next),
        })
    }

    /// One page of fills after `start`.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] on wire failures.
    pub async fn list_fills(
        &self,
        start: DateTime<Utc>,
        cursor: Option<String>,
    ) -> Result<Page<Fill>, EngineError> {
        let mut query: Vec<(&str, String)> =
            vec![("start_sequence_timestamp", start.to_rfc3339())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let res: FillsRes = self
            .get("/api/v3/brokerage/orders/historical/fills", &query)
            .await?;

        let mut items = Vec::with_capacity(res.fills.len());
        for raw in res.fills {
            match Fill::try_from(raw) {
                Ok(fill) => items.push(fill),
                Err(err) => log::warn!("Skipping malformed fill in listing: {err}"),
            }
        }

        Ok(Page {
            items,
            cursor: res.cursor,
        })
    }

    /// Submit a post-only limit order.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] when the exchange rejects the
    /// order and [`EngineError::Transient`] on wire failures.
    pub async fn create_order(
        &self,
        req: &CreateOrderRequest,
    ) -> Result<OrderRecord, EngineError> {
        let body = CreateOrderBody {
            client_order_id: req.client_id.clone(),
            product_id: req.product_id.clone(),
            side: req.side.to_string(),
            order_configuration: OrderConfiguration {
                limit_limit_gtc: LimitLimitGtc {
                    base_size: req.base_size,
                    limit_price: req.limit_price,
                    post_only: req.post_only,
                },
            },
        };

        let res: CreateOrderRes = self.post("/api/v3/brokerage/orders", &body).await?;
        if !res.success {
            return Err(EngineError::invalid(format!(
                "create order rejected: {}",
                res.failure()
            )));
        }

        let Some(success) = res.success_response else {
            return Err(EngineError::transient(
                "create order succeeded without a server order ID",
            ));
        };

        Ok(OrderRecord {
            server_id: success.order_id,
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
        })
    }

    /// Cancel a batch of orders. `DUPLICATE_CANCEL_REQUEST` is treated
    /// as success.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] on wire failures.
    pub async fn cancel_orders(
        &self,
        server_ids: &[String],
    ) -> Result<Vec<CancelOutcome>, EngineError> {
        let body = BatchCancelBody {
            order_ids: server_ids.to_vec(),
        };
        let res: BatchCancelRes = self
            .post("/api/v3/brokerage/orders/batch_cancel", &body)
            .await?;

        Ok(res
            .results
            .into_iter()
            .map(|result| {
                let duplicate = result.failure_reason.as_deref() == Some("DUPLICATE_CANCEL_REQUEST");
                CancelOutcome {
                    server_id: result.order_id,
                    success: result.success || duplicate,
                    failure_reason: result.failure_reason.filter(|_| !duplicate),
                }
            })
            .collect())
    }
}
