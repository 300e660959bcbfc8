//! Single-price-point limit order supervisor.
//!
//! A Limiter drives one [`Point`] to completion across an unbounded
//! number of create/cancel cycles: it places a limit order while the
//! ticker is on the favorable side of the cancel threshold, pulls the
//! order when the ticker crosses it, and reissues with the next
//! deterministic client ID until the point's size is filled.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::exchange::{CreateOrderRequest, OrderRecord, Product};
use crate::ids::IdStream;
use crate::point::{Point, Side};
use crate::reconcile::{merge_order, Tracker};
use crate::shutdown::StopToken;
use crate::store::{keys, Store};

/// How often a dirty limiter checkpoints to the store.
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// The persisted shape of a limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterState {
    /// Product the limiter trades.
    pub product_id: String,
    /// The price point being worked.
    pub point: Point,
    /// Next client-ID offset.
    pub id_offset: u64,
    /// Every order this limiter has issued, by server ID.
    pub order_map: BTreeMap<String, OrderRecord>,
    /// Client ID → server ID for the issued orders.
    pub client_server: BTreeMap<String, String>,
}

/// A single-price-point limit order supervisor.
#[derive(Debug)]
pub struct Limiter {
    uid: String,
    product: Product,
    point: Point,
    side: Side,
    ids: IdStream,
    order_map: BTreeMap<String, OrderRecord>,
    client_server: BTreeMap<String, String>,
    active: Option<String>,
    dirty: bool,
}

impl Limiter {
    /// A fresh limiter for `point` on `product`.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] when the point is invalid.
    pub fn new(uid: impl Into<String>, product: Product, point: Point) -> Result<Self, EngineError> {
        point.check()?;
        let uid = uid.into();
        let ids = IdStream::new(uid.clone(), 0);
        let side = point.side();

        Ok(Self {
            uid,
            product,
            point,
            side,
            ids,
            order_map: BTreeMap::new(),
            client_server: BTreeMap::new(),
            active: None,
            dirty: true,
        })
    }

    /// Load a limiter from its checkpoint.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] when no checkpoint exists
    /// and [`EngineError::Invariant`] when the checkpoint holds more
    /// than one live order.
    pub async fn load(store: &Store, uid: &str, product: Product) -> Result<Self, EngineError> {
        let Some(state) = store.get::<LimiterState>(&keys::limiter(uid)).await? else {
            return Err(EngineError::NotFound(format!("limiter {uid}")));
        };
        if state.product_id != product.product_id {
            return Err(EngineError::invalid(format!(
                "limiter {uid} was created for {}, not {}",
                state.product_id, product.product_id
            )));
        }

        let mut limiter = Self {
            uid: uid.to_owned(),
            product,
            side: state.point.side(),
            point: state.point,
            ids: IdStream::new(uid, state.id_offset),
            order_map: state.order_map,
            client_server: state.client_server,
            active: None,
            dirty: false,
        };
        limiter.recover_active()?;

        Ok(limiter)
    }

    /// Load the limiter if a checkpoint exists, otherwise create one.
    ///
    /// # Errors
    ///
    /// See [`Limiter::load`] and [`Limiter::new`].
    pub async fn load_or_create(
        store: &Store,
        uid: &str,
        product: Product,
        point: Point,
    ) -> Result<Self, EngineError> {
        match Self::load(store, uid, product.clone()).await {
            Ok(limiter) => Ok(limiter),
            Err(EngineError::NotFound(_)) => Self::new(uid, product, point),
            Err(err) => Err(err),
        }
    }

    /// The limiter's uid.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The point being worked.
    #[must_use]
    pub fn point(&self) -> Point {
        self.point
    }

    /// Total filled size across every issued order.
    #[must_use]
    pub fn filled_size(&self) -> Decimal {
        self.order_map
            .values()
            .map(|order| order.filled_size)
            .sum()
    }

    /// Total fees across every issued order.
    #[must_use]
    pub fn fees(&self) -> Decimal {
        self.order_map.values().map(|order| order.fee).sum()
    }

    /// Size still unfilled; zero once the point is complete.
    #[must_use]
    pub fn pending(&self) -> Decimal {
        (self.point.size - self.filled_size()).max(Decimal::ZERO)
    }

    /// The persisted shape of the current state.
    #[must_use]
    pub fn state(&self) -> LimiterState {
        LimiterState {
            product_id: self.product.product_id.clone(),
            point: self.point,
            id_offset: self.ids.offset(),
            order_map: self.order_map.clone(),
            client_server: self.client_server.clone(),
        }
    }

    /// Checkpoint the state to the store.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] when the write fails.
    pub async fn save(&mut self, store: &Store) -> Result<(), EngineError> {
        store.set(&keys::limiter(&self.uid), &self.state()).await?;
        self.dirty = false;

        Ok(())
    }

    // Re-derive the active order reference from the order map, enforcing
    // the at-most-one-live invariant.
    fn recover_active(&mut self) -> Result<(), EngineError> {
        let live: Vec<&String> = self
            .order_map
            .iter()
            .filter(|(_, order)| !order.done())
            .map(|(server_id, _)| server_id)
            .collect();

        match live.as_slice() {
            [] => {
                self.active = None;
                Ok(())
            }
            [server_id] => {
                self.active = Some((*server_id).clone());
                Ok(())
            }
            many => Err(EngineError::Invariant(format!(
                "limiter {} holds {} live orders: {:?}",
                self.uid,
                many.len(),
                many
            ))),
        }
    }

    /// Run the limiter until the point is complete or the stop token
    /// fires.
    ///
    /// Transient exchange failures propagate to the caller, which is
    /// expected to retry after a backoff; the in-memory state survives
    /// the retry.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] on exchange failures,
    /// [`EngineError::Stopped`] when asked to stop, and
    /// [`EngineError::Invariant`] when the at-most-one-live invariant is
    /// violated.
    pub async fn run(
        &mut self,
        stop: &StopToken,
        tracker: &Tracker,
        store: &Store,
    ) -> Result<(), EngineError> {
        self.recover_active()?;

        // Re-publish our persisted orders so the reconciliation maps are
        // warm after a restart and a retried client ID resolves without
        // touching the exchange.
        for order in self.order_map.values() {
            tracker.dispatch_order(order.clone());
        }

        let mut tickers = tracker.watch_tickers(&self.product.product_id).await;
        let mut orders = tracker.subscribe_product(&self.product.product_id);
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.pending() > Decimal::ZERO {
            tokio::select! {
                () = stop.stopped() => return self.stop_cleanup(stop, tracker, store).await,
                ticker = tickers.recv() => {
                    let Some(ticker) = ticker else {
                        return Err(EngineError::transient("ticker feed closed"));
                    };
                    self.handle_ticker(stop, ticker.price, tracker, store).await?;
                }
                update = orders.recv() => {
                    let Some(update) = update else {
                        return Err(EngineError::transient("order feed closed"));
                    };
                    self.handle_order(&update);
                }
                _ = flush.tick() => {
                    if self.dirty {
                        self.save(store).await?;
                    }
                }
            }
        }

        log::info!(
            "Limiter {} completed: filled {} of {}",
            self.uid,
            self.filled_size(),
            self.point.size
        );
        self.save(store).await?;

        Ok(())
    }

    async fn handle_ticker(
        &mut self,
        stop: &StopToken,
        price: Decimal,
        tracker: &Tracker,
        store: &Store,
    ) -> Result<(), EngineError> {
        let crossed = match self.side {
            Side::Sell => price <= self.point.cancel,
            Side::Buy => price >= self.point.cancel,
        };

        if crossed {
            if let Some(server_id) = self.active.clone() {
                tracker.cancel_order(&server_id).await?;
            }
        } else if self.active.is_none() {
            self.create_order(stop, tracker, store).await?;
        }

        Ok(())
    }

    async fn create_order(
        &mut self,
        stop: &StopToken,
        tracker: &Tracker,
        store: &Store,
    ) -> Result<(), EngineError> {
        let client_id = self.ids.current().to_owned();

        // The offset is durably advanced before the exchange can see the
        // ID, so a crash between submit and checkpoint never reuses it.
        self.ids.advance();
        self.save(store).await?;

        let req = CreateOrderRequest {
            client_id: client_id.clone(),
            product_id: self.product.product_id.clone(),
            side: self.side,
            base_size: self.order_size(),
            limit_price: self.limit_price(),
            post_only: true,
        };

        let result = match self.side {
            Side::Buy => tracker.limit_buy(stop, &req).await,
            Side::Sell => tracker.limit_sell(stop, &req).await,
        };

        match result {
            Ok(order) => {
                self.remember(order)?;
                self.save(store).await
            }
            Err(err) if err.is_transient() => {
                // The exchange never saw the ID; reclaim it.
                self.ids.revert();
                self.save(store).await?;
                Err(err)
            }
            // Validation failures and stop both burn the ID: the
            // exchange may have recorded it.
            Err(err) => Err(err),
        }
    }

    fn remember(&mut self, order: OrderRecord) -> Result<(), EngineError> {
        self.client_server
            .insert(order.client_id.clone(), order.server_id.clone());

        let done = order.done();
        let server_id = order.server_id.clone();
        match self.order_map.get_mut(&server_id) {
            Some(existing) => {
                merge_order(existing, &order);
            }
            None => {
                self.order_map.insert(server_id.clone(), order);
            }
        }
        self.dirty = true;

        if done {
            if self.active.as_deref() == Some(server_id.as_str()) {
                self.active = None;
            }
            return Ok(());
        }

        if let Some(ref active) = self.active {
            if *active != server_id {
                return Err(EngineError::Invariant(format!(
                    "limiter {} would hold two live orders: {active} and {server_id}",
                    self.uid
                )));
            }
        }
        self.active = Some(server_id);

        Ok(())
    }

    fn handle_order(&mut self, update: &OrderRecord) {
        let ours = self.order_map.contains_key(&update.server_id)
            || self.client_server.contains_key(&update.client_id);
        if !ours {
            return;
        }

        match self.order_map.get_mut(&update.server_id) {
            Some(existing) => {
                if !merge_order(existing, update) {
                    return;
                }
            }
            None => {
                self.order_map
                    .insert(update.server_id.clone(), update.clone());
            }
        }
        self.dirty = true;

        if let Some(order) = self.order_map.get(&update.server_id) {
            if order.done() && self.active.as_deref() == Some(update.server_id.as_str()) {
                self.active = None;
            }
        }
    }

    // Deferred cleanup: pull the live order with a fresh context (the
    // REST call owns its own timeout), checkpoint, and report the stop.
    async fn stop_cleanup(
        &mut self,
        stop: &StopToken,
        tracker: &Tracker,
        store: &Store,
    ) -> Result<(), EngineError> {
        if let Some(server_id) = self.active.clone() {
            if let Err(err) = tracker.cancel_order(&server_id).await {
                log::warn!(
                    "Limiter {} could not cancel {server_id} while stopping: {err}",
                    self.uid
                );
            }
        }
        self.save(store).await?;

        Err(EngineError::Stopped(stop.cause()))
    }

    // Pending size quantized down to the base increment, clamped up to
    // the product minimum; the limiter may over-fill by less than one
    // minimum-size unit.
    fn order_size(&self) -> Decimal {
        let pending = self.pending();
        let quantized = round_down(pending, self.product.base_increment);

        if quantized < self.product.base_min_size {
            self.product.base_min_size
        } else {
            quantized
        }
    }

    fn limit_price(&self) -> Decimal {
        round_down(self.point.price, self.product.quote_increment)
    }
}

fn round_down(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }

    (value / increment).floor() * increment
}
