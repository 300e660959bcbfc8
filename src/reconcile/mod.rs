//! Order reconciliation.
//!
//! Every observation of an exchange order — websocket snapshot or
//! update, an explicit `get_order` poll, a page of a historical listing —
//! funnels through one [`Tracker::dispatch_order`] call. The tracker
//! merges observations into a single record per server ID, wakes callers
//! blocked on a client ID, routes updates to the owning product feed and
//! forwards finished orders to the hourly saver.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_channel::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::exchange::{CreateOrderRequest, Exchange, OrderRecord, OrderStatus, Ticker};
use crate::point::Side;
use crate::shutdown::StopToken;
use crate::store::Store;
use crate::topic::{Subscription, Topic};
use crate::utils::config::Config;

pub mod candles;
pub mod poller;
pub mod saver;

/// How long `create_ready_order` waits for the websocket before forcing
/// a synchronous `get_order` check.
const READY_POLL_FALLBACK: Duration = Duration::from_secs(1);

/// Merge a new observation of an order into the tracked record.
///
/// Fill size and fee only ever increase; the status walks
/// `PENDING → OPEN → {FILLED, CANCELLED, EXPIRED, FAILED}` and a done
/// order never becomes un-done. Replaying any permutation of the same
/// observations therefore converges to the same record.
pub fn merge_order(current: &mut OrderRecord, update: &OrderRecord) -> bool {
    let mut changed = false;

    if update.filled_size > current.filled_size {
        current.filled_size = update.filled_size;
        if !update.filled_price.is_zero() {
            current.filled_price = update.filled_price;
        }
        changed = true;
    }
    if update.fee > current.fee {
        current.fee = update.fee;
        changed = true;
    }

    let adopt_status = match (current.status.is_done(), update.status) {
        (true, _) => false,
        (false, status) if status == current.status => false,
        // PENDING may move anywhere forward; OPEN only to a done status.
        (false, status) => current.status == OrderStatus::Pending || status.is_done(),
    };
    if adopt_status {
        current.status = update.status;
        changed = true;
    }

    if current.client_id.is_empty() && !update.client_id.is_empty() {
        current.client_id = update.client_id.clone();
        changed = true;
    }
    if current.finished_at.is_none() && update.finished_at.is_some() {
        current.finished_at = update.finished_at;
        changed = true;
    }
    if current.done_reason.is_none() && update.done_reason.is_some() {
        current.done_reason = update.done_reason.clone();
        changed = true;
    }
    if update.last_fill_time > current.last_fill_time {
        current.last_fill_time = update.last_fill_time;
        changed = true;
    }

    changed
}

/// The reconciliation layer.
pub struct Tracker {
    exchange: Arc<dyn Exchange>,
    store: Store,
    // server ID → merged record. Never removed while the process runs.
    orders: DashMap<String, OrderRecord>,
    // client ID → merged record; the first write pins the server ID a
    // client ID maps to, later writes only feed the merge.
    client_orders: DashMap<String, OrderRecord>,
    client_server: DashMap<String, String>,
    // client ID → one-shot wakeups for `create_ready_order` waiters.
    waiters: DashMap<String, Vec<oneshot::Sender<OrderRecord>>>,
    // product ID → order update fan-out for that product's supervisors.
    product_topics: DashMap<String, Arc<Topic<OrderRecord>>>,
    saver_tx: UnboundedSender<OrderRecord>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("orders", &self.orders.len())
            .field("client_orders", &self.client_orders.len())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Start the tracker and its background tasks: the websocket order
    /// feed consumer, the REST fallback poller and the hourly saver.
    pub async fn start(
        exchange: Arc<dyn Exchange>,
        store: Store,
        config: &Config,
        stop: StopToken,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (saver_tx, saver_rx) = futures_channel::mpsc::unbounded();

        let tracker = Arc::new(Self {
            exchange,
            store: store.clone(),
            orders: DashMap::new(),
            client_orders: DashMap::new(),
            client_server: DashMap::new(),
            waiters: DashMap::new(),
            product_topics: DashMap::new(),
            saver_tx,
        });

        let mut tasks = Vec::new();

        // Websocket order fan-in.
        {
            let tracker = Arc::clone(&tracker);
            let stop = stop.child();
            let mut feed = tracker.exchange.watch_orders().await;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = stop.stopped() => return,
                        update = feed.recv() => match update {
                            Some(order) => tracker.dispatch_order(order),
                            None => return,
                        },
                    }
                }
            }));
        }

        tasks.push(tokio::spawn(poller::run(
            Arc::clone(&tracker),
            config.poll_orders_retry_interval,
            stop.child(),
        )));

        tasks.push(tokio::spawn(saver::run(store, saver_rx, stop.child())));

        (tracker, tasks)
    }

    /// The datastore the tracker checkpoints into.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Funnel one observation of an order into the tracked state.
    ///
    /// Wakes any waiters registered on the order's client ID, merges the
    /// observation into the per-server and per-client records and
    /// publishes the merged record to the owning product's feed.
    pub fn dispatch_order(&self, update: OrderRecord) {
        if update.server_id.is_empty() {
            log::warn!("Dropping order update without a server ID: {update:?}");
            return;
        }

        let (was_done, merged) = match self.orders.entry(update.server_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let was_done = entry.get().done();
                merge_order(entry.get_mut(), &update);
                (was_done, entry.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                (false, entry.insert(update.clone()).clone())
            }
        };

        if !merged.client_id.is_empty() {
            self.client_server
                .entry(merged.client_id.clone())
                .or_insert_with(|| merged.server_id.clone());

            let mut entry = self
                .client_orders
                .entry(merged.client_id.clone())
                .or_insert_with(|| merged.clone());
            merge_order(entry.value_mut(), &merged);
            let snapshot = entry.value().clone();
            drop(entry);

            if let Some((_, waiters)) = self.waiters.remove(&merged.client_id) {
                for waiter in waiters {
                    let _ = waiter.send(snapshot.clone());
                }
            }
        }

        if let Some(topic) = self.product_topics.get(&merged.product_id) {
            topic.publish(merged.clone());
        }

        if merged.done() && !merged.filled_size.is_zero() && !was_done {
            if self.saver_tx.unbounded_send(merged).is_err() {
                log::warn!("Order saver is gone; dropping finished order");
            }
        }
    }

    /// The merged record for a server ID, if the tracker has seen it.
    #[must_use]
    pub fn order(&self, server_id: &str) -> Option<OrderRecord> {
        self.orders.get(server_id).map(|entry| entry.value().clone())
    }

    /// The merged record for a client ID, if the tracker has seen it.
    #[must_use]
    pub fn order_by_client_id(&self, client_id: &str) -> Option<OrderRecord> {
        self.client_orders
            .get(client_id)
            .map(|entry| entry.value().clone())
    }

    /// Subscribe to order updates for one product.
    #[must_use]
    pub fn subscribe_product(&self, product_id: &str) -> Subscription<OrderRecord> {
        self.product_topics
            .entry(product_id.to_owned())
            .or_insert_with(|| Arc::new(Topic::new()))
            .subscribe_unbounded()
    }

    /// Subscribe to ticker updates for one product.
    pub async fn watch_tickers(&self, product_id: &str) -> Subscription<Ticker> {
        self.exchange.watch_tickers(product_id).await
    }

    /// Place a limit buy, deduplicating on the client ID.
    ///
    /// # Errors
    ///
    /// See [`Tracker::create_ready_order`].
    pub async fn limit_buy(
        &self,
        stop: &StopToken,
        req: &CreateOrderRequest,
    ) -> Result<OrderRecord, EngineError> {
        debug_assert_eq!(req.side, Side::Buy);
        self.create_idempotent(stop, req).await
    }

    /// Place a limit sell, deduplicating on the client ID.
    ///
    /// # Errors
    ///
    /// See [`Tracker::create_ready_order`].
    pub async fn limit_sell(
        &self,
        stop: &StopToken,
        req: &CreateOrderRequest,
    ) -> Result<OrderRecord, EngineError> {
        debug_assert_eq!(req.side, Side::Sell);
        self.create_idempotent(stop, req).await
    }

    async fn create_idempotent(
        &self,
        stop: &StopToken,
        req: &CreateOrderRequest,
    ) -> Result<OrderRecord, EngineError> {
        // A client ID the tracker already knows must not hit the
        // exchange again; the recorded order wins (crash-safe retries).
        if let Some(existing) = self.order_by_client_id(&req.client_id) {
            if existing.product_id != req.product_id || existing.side != req.side {
                log::warn!(
                    "Client ID {} reused with different parameters: recorded {}/{}, requested {}/{}",
                    req.client_id,
                    existing.product_id,
                    existing.side,
                    req.product_id,
                    req.side,
                );
            }
            if existing.status.is_ready() {
                return Ok(existing);
            }
            let server_id = existing.server_id.clone();
            return self.wait_ready(stop, &req.client_id, &server_id).await;
        }

        self.create_ready_order(stop, req).await
    }

    /// Submit an order and block until it has left the transient PENDING
    /// state, so a follow-up cancel cannot be rejected by the exchange.
    ///
    /// The wait resolves through the websocket order feed; a one-second
    /// fallback forces a synchronous `get_order` check so a missed
    /// websocket message cannot wedge the caller.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] when the submission fails
    /// on the wire (the caller retries with the same client ID) and
    /// [`EngineError::Stopped`] when `stop` fires first.
    pub async fn create_ready_order(
        &self,
        stop: &StopToken,
        req: &CreateOrderRequest,
    ) -> Result<OrderRecord, EngineError> {
        let created = self.exchange.create_order(req).await?;
        let server_id = created.server_id.clone();
        self.dispatch_order(created);

        self.wait_ready(stop, &req.client_id, &server_id).await
    }

    async fn wait_ready(
        &self,
        stop: &StopToken,
        client_id: &str,
        server_id: &str,
    ) -> Result<OrderRecord, EngineError> {
        loop {
            let (tx, mut rx) = oneshot::channel();
            self.waiters
                .entry(client_id.to_owned())
                .or_default()
                .push(tx);

            // Check after registering so a dispatch racing with us
            // cannot slip through unseen.
            if let Some(record) = self.order_by_client_id(client_id) {
                if record.status.is_ready() {
                    return Ok(record);
                }
            }

            tokio::select! {
                () = stop.stopped() => return Err(EngineError::Stopped(stop.cause())),
                update = &mut rx => {
                    if let Ok(record) = update {
                        if record.status.is_ready() {
                            return Ok(record);
                        }
                    }
                }
                () = tokio::time::sleep(READY_POLL_FALLBACK) => {
                    match self.exchange.get_order(server_id).await {
                        Ok(order) => self.dispatch_order(order),
                        Err(err) if err.is_transient() => {
                            log::warn!("Ready-check poll of {server_id} failed: {err}");
                        }
                        Err(err) => {
                            // The order may simply not be queryable yet.
                            log::debug!("Ready-check poll of {server_id}: {err}");
                        }
                    }
                }
            }
        }
    }

    /// Cancel one order by server ID.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] on wire failures and
    /// [`EngineError::Invalid`] when the exchange rejects the cancel for
    /// a reason other than a duplicate request.
    pub async fn cancel_order(&self, server_id: &str) -> Result<(), EngineError> {
        let ids = [server_id.to_owned()];
        let outcomes = self.exchange.cancel_orders(&ids).await?;

        match outcomes.into_iter().find(|o| o.server_id == server_id) {
            Some(outcome) if outcome.success => Ok(()),
            Some(outcome) => Err(EngineError::invalid(format!(
                "cancel of {server_id} rejected: {}",
                outcome.failure_reason.unwrap_or_default()
            ))),
            None => Err(EngineError::transient(format!(
                "batch cancel response did not mention {server_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;
    use crate::exchange::OrderStatus;

    fn record(status: OrderStatus, filled: i64, fee: i64) -> OrderRecord {
        OrderRecord {
            server_id: "srv".to_owned(),
            client_id: "cli".to_owned(),
            product_id: "BTC-USD".to_owned(),
            side: Side::Buy,
            status,
            filled_size: Decimal::new(filled, 2),
            filled_price: Decimal::new(100, 0),
            fee: Decimal::new(fee, 4),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            finished_at: None,
            done_reason: None,
            last_fill_time: None,
        }
    }

    #[test]
    fn fill_size_and_fee_never_decrease() {
        let mut current = record(OrderStatus::Open, 50, 10);
        let stale = record(OrderStatus::Open, 25, 5);

        assert!(!merge_order(&mut current, &stale));
        assert_eq!(current.filled_size, Decimal::new(50, 2));
        assert_eq!(current.fee, Decimal::new(10, 4));
    }

    #[test]
    fn done_orders_never_become_undone() {
        let mut current = record(OrderStatus::Filled, 100, 20);
        let late_open = record(OrderStatus::Open, 100, 20);

        merge_order(&mut current, &late_open);
        assert_eq!(current.status, OrderStatus::Filled);
    }

    #[test]
    fn open_cannot_regress_to_pending() {
        let mut current = record(OrderStatus::Open, 0, 0);
        let stale_pending = record(OrderStatus::Pending, 0, 0);

        merge_order(&mut current, &stale_pending);
        assert_eq!(current.status, OrderStatus::Open);
    }

    #[test]
    fn merge_is_permutation_invariant() {
        let updates = vec![
            record(OrderStatus::Pending, 0, 0),
            record(OrderStatus::Open, 25, 5),
            record(OrderStatus::Open, 50, 10),
            record(OrderStatus::Filled, 100, 20),
        ];

        // All 4! orderings converge to the same final record.
        let mut permutations: Vec<Vec<usize>> = Vec::new();
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    for d in 0..4 {
                        let p = vec![a, b, c, d];
                        let mut sorted = p.clone();
                        sorted.sort_unstable();
                        sorted.dedup();
                        if sorted.len() == 4 {
                            permutations.push(p);
                        }
                    }
                }
            }
        }

        let mut finals = Vec::new();
        for permutation in permutations {
            let mut state = updates[permutation[0]].clone();
            for &idx in &permutation[1..] {
                merge_order(&mut state, &updates[idx]);
            }
            finals.push(state);
        }

        for state in &finals {
            assert_eq!(state, &finals[0]);
            assert_eq!(state.status, OrderStatus::Filled);
            assert_eq!(state.filled_size, Decimal::new(100, 2));
        }
    }
}
