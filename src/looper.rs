//! Buy/sell alternation over one [`Pair`].
//!
//! A Looper runs one child Limiter at a time: a full buy at the pair's
//! buy point, then a full sell at its sell point, then the next buy,
//! accumulating round trips indefinitely. Children are created with
//! deterministic uids derived from the looper's uid, so a restart
//! re-attaches to the same children.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::exchange::Product;
use crate::limiter::Limiter;
use crate::point::{Pair, Point};
use crate::reconcile::Tracker;
use crate::shutdown::StopToken;
use crate::store::{keys, Store};

/// Backoff between retries of a child that failed transiently.
pub(crate) const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// The persisted shape of a looper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LooperState {
    /// Product the looper trades.
    pub product_id: String,
    /// The pair being worked.
    pub pair: Pair,
    /// Child buy limiter uids, oldest first.
    pub buys: Vec<String>,
    /// Child sell limiter uids, oldest first.
    pub sells: Vec<String>,
}

/// What the decision rule wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Work (or start) a buy limiter.
    Buy,
    /// Work (or start) a sell limiter.
    Sell,
    /// An invariant is broken; halt until an operator intervenes.
    Stop(StopReason),
}

/// Why the decision rule halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// More completed sells than buys.
    SellsAheadOfBuys,
    /// More sold than bought.
    NegativeHolding,
    /// A buy and a sell are both partially complete.
    DoublePartial,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::SellsAheadOfBuys => write!(f, "completed sells are ahead of buys"),
            StopReason::NegativeHolding => write!(f, "holding is negative"),
            StopReason::DoublePartial => write!(f, "buy and sell are both partially filled"),
        }
    }
}

/// A buy/sell alternation machine over one pair.
#[derive(Debug)]
pub struct Looper {
    uid: String,
    product: Product,
    pair: Pair,
    buys: Vec<Limiter>,
    sells: Vec<Limiter>,
}

impl Looper {
    /// A fresh looper for `pair` on `product`.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] when the pair is invalid.
    pub fn new(uid: impl Into<String>, product: Product, pair: Pair) -> Result<Self, EngineError> {
        pair.check()?;

        Ok(Self {
            uid: uid.into(),
            product,
            pair,
            buys: Vec::new(),
            sells: Vec::new(),
        })
    }

    /// Load a looper and all of its children from their checkpoints.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] when no checkpoint exists.
    pub async fn load(store: &Store, uid: &str, product: Product) -> Result<Self, EngineError> {
        let Some(state) = store.get::<LooperState>(&keys::looper(uid)).await? else {
            return Err(EngineError::NotFound(format!("looper {uid}")));
        };
        if state.product_id != product.product_id {
            return Err(EngineError::invalid(format!(
                "looper {uid} was created for {}, not {}",
                state.product_id, product.product_id
            )));
        }

        let mut buys = Vec::with_capacity(state.buys.len());
        for child in &state.buys {
            buys.push(Limiter::load(store, child, product.clone()).await?);
        }
        let mut sells = Vec::with_capacity(state.sells.len());
        for child in &state.sells {
            sells.push(Limiter::load(store, child, product.clone()).await?);
        }

        Ok(Self {
            uid: uid.to_owned(),
            product,
            pair: state.pair,
            buys,
            sells,
        })
    }

    /// Load the looper if a checkpoint exists, otherwise create one.
    ///
    /// # Errors
    ///
    /// See [`Looper::load`] and [`Looper::new`].
    pub async fn load_or_create(
        store: &Store,
        uid: &str,
        product: Product,
        pair: Pair,
    ) -> Result<Self, EngineError> {
        match Self::load(store, uid, product.clone()).await {
            Ok(looper) => Ok(looper),
            Err(EngineError::NotFound(_)) => Self::new(uid, product, pair),
            Err(err) => Err(err),
        }
    }

    /// The looper's uid.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Total base size bought across every buy child.
    #[must_use]
    pub fn bought(&self) -> Decimal {
        self.buys.iter().map(Limiter::filled_size).sum()
    }

    /// Total base size sold across every sell child.
    #[must_use]
    pub fn sold(&self) -> Decimal {
        self.sells.iter().map(Limiter::filled_size).sum()
    }

    /// Base size bought but not yet sold.
    #[must_use]
    pub fn holding(&self) -> Decimal {
        self.bought() - self.sold()
    }

    /// The persisted shape of the current state.
    #[must_use]
    pub fn state(&self) -> LooperState {
        LooperState {
            product_id: self.product.product_id.clone(),
            pair: self.pair,
            buys: self.buys.iter().map(|l| l.uid().to_owned()).collect(),
            sells: self.sells.iter().map(|l| l.uid().to_owned()).collect(),
        }
    }

    /// Checkpoint the child lists to the store.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] when the write fails.
    pub async fn save(&self, store: &Store) -> Result<(), EngineError> {
        store.set(&keys::looper(&self.uid), &self.state()).await
    }

    /// The decision rule: compare whole completed buy/sell units and
    /// their partial remainders.
    #[must_use]
    pub fn decide(&self) -> Action {
        decide(self.bought(), self.sold(), self.pair)
    }

    /// Run the looper until the stop token fires.
    ///
    /// The looper itself never completes; it alternates buys and sells
    /// indefinitely, retrying transient child failures after a backoff.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Stopped`] when asked to stop and
    /// [`EngineError::Invariant`] is never returned directly — on a
    /// broken invariant the looper logs, halts, and blocks on the stop
    /// token so an operator can inspect the state.
    pub async fn run(
        &mut self,
        stop: &StopToken,
        tracker: &Tracker,
        store: &Store,
    ) -> Result<(), EngineError> {
        self.save(store).await?;

        loop {
            if stop.is_stopped() {
                return Err(EngineError::Stopped(stop.cause()));
            }

            match self.decide() {
                Action::Stop(reason) => {
                    log::error!(
                        "Looper {} halted: {reason} (bought {}, sold {})",
                        self.uid,
                        self.bought(),
                        self.sold()
                    );
                    stop.stopped().await;
                    return Err(EngineError::Stopped(stop.cause()));
                }
                Action::Buy => self.run_side(stop, tracker, store, Action::Buy).await?,
                Action::Sell => self.run_side(stop, tracker, store, Action::Sell).await?,
            }
        }
    }

    async fn run_side(
        &mut self,
        stop: &StopToken,
        tracker: &Tracker,
        store: &Store,
        action: Action,
    ) -> Result<(), EngineError> {
        let (threshold, point, prefix) = match action {
            Action::Buy => (self.pair.buy.price, self.pair.buy, "buy"),
            Action::Sell => (self.pair.sell.price, self.pair.sell, "sell"),
            Action::Stop(_) => unreachable!("run_side is only called for buy/sell"),
        };

        // Do not launch into an already-favorable price: wait for the
        // ticker to be on the far side of the limit price first.
        self.wait_for_price(stop, tracker, action, threshold).await?;

        let children = match action {
            Action::Buy => &mut self.buys,
            Action::Sell => &mut self.sells,
            Action::Stop(_) => unreachable!(),
        };

        let needs_new = children
            .last()
            .map_or(true, |child| child.pending() <= Decimal::ZERO);
        if needs_new {
            let child_uid = format!("{}/{prefix}-{}", self.uid, children.len());
            let child =
                Limiter::load_or_create(store, &child_uid, self.product.clone(), point).await?;
            children.push(child);

            // Persist the child list before the child can issue orders.
            self.save(store).await?;
        }

        let child = match action {
            Action::Buy => self.buys.last_mut(),
            Action::Sell => self.sells.last_mut(),
            Action::Stop(_) => unreachable!(),
        }
        .expect("a child was just ensured");

        loop {
            match child.run(stop, tracker, store).await {
                Ok(()) => break,
                Err(err) if err.is_transient() => {
                    log::warn!(
                        "Looper child {} failed, retrying in {RETRY_BACKOFF:?}: {err}",
                        child.uid()
                    );
                    tokio::select! {
                        () = stop.stopped() => return Err(EngineError::Stopped(stop.cause())),
                        () = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }

        self.save(store).await
    }

    async fn wait_for_price(
        &self,
        stop: &StopToken,
        tracker: &Tracker,
        action: Action,
        threshold: Decimal,
    ) -> Result<(), EngineError> {
        let mut tickers = tracker.watch_tickers(&self.product.product_id).await;

        loop {
            tokio::select! {
                () = stop.stopped() => return Err(EngineError::Stopped(stop.cause())),
                ticker = tickers.recv() => {
                    let Some(ticker) = ticker else {
                        return Err(EngineError::transient("ticker feed closed"));
                    };
                    let ready = match action {
                        Action::Buy => ticker.price > threshold,
                        Action::Sell => ticker.price >= threshold,
                        Action::Stop(_) => unreachable!(),
                    };
                    if ready {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// The pure decision rule over total bought/sold sizes.
#[must_use]
pub fn decide(bought: Decimal, sold: Decimal, pair: Pair) -> Action {
    let holding = bought - sold;
    if holding < Decimal::ZERO {
        return Action::Stop(StopReason::NegativeHolding);
    }

    let (n_buys, p_buy) = split_units(bought, pair.buy);
    let (n_sells, p_sell) = split_units(sold, pair.sell);

    if n_buys < n_sells {
        return Action::Stop(StopReason::SellsAheadOfBuys);
    }
    if p_buy > Decimal::ZERO && p_sell > Decimal::ZERO {
        return Action::Stop(StopReason::DoublePartial);
    }
    if p_buy.is_zero() && p_sell.is_zero() {
        if n_buys == n_sells {
            return Action::Buy;
        }
        return Action::Sell;
    }
    if p_sell > Decimal::ZERO {
        return Action::Sell;
    }

    Action::Buy
}

// Whole completed units and the partial remainder of a total.
fn split_units(total: Decimal, point: Point) -> (Decimal, Decimal) {
    let whole = (total / point.size).floor();
    (whole, total - whole * point.size)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn pair() -> Pair {
        Pair {
            buy: Point {
                size: Decimal::new(1, 0),
                price: Decimal::new(100, 0),
                cancel: Decimal::new(105, 0),
            },
            sell: Point {
                size: Decimal::new(1, 0),
                price: Decimal::new(110, 0),
                cancel: Decimal::new(107, 0),
            },
        }
    }

    fn d(value: i64, scale: u32) -> Decimal {
        Decimal::new(value, scale)
    }

    #[test]
    fn fresh_looper_buys_first() {
        assert_eq!(decide(d(0, 0), d(0, 0), pair()), Action::Buy);
    }

    #[test]
    fn completed_buy_sells_next() {
        assert_eq!(decide(d(1, 0), d(0, 0), pair()), Action::Sell);
    }

    #[test]
    fn completed_round_trip_buys_again() {
        assert_eq!(decide(d(1, 0), d(1, 0), pair()), Action::Buy);
    }

    #[test]
    fn partial_buy_is_finished_first() {
        assert_eq!(decide(d(5, 1), d(0, 0), pair()), Action::Buy);
    }

    #[test]
    fn partial_sell_is_finished_first() {
        assert_eq!(decide(d(1, 0), d(5, 1), pair()), Action::Sell);
    }

    #[test]
    fn negative_holding_halts() {
        assert_eq!(
            decide(d(1, 0), d(2, 0), pair()),
            Action::Stop(StopReason::NegativeHolding)
        );
    }

    #[test]
    fn double_partial_halts() {
        assert_eq!(
            decide(d(15, 1), d(5, 1), pair()),
            Action::Stop(StopReason::DoublePartial)
        );
    }

    #[test]
    fn sells_ahead_of_buys_halts() {
        // Larger sell units make whole sells outnumber whole buys while
        // holding stays non-negative.
        let pair = Pair {
            buy: Point {
                size: d(2, 0),
                price: d(100, 0),
                cancel: d(105, 0),
            },
            sell: Point {
                size: d(1, 0),
                price: d(110, 0),
                cancel: d(107, 0),
            },
        };

        assert_eq!(
            decide(d(2, 0), d(2, 0), pair),
            Action::Stop(StopReason::SellsAheadOfBuys)
        );
    }
}
