//! Read-only status aggregation over persisted supervisor state.
//!
//! Statuses are computed straight from checkpoints, so they work whether
//! or not the supervisor is currently running.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::EngineError;
use crate::limiter::LimiterState;
use crate::looper::LooperState;
use crate::point::{Pair, Point, Side};
use crate::store::{keys, Store};
use crate::waller::WallerState;

/// Status of one limiter.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    /// The limiter's uid.
    pub uid: String,
    /// Product traded.
    pub product_id: String,
    /// Side of the point.
    pub side: Side,
    /// The point being worked.
    pub point: Point,
    /// Total filled size.
    pub filled_size: Decimal,
    /// Size still unfilled.
    pub pending_size: Decimal,
    /// Total fees paid.
    pub fees: Decimal,
}

/// Status of one looper.
#[derive(Debug, Clone, Serialize)]
pub struct LooperStatus {
    /// The looper's uid.
    pub uid: String,
    /// Product traded.
    pub product_id: String,
    /// The pair being worked.
    pub pair: Pair,
    /// Total base size bought.
    pub bought: Decimal,
    /// Total base size sold.
    pub sold: Decimal,
    /// Base size bought but not yet sold.
    pub holding: Decimal,
    /// Total fees paid.
    pub fees: Decimal,
    /// Number of buy children started.
    pub num_buys: usize,
    /// Number of sell children started.
    pub num_sells: usize,
}

/// Status of one waller.
#[derive(Debug, Clone, Serialize)]
pub struct WallerStatus {
    /// The waller's uid.
    pub uid: String,
    /// Product traded.
    pub product_id: String,
    /// Quote budget needed to fund every pair's buy side once.
    pub budget: Decimal,
    /// Total base size bought.
    pub bought: Decimal,
    /// Total base size sold.
    pub sold: Decimal,
    /// Base size bought but not yet sold.
    pub holding: Decimal,
    /// Total fees paid.
    pub fees: Decimal,
    /// Per-looper statuses, grid order.
    pub loopers: Vec<LooperStatus>,
}

/// Status of any supervisor kind.
#[derive(Debug, Clone, Serialize)]
pub enum Status {
    /// A limiter's status.
    Limiter(LimiterStatus),
    /// A looper's status.
    Looper(LooperStatus),
    /// A waller's status.
    Waller(WallerStatus),
}

/// Compute a limiter's status from its checkpoint.
///
/// # Errors
///
/// Will return [`EngineError::NotFound`] when no checkpoint exists.
pub async fn limiter_status(store: &Store, uid: &str) -> Result<LimiterStatus, EngineError> {
    let Some(state) = store.get::<LimiterState>(&keys::limiter(uid)).await? else {
        return Err(EngineError::NotFound(format!("limiter {uid}")));
    };

    Ok(status_of_limiter_state(uid, &state))
}

fn status_of_limiter_state(uid: &str, state: &LimiterState) -> LimiterStatus {
    let filled_size: Decimal = state
        .order_map
        .values()
        .map(|order| order.filled_size)
        .sum();
    let fees: Decimal = state.order_map.values().map(|order| order.fee).sum();

    LimiterStatus {
        uid: uid.to_owned(),
        product_id: state.product_id.clone(),
        side: state.point.side(),
        point: state.point,
        filled_size,
        pending_size: (state.point.size - filled_size).max(Decimal::ZERO),
        fees,
    }
}

/// Compute a looper's status from its checkpoint and its children's.
///
/// # Errors
///
/// Will return [`EngineError::NotFound`] when a checkpoint is missing.
pub async fn looper_status(store: &Store, uid: &str) -> Result<LooperStatus, EngineError> {
    let Some(state) = store.get::<LooperState>(&keys::looper(uid)).await? else {
        return Err(EngineError::NotFound(format!("looper {uid}")));
    };

    let mut bought = Decimal::ZERO;
    let mut sold = Decimal::ZERO;
    let mut fees = Decimal::ZERO;

    for child in &state.buys {
        let child_status = limiter_status(store, child).await?;
        bought += child_status.filled_size;
        fees += child_status.fees;
    }
    for child in &state.sells {
        let child_status = limiter_status(store, child).await?;
        sold += child_status.filled_size;
        fees += child_status.fees;
    }

    Ok(LooperStatus {
        uid: uid.to_owned(),
        product_id: state.product_id.clone(),
        pair: state.pair,
        bought,
        sold,
        holding: bought - sold,
        fees,
        num_buys: state.buys.len(),
        num_sells: state.sells.len(),
    })
}

/// Compute a waller's status from its checkpoint and its children's.
///
/// # Errors
///
/// Will return [`EngineError::NotFound`] when a checkpoint is missing.
pub async fn waller_status(store: &Store, uid: &str) -> Result<WallerStatus, EngineError> {
    let Some(state) = store.get::<WallerState>(&keys::waller(uid)).await? else {
        return Err(EngineError::NotFound(format!("waller {uid}")));
    };

    let budget = state.pairs.iter().map(Pair::budget).sum();

    let mut loopers = Vec::with_capacity(state.loopers.len());
    for child in &state.loopers {
        // A looper that has not started yet has no checkpoint; report
        // what exists.
        match looper_status(store, child).await {
            Ok(status) => loopers.push(status),
            Err(EngineError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }

    let bought = loopers.iter().map(|l| l.bought).sum::<Decimal>();
    let sold = loopers.iter().map(|l| l.sold).sum::<Decimal>();
    let fees = loopers.iter().map(|l| l.fees).sum::<Decimal>();

    Ok(WallerStatus {
        uid: uid.to_owned(),
        product_id: state.product_id.clone(),
        budget,
        bought,
        sold,
        holding: bought - sold,
        fees,
        loopers,
    })
}
