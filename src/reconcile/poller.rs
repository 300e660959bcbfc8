//! REST fallback polling and startup backfill.
//!
//! The user websocket stream is best-effort: a dropped connection or a
//! sequence gap loses messages without resetting the stream. This loop
//! repeatedly lists finished orders over REST so that every finalized
//! order eventually reaches [`Tracker::dispatch_order`], whatever the
//! websocket did.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::exchange::OrderStatus;
use crate::reconcile::Tracker;
use crate::shutdown::StopToken;
use crate::store::keys;

/// How far behind the newest filled bucket the startup backfill reaches.
const BACKFILL_OVERLAP_HOURS: i64 = 6;

/// The minimum sliding window of the steady-state sweeps.
const SWEEP_WINDOW_MINUTES: i64 = 10;

/// Run the poll loop until the stop token fires.
pub(crate) async fn run(tracker: Arc<Tracker>, interval: Duration, stop: StopToken) {
    // The newest hourly bucket tells us when the local view was last
    // complete; everything after (minus overlap) must be re-fetched.
    let mut window_start = backfill_start(&tracker).await;
    log::info!("Order poll backfill starts at {window_start}");

    loop {
        if stop.is_stopped() {
            return;
        }

        match sweep(&tracker, window_start).await {
            Ok(()) => {
                window_start = Utc::now() - chrono::Duration::minutes(SWEEP_WINDOW_MINUTES);
            }
            Err(err) => {
                // Keep the window; the next sweep retries the same span.
                log::warn!("Order poll sweep failed: {err}");
            }
        }

        tokio::select! {
            () = stop.stopped() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

async fn backfill_start(tracker: &Tracker) -> DateTime<Utc> {
    let last_filled = match tracker.store().last_key(keys::FILLED).await {
        Ok(Some(key)) => keys::parse_hour_key(keys::FILLED, &key),
        Ok(None) => None,
        Err(err) => {
            log::warn!("Could not read the filled-order buckets: {err}");
            None
        }
    };

    last_filled.unwrap_or_else(Utc::now) - chrono::Duration::hours(BACKFILL_OVERLAP_HOURS)
}

async fn sweep(tracker: &Tracker, start: DateTime<Utc>) -> Result<(), EngineError> {
    let statuses = [OrderStatus::Filled, OrderStatus::Cancelled];
    let mut cursor = None;

    loop {
        let page = tracker
            .exchange
            .list_orders(&statuses, start, cursor)
            .await?;
        for order in page.items {
            tracker.dispatch_order(order);
        }

        match page.cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(()),
        }
    }
}
