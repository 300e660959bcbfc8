//! Periodic candle sync into hourly buckets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::EngineError;
use crate::exchange::{Candle, Exchange};
use crate::shutdown::StopToken;
use crate::store::{keys, Store};

/// How far back every sweep re-reads; bounded well under the exchange's
/// 300-candle page limit.
const SWEEP_WINDOW_MINUTES: i64 = 120;

/// Per-bucket map of `productID → [candle]`.
pub type CandlesBucket = BTreeMap<String, Vec<Candle>>;

/// Run the candle sync loop until the stop token fires.
pub(crate) async fn run(
    exchange: Arc<dyn Exchange>,
    store: Store,
    product_ids: Vec<String>,
    interval: Duration,
    stop: StopToken,
) {
    if product_ids.is_empty() {
        return;
    }

    loop {
        tokio::select! {
            () = stop.stopped() => return,
            () = tokio::time::sleep(interval) => {}
        }

        for product_id in &product_ids {
            if let Err(err) = sync_product(exchange.as_ref(), &store, product_id).await {
                log::warn!("Candle sync for {product_id} failed: {err}");
            }
        }
    }
}

async fn sync_product(
    exchange: &dyn Exchange,
    store: &Store,
    product_id: &str,
) -> Result<(), EngineError> {
    let end = Utc::now();
    let start = end - chrono::Duration::minutes(SWEEP_WINDOW_MINUTES);
    let candles = exchange.get_candles(product_id, start, end).await?;
    if candles.is_empty() {
        return Ok(());
    }

    let mut buckets: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    for candle in candles {
        buckets
            .entry(keys::candles_hour(candle.start))
            .or_default()
            .push(candle);
    }

    let mut tx = store.begin().await?;
    for (bucket_key, fresh) in buckets {
        let mut bucket: CandlesBucket = tx.get(&bucket_key).await?.unwrap_or_default();
        let entry = bucket.entry(product_id.to_owned()).or_default();
        for candle in fresh {
            match entry.iter_mut().find(|have| have.start == candle.start) {
                Some(have) => *have = candle,
                None => entry.push(candle),
            }
        }
        entry.sort_by_key(|candle| candle.start);
        tx.set(&bucket_key, &bucket).await?;
    }

    tx.commit().await
}
