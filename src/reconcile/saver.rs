//! Hourly persistence of finished orders.
//!
//! Finished orders with fills arrive on a channel, batch up to a bounded
//! size or age, and land in hourly buckets keyed by the order's last
//! fill time. A bucket write reads the existing bucket, merges the
//! order-ID lists and writes everything back in one transaction; a
//! failed flush keeps the batch and retries on the next tick.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_channel::mpsc::UnboundedReceiver;
use futures_util::StreamExt;

use crate::error::EngineError;
use crate::exchange::OrderRecord;
use crate::shutdown::StopToken;
use crate::store::{keys, Store};

/// Flush when this many orders are waiting.
const MAX_BATCH: usize = 100;

/// Flush at least this often regardless of batch size.
const MAX_BATCH_AGE: Duration = Duration::from_secs(60);

/// Per-bucket map of `productID → [serverID]`.
pub type FilledBucket = BTreeMap<String, Vec<String>>;

/// Run the saver loop until the channel closes or the stop token fires.
pub(crate) async fn run(store: Store, mut rx: UnboundedReceiver<OrderRecord>, stop: StopToken) {
    let mut batch: Vec<OrderRecord> = Vec::new();
    let mut flush_tick = tokio::time::interval(MAX_BATCH_AGE);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = stop.stopped() => {
                flush(&store, &mut batch).await;
                return;
            }
            order = rx.next() => {
                let Some(order) = order else {
                    flush(&store, &mut batch).await;
                    return;
                };
                batch.push(order);
                if batch.len() >= MAX_BATCH {
                    flush(&store, &mut batch).await;
                }
            }
            _ = flush_tick.tick() => {
                flush(&store, &mut batch).await;
            }
        }
    }
}

async fn flush(store: &Store, batch: &mut Vec<OrderRecord>) {
    if batch.is_empty() {
        return;
    }

    match write_batch(store, batch).await {
        Ok(()) => batch.clear(),
        Err(err) => {
            // The transaction rolled back; nothing partial landed. Keep
            // the batch for the next tick.
            log::warn!("Could not save {} finished orders: {err}", batch.len());
        }
    }
}

async fn write_batch(store: &Store, orders: &[OrderRecord]) -> Result<(), EngineError> {
    let mut buckets: BTreeMap<String, Vec<&OrderRecord>> = BTreeMap::new();
    for order in orders {
        let bucketed_at = order.last_fill_time.unwrap_or(order.created_at);
        buckets
            .entry(keys::filled_hour(bucketed_at))
            .or_default()
            .push(order);
    }

    let mut tx = store.begin().await?;

    for (bucket_key, bucket_orders) in buckets {
        let mut bucket: FilledBucket = tx.get(&bucket_key).await?.unwrap_or_default();
        for order in &bucket_orders {
            bucket
                .entry(order.product_id.clone())
                .or_default()
                .push(order.server_id.clone());
        }
        for ids in bucket.values_mut() {
            ids.sort();
            ids.dedup();
        }
        tx.set(&bucket_key, &bucket).await?;
    }

    for order in orders {
        tx.set(&keys::order(&order.server_id), order).await?;
    }

    tx.commit().await
}
