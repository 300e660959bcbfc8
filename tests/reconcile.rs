//! Reconciliation contract: ready-wait, REST fallback, hourly saver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use common::{config, wait_until, MockExchange};
use gridbot::exchange::{
    CreateOrderRequest, Exchange, OrderRecord, OrderStatus,
};
use gridbot::point::Side;
use gridbot::reconcile::saver::FilledBucket;
use gridbot::reconcile::Tracker;
use gridbot::shutdown::StopToken;
use gridbot::store::{keys, Store};

async fn start(
    mock: &Arc<MockExchange>,
    store: &Store,
    root: &StopToken,
) -> Arc<Tracker> {
    let exchange: Arc<dyn Exchange> = Arc::clone(mock) as Arc<dyn Exchange>;
    let (tracker, _tasks) = Tracker::start(exchange, store.clone(), &config(), root.child()).await;
    tracker
}

fn request(client_id: &str) -> CreateOrderRequest {
    CreateOrderRequest {
        client_id: client_id.to_owned(),
        product_id: "BTC-USD".to_owned(),
        side: Side::Buy,
        base_size: dec!(1),
        limit_price: dec!(100),
        post_only: true,
    }
}

#[tokio::test]
async fn create_ready_resolves_through_the_websocket() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let tracker = start(&mock, &store, &root).await;

    let order = tracker
        .limit_buy(&root.child(), &request("cli-ws"))
        .await
        .unwrap();
    assert!(order.status.is_ready());
    assert_eq!(mock.created_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn create_ready_falls_back_to_rest_polling() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let tracker = start(&mock, &store, &root).await;

    // No websocket updates: only the one-second get_order fallback can
    // observe the PENDING → OPEN transition.
    mock.suppress_websocket(true);

    let order = tracker
        .limit_buy(&root.child(), &request("cli-poll"))
        .await
        .unwrap();
    assert!(order.status.is_ready());
}

#[tokio::test]
async fn duplicate_client_ids_return_the_recorded_order() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let tracker = start(&mock, &store, &root).await;

    let first = tracker
        .limit_buy(&root.child(), &request("cli-dup"))
        .await
        .unwrap();
    let second = tracker
        .limit_buy(&root.child(), &request("cli-dup"))
        .await
        .unwrap();

    assert_eq!(first.server_id, second.server_id);
    assert_eq!(mock.created_count(), 1);
    assert_eq!(mock.duplicate_create_count(), 0);
}

#[tokio::test]
async fn rest_polling_recovers_orders_the_websocket_missed() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let tracker = start(&mock, &store, &root).await;

    // This order only ever appears in the historical listing.
    let ghost = OrderRecord {
        server_id: "srv-ghost".to_owned(),
        client_id: "cli-ghost".to_owned(),
        product_id: "BTC-USD".to_owned(),
        side: Side::Sell,
        status: OrderStatus::Filled,
        filled_size: dec!(2),
        filled_price: dec!(99),
        fee: dec!(0.2),
        created_at: Utc::now(),
        finished_at: Some(Utc::now()),
        done_reason: None,
        last_fill_time: Some(Utc::now()),
    };
    mock.seed_listed_order(ghost);

    wait_until("the poller to recover the missed order", || {
        tracker.order("srv-ghost").is_some()
    })
    .await;
    assert_eq!(
        tracker.order("srv-ghost").unwrap().status,
        OrderStatus::Filled
    );
}

#[tokio::test(start_paused = true)]
async fn finished_orders_land_in_hourly_buckets() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let tracker = start(&mock, &store, &root).await;

    let order = tracker
        .limit_buy(&root.child(), &request("cli-fill"))
        .await
        .unwrap();
    mock.fill_order(&order.server_id, dec!(1), dec!(100));

    wait_until("the fill to reach the tracker", || {
        tracker
            .order(&order.server_id)
            .is_some_and(|record| record.done())
    })
    .await;

    // The saver flushes on its age tick; wait for the bucket to appear.
    let fill_time = tracker
        .order(&order.server_id)
        .unwrap()
        .last_fill_time
        .unwrap();
    let bucket_key = keys::filled_hour(fill_time);
    let order_key = keys::order(&order.server_id);

    for _ in 0..2000 {
        let bucket: Option<FilledBucket> = store.get(&bucket_key).await.unwrap();
        if bucket.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let bucket: FilledBucket = store.get(&bucket_key).await.unwrap().expect("bucket");
    assert_eq!(
        bucket.get("BTC-USD"),
        Some(&vec![order.server_id.clone()])
    );

    let saved: OrderRecord = store.get(&order_key).await.unwrap().expect("saved order");
    assert_eq!(saved.status, OrderStatus::Filled);
    assert_eq!(saved.filled_size, dec!(1));
}

#[tokio::test]
async fn stopping_interrupts_the_ready_wait() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let tracker = start(&mock, &store, &root).await;

    mock.suppress_websocket(true);

    // With the websocket silent, the wait sits in its poll fallback;
    // the stop token must win before the next poll.
    let stop = root.child();
    let waiter = {
        let tracker = Arc::clone(&tracker);
        let stop = stop.clone();
        tokio::spawn(async move {
            tracker
                .limit_buy(&stop, &request("cli-stuck"))
                .await
        })
    };

    wait_until("the order to be submitted", || mock.created_count() == 1).await;
    stop.signal(gridbot::shutdown::StopCause::Cancel);

    let result = waiter.await.unwrap();
    assert!(result.unwrap_err().is_stopped());
}
