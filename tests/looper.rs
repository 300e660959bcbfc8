//! Looper scenarios against the in-memory exchange.

mod common;

use std::sync::Arc;

use rust_decimal_macros::dec;

use common::{config, product, wait_until, MockExchange};
use gridbot::exchange::Exchange;
use gridbot::looper::{decide, Action, Looper, LooperState};
use gridbot::point::{Pair, Point};
use gridbot::reconcile::Tracker;
use gridbot::shutdown::{StopCause, StopToken};
use gridbot::status;
use gridbot::store::{keys, Store};

fn pair() -> Pair {
    Pair {
        buy: Point {
            size: dec!(1),
            price: dec!(100),
            cancel: dec!(106),
        },
        sell: Point {
            size: dec!(1),
            price: dec!(110),
            cancel: dec!(107),
        },
    }
}

#[tokio::test]
async fn one_full_cycle_buys_then_sells() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let exchange: Arc<dyn Exchange> = Arc::clone(&mock) as Arc<dyn Exchange>;
    let (tracker, _tasks) =
        Tracker::start(exchange, store.clone(), &config(), root.child()).await;

    let looper = Looper::new("loop-1", product(), pair()).unwrap();
    let job_stop = root.child();
    let handle = {
        let tracker = Arc::clone(&tracker);
        let store = store.clone();
        let stop = job_stop.clone();
        let mut looper = looper;
        tokio::spawn(async move {
            let result = looper.run(&stop, &tracker, &store).await;
            (looper, result)
        })
    };

    // The buy window opens above the buy price but below its cancel.
    mock.push_ticker("BTC-USD", dec!(105));
    wait_until("the buy order to be created", || mock.created_count() == 1).await;

    let buy_order = mock.live_order().unwrap();
    mock.fill_order(&buy_order.server_id, dec!(1), dec!(100));

    // With one whole buy complete, the looper turns to the sell side.
    mock.push_ticker("BTC-USD", dec!(115));
    wait_until("the sell order to be created", || mock.created_count() == 2).await;

    let sell_order = mock.live_order().unwrap();
    mock.fill_order(&sell_order.server_id, dec!(1), dec!(110));

    // Round trip done: one whole unit bought and sold. (The looper may
    // already have opened the next buy child, which stays unfilled.)
    for _ in 0..2000 {
        if let Ok(s) = status::looper_status(&store, "loop-1").await {
            if s.bought == dec!(1) && s.sold == dec!(1) {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    job_stop.signal(StopCause::Pause);
    let (looper, result) = handle.await.unwrap();
    assert!(result.unwrap_err().is_stopped());

    assert_eq!(looper.bought(), dec!(1));
    assert_eq!(looper.sold(), dec!(1));
    assert_eq!(looper.holding(), dec!(0));

    let state: LooperState = store.get(&keys::looper("loop-1")).await.unwrap().unwrap();
    assert!(!state.buys.is_empty());
    assert_eq!(state.sells.len(), 1);

    let persisted = status::looper_status(&store, "loop-1").await.unwrap();
    assert_eq!(persisted.bought, dec!(1));
    assert_eq!(persisted.sold, dec!(1));
    assert_eq!(persisted.num_sells, 1);
}

#[tokio::test]
async fn the_buy_window_gates_the_first_order() {
    let mock = MockExchange::new();
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    let exchange: Arc<dyn Exchange> = Arc::clone(&mock) as Arc<dyn Exchange>;
    let (tracker, _tasks) =
        Tracker::start(exchange, store.clone(), &config(), root.child()).await;

    let looper = Looper::new("loop-2", product(), pair()).unwrap();
    let job_stop = root.child();
    let handle = {
        let tracker = Arc::clone(&tracker);
        let store = store.clone();
        let stop = job_stop.clone();
        let mut looper = looper;
        tokio::spawn(async move {
            let result = looper.run(&stop, &tracker, &store).await;
            (looper, result)
        })
    };

    // At (not above) the buy price the window stays shut.
    mock.push_ticker("BTC-USD", dec!(100));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(mock.created_count(), 0);

    // Crossing above opens it.
    mock.push_ticker("BTC-USD", dec!(101));
    wait_until("the buy order to be created", || mock.created_count() == 1).await;

    job_stop.signal(StopCause::Cancel);
    let (_looper, result) = handle.await.unwrap();
    assert!(result.unwrap_err().is_stopped());
}

#[test]
fn decision_rule_matches_the_table() {
    let pair = pair();

    assert_eq!(decide(dec!(0), dec!(0), pair), Action::Buy);
    assert_eq!(decide(dec!(1), dec!(0), pair), Action::Sell);
    assert_eq!(decide(dec!(1), dec!(1), pair), Action::Buy);
    assert_eq!(decide(dec!(2), dec!(1), pair), Action::Sell);
    assert_eq!(decide(dec!(0.4), dec!(0), pair), Action::Buy);
    assert_eq!(decide(dec!(1), dec!(0.4), pair), Action::Sell);
}
