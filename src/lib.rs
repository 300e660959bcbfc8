#![allow(
    clippy::module_name_repetitions,
    clippy::cast_sign_loss,
    rustdoc::broken_intra_doc_links
)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![deny(unused_must_use)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! A persistent grid trading engine for spot markets on
//! [Coinbase Advanced Trade](https://docs.cdp.coinbase.com/advanced-trade/docs/welcome).
//!
//! The engine runs long-lived grid strategies: for each configured price
//! grid it places, monitors, cancels and replays limit orders, reconciles
//! them with the exchange over websocket and REST, and persists every
//! state transition so that a crashed process can restart and converge to
//! a consistent view of its outstanding work without duplicating or
//! losing orders.
//!
//! To assemble a running engine, refer to [`crate::engine::EngineBuilder`].
//!
//! The supervisor stack is [`crate::limiter::Limiter`] (one price point),
//! [`crate::looper::Looper`] (a buy/sell pair) and
//! [`crate::waller::Waller`] (a grid of pairs).

pub mod engine;
pub mod error;
pub mod exchange;
pub mod ids;
pub mod job;
pub mod limiter;
pub mod looper;
pub mod point;
pub mod prelude;
pub mod reconcile;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod topic;
pub mod utils;
pub mod waller;
