//! Parallel Loopers across a price grid.
//!
//! A Waller is a fixed set of pairs, one Looper per pair, each running
//! in its own task. Loopers that fail with a non-stop error are logged
//! and relaunched after a backoff; on stop the waller waits for every
//! child to return before reporting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::exchange::Product;
use crate::looper::{Looper, RETRY_BACKOFF};
use crate::point::Pair;
use crate::reconcile::Tracker;
use crate::shutdown::StopToken;
use crate::store::{keys, Store};

/// The persisted shape of a waller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallerState {
    /// Product the waller trades.
    pub product_id: String,
    /// The grid of pairs.
    pub pairs: Vec<Pair>,
    /// Child looper uids, one per pair.
    pub loopers: Vec<String>,
}

/// A fixed parallel composition of Loopers.
#[derive(Debug)]
pub struct Waller {
    uid: String,
    product: Product,
    pairs: Vec<Pair>,
    loopers: Vec<String>,
}

impl Waller {
    /// A fresh waller over `pairs` on `product`.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] when any pair is invalid or
    /// the grid is empty.
    pub fn new(
        uid: impl Into<String>,
        product: Product,
        pairs: Vec<Pair>,
    ) -> Result<Self, EngineError> {
        if pairs.is_empty() {
            return Err(EngineError::invalid("a waller needs at least one pair"));
        }
        for pair in &pairs {
            pair.check()?;
        }

        let uid = uid.into();
        let loopers = (0..pairs.len())
            .map(|index| format!("{uid}/loop-{index}"))
            .collect();

        Ok(Self {
            uid,
            product,
            pairs,
            loopers,
        })
    }

    /// Load a waller from its checkpoint.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] when no checkpoint exists.
    pub async fn load(store: &Store, uid: &str, product: Product) -> Result<Self, EngineError> {
        let Some(state) = store.get::<WallerState>(&keys::waller(uid)).await? else {
            return Err(EngineError::NotFound(format!("waller {uid}")));
        };
        if state.product_id != product.product_id {
            return Err(EngineError::invalid(format!(
                "waller {uid} was created for {}, not {}",
                state.product_id, product.product_id
            )));
        }
        if state.loopers.len() != state.pairs.len() {
            return Err(EngineError::Invariant(format!(
                "waller {uid} has {} loopers for {} pairs",
                state.loopers.len(),
                state.pairs.len()
            )));
        }

        Ok(Self {
            uid: uid.to_owned(),
            product,
            pairs: state.pairs,
            loopers: state.loopers,
        })
    }

    /// Load the waller if a checkpoint exists, otherwise create one.
    ///
    /// # Errors
    ///
    /// See [`Waller::load`] and [`Waller::new`].
    pub async fn load_or_create(
        store: &Store,
        uid: &str,
        product: Product,
        pairs: Vec<Pair>,
    ) -> Result<Self, EngineError> {
        match Self::load(store, uid, product.clone()).await {
            Ok(waller) => Ok(waller),
            Err(EngineError::NotFound(_)) => Self::new(uid, product, pairs),
            Err(err) => Err(err),
        }
    }

    /// The waller's uid.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The persisted shape of the current state.
    #[must_use]
    pub fn state(&self) -> WallerState {
        WallerState {
            product_id: self.product.product_id.clone(),
            pairs: self.pairs.clone(),
            loopers: self.loopers.clone(),
        }
    }

    /// Checkpoint the waller to the store.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] when the write fails.
    pub async fn save(&self, store: &Store) -> Result<(), EngineError> {
        store.set(&keys::waller(&self.uid), &self.state()).await
    }

    /// Run one task per Looper until the stop token fires, then wait for
    /// all of them.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Stopped`] when asked to stop.
    pub async fn run(
        &mut self,
        stop: &StopToken,
        tracker: Arc<Tracker>,
        store: Store,
    ) -> Result<(), EngineError> {
        self.save(&store).await?;

        let mut tasks = Vec::with_capacity(self.pairs.len());
        for (index, pair) in self.pairs.iter().enumerate() {
            let child_uid = self.loopers[index].clone();
            let product = self.product.clone();
            let pair = *pair;
            let tracker = Arc::clone(&tracker);
            let store = store.clone();
            let stop = stop.child();

            tasks.push(tokio::spawn(async move {
                supervise_looper(child_uid, product, pair, tracker, store, stop).await;
            }));
        }

        for task in tasks {
            if let Err(err) = task.await {
                log::error!("Waller {} looper task panicked: {err}", self.uid);
            }
        }

        Err(EngineError::Stopped(stop.cause()))
    }
}

// Run one looper forever: relaunch after non-stop failures, return once
// the stop token fires.
async fn supervise_looper(
    uid: String,
    product: Product,
    pair: Pair,
    tracker: Arc<Tracker>,
    store: Store,
    stop: StopToken,
) {
    loop {
        if stop.is_stopped() {
            return;
        }

        let mut looper = match Looper::load_or_create(&store, &uid, product.clone(), pair).await {
            Ok(looper) => looper,
            Err(err) => {
                log::error!("Could not load looper {uid}: {err}");
                tokio::select! {
                    () = stop.stopped() => return,
                    () = tokio::time::sleep(RETRY_BACKOFF) => continue,
                }
            }
        };

        match looper.run(&stop, &tracker, &store).await {
            Err(err) if err.is_stopped() => return,
            Err(err) => {
                log::error!("Looper {uid} failed, relaunching in {RETRY_BACKOFF:?}: {err}");
                tokio::select! {
                    () = stop.stopped() => return,
                    () = tokio::time::sleep(RETRY_BACKOFF) => {}
                }
            }
            Ok(()) => return,
        }
    }
}
