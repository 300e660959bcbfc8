//! Engine assembly.
//!
//! [`EngineBuilder`] wires the store, the exchange adapter, the
//! reconciliation layer and the job runner into one [`Engine`], runs
//! crash recovery, and hands back the surface operators drive: add,
//! resume, pause, cancel, remove, status.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::EngineError;
use crate::exchange::coinbase::Coinbase;
use crate::exchange::{Exchange, Product};
use crate::job::{JobKind, JobRecord, JobRunner, JobState};
use crate::limiter::Limiter;
use crate::looper::{Looper, RETRY_BACKOFF};
use crate::point::{Pair, Point};
use crate::reconcile::{candles, Tracker};
use crate::shutdown::{StopCause, StopToken};
use crate::status::{limiter_status, looper_status, waller_status, Status};
use crate::store::{keys, Store};
use crate::utils::config::Config;
use crate::waller::Waller;

/// The builder for the [`Engine`] that collects the store, the exchange
/// and the config before anything connects.
pub struct EngineBuilder {
    config: Config,
    store: Option<Store>,
    exchange: Option<Arc<dyn Exchange>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .field("exchange", &self.exchange.is_some())
            .finish()
    }
}

impl EngineBuilder {
    /// A builder over `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            exchange: None,
        }
    }

    /// With a datastore (required).
    #[must_use]
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// With an exchange other than the default Coinbase adapter.
    #[must_use]
    pub fn with_exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Connect everything and run crash recovery.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::FatalInit`] when the store is missing
    /// or the exchange adapter cannot be constructed, and any error of
    /// the initial product catalog fetch.
    pub async fn connect(self) -> Result<Engine, EngineError> {
        let Some(store) = self.store else {
            return Err(EngineError::FatalInit("store is not set".to_owned()));
        };

        let stop = StopToken::new();
        let config = self.config;

        let exchange: Arc<dyn Exchange> = match self.exchange {
            Some(exchange) => exchange,
            None => Arc::new(Coinbase::connect(&config, stop.child()).await?),
        };

        let (tracker, mut tasks) =
            Tracker::start(Arc::clone(&exchange), store.clone(), &config, stop.child()).await;

        tasks.push(tokio::spawn(candles::run(
            Arc::clone(&exchange),
            store.clone(),
            config.watch_product_ids.clone(),
            config.fetch_candles_interval,
            stop.child(),
        )));

        // The product catalog gates every size/price computation; a
        // first fetch failure is a startup failure.
        let products = Arc::new(DashMap::new());
        for product in exchange.get_products().await? {
            products.insert(product.product_id.clone(), product);
        }
        tasks.push(tokio::spawn(refresh_products(
            Arc::clone(&exchange),
            Arc::clone(&products),
            config.fetch_products_interval,
            stop.child(),
        )));

        let jobs = Arc::new(JobRunner::new(store.clone(), stop.child()));

        let engine = Engine {
            store,
            tracker,
            jobs,
            products,
            stop,
            tasks,
        };
        engine.resume_crashed_jobs().await?;

        Ok(engine)
    }
}

/// The assembled trading engine.
pub struct Engine {
    store: Store,
    tracker: Arc<Tracker>,
    jobs: Arc<JobRunner>,
    products: Arc<DashMap<String, Product>>,
    stop: StopToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("products", &self.products.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// The engine's datastore handle.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Known metadata for one product.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] for unknown products.
    pub fn product(&self, product_id: &str) -> Result<Product, EngineError> {
        self.products
            .get(product_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::NotFound(format!("product {product_id}")))
    }

    /// Register a new limiter job in the PAUSED state.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] for a bad point or a size
    /// below the product minimum.
    pub async fn add_limiter(&self, product_id: &str, point: Point) -> Result<String, EngineError> {
        point.check()?;
        let product = self.product(product_id)?;
        check_size(&product, point.size)?;

        let uid = Uuid::new_v4().to_string();
        let mut limiter = Limiter::new(uid.clone(), product, point)?;
        limiter.save(&self.store).await?;
        self.jobs.add(&uid, JobKind::Limiter).await?;

        log::info!("Added limiter {uid} on {product_id}: {point}");
        Ok(uid)
    }

    /// Register a new looper job in the PAUSED state.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] for a bad pair or sizes
    /// below the product minimum.
    pub async fn add_looper(&self, product_id: &str, pair: Pair) -> Result<String, EngineError> {
        pair.check()?;
        let product = self.product(product_id)?;
        check_size(&product, pair.buy.size)?;
        check_size(&product, pair.sell.size)?;

        let uid = Uuid::new_v4().to_string();
        let looper = Looper::new(uid.clone(), product, pair)?;
        looper.save(&self.store).await?;
        self.jobs.add(&uid, JobKind::Looper).await?;

        log::info!("Added looper {uid} on {product_id}: {pair}");
        Ok(uid)
    }

    /// Register a new waller job in the PAUSED state.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] for a bad grid.
    pub async fn add_waller(
        &self,
        product_id: &str,
        pairs: Vec<Pair>,
    ) -> Result<String, EngineError> {
        let product = self.product(product_id)?;
        for pair in &pairs {
            pair.check()?;
            check_size(&product, pair.buy.size)?;
            check_size(&product, pair.sell.size)?;
        }

        let uid = Uuid::new_v4().to_string();
        let waller = Waller::new(uid.clone(), product, pairs)?;
        waller.save(&self.store).await?;
        self.jobs.add(&uid, JobKind::Waller).await?;

        log::info!("Added waller {uid} on {product_id}");
        Ok(uid)
    }

    /// Resume a paused job.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] for unknown jobs,
    /// [`EngineError::Exists`] for already-running ones and
    /// [`EngineError::Invalid`] for terminal ones.
    pub async fn resume(&self, uid: &str) -> Result<(), EngineError> {
        let record = self.jobs.get(uid).await?;

        match record.kind {
            JobKind::Limiter => self.resume_limiter(uid).await,
            JobKind::Looper => self.resume_looper(uid).await,
            JobKind::Waller => self.resume_waller(uid).await,
        }
    }

    async fn resume_limiter(&self, uid: &str) -> Result<(), EngineError> {
        let Some(state) = self
            .store
            .get::<crate::limiter::LimiterState>(&keys::limiter(uid))
            .await?
        else {
            return Err(EngineError::NotFound(format!("limiter {uid}")));
        };
        let product = self.product(&state.product_id)?;
        let mut limiter = Limiter::load(&self.store, uid, product).await?;

        let tracker = Arc::clone(&self.tracker);
        let store = self.store.clone();
        self.jobs
            .resume(uid, move |stop| async move {
                loop {
                    match limiter.run(&stop, &tracker, &store).await {
                        Ok(()) => return Ok(()),
                        Err(err) if err.is_transient() => {
                            log::warn!("Limiter retrying in {RETRY_BACKOFF:?}: {err}");
                            tokio::select! {
                                () = stop.stopped() => {
                                    return Err(EngineError::Stopped(stop.cause()));
                                }
                                () = tokio::time::sleep(RETRY_BACKOFF) => {}
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }
            })
            .await
    }

    async fn resume_looper(&self, uid: &str) -> Result<(), EngineError> {
        let Some(state) = self
            .store
            .get::<crate::looper::LooperState>(&keys::looper(uid))
            .await?
        else {
            return Err(EngineError::NotFound(format!("looper {uid}")));
        };
        let product = self.product(&state.product_id)?;
        let mut looper = Looper::load(&self.store, uid, product).await?;

        let tracker = Arc::clone(&self.tracker);
        let store = self.store.clone();
        self.jobs
            .resume(uid, move |stop| async move {
                looper.run(&stop, &tracker, &store).await
            })
            .await
    }

    async fn resume_waller(&self, uid: &str) -> Result<(), EngineError> {
        let Some(state) = self
            .store
            .get::<crate::waller::WallerState>(&keys::waller(uid))
            .await?
        else {
            return Err(EngineError::NotFound(format!("waller {uid}")));
        };
        let product = self.product(&state.product_id)?;
        let mut waller = Waller::load(&self.store, uid, product).await?;

        let tracker = Arc::clone(&self.tracker);
        let store = self.store.clone();
        self.jobs
            .resume(uid, move |stop| async move {
                waller.run(&stop, tracker, store).await
            })
            .await
    }

    /// Pause a job; see [`JobRunner::pause`].
    ///
    /// # Errors
    ///
    /// See [`JobRunner::pause`].
    pub async fn pause(&self, uid: &str) -> Result<(), EngineError> {
        self.jobs.pause(uid).await
    }

    /// Cancel a job; see [`JobRunner::cancel`].
    ///
    /// # Errors
    ///
    /// See [`JobRunner::cancel`].
    pub async fn cancel(&self, uid: &str) -> Result<(), EngineError> {
        self.jobs.cancel(uid).await
    }

    /// Remove a non-running job; see [`JobRunner::remove`].
    ///
    /// # Errors
    ///
    /// See [`JobRunner::remove`].
    pub async fn remove(&self, uid: &str) -> Result<(), EngineError> {
        self.jobs.remove(uid).await
    }

    /// Pause every running job and wait for all of them.
    pub async fn pause_all(&self) {
        self.jobs.pause_all().await;
    }

    /// All job records in uid order.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn jobs(&self) -> Result<Vec<(String, JobRecord)>, EngineError> {
        self.jobs.scan().await
    }

    /// Status of one job's supervisor, computed from checkpoints.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] for unknown jobs.
    pub async fn status(&self, uid: &str) -> Result<Status, EngineError> {
        let record = self.jobs.get(uid).await?;

        Ok(match record.kind {
            JobKind::Limiter => Status::Limiter(limiter_status(&self.store, uid).await?),
            JobKind::Looper => Status::Looper(looper_status(&self.store, uid).await?),
            JobKind::Waller => Status::Waller(waller_status(&self.store, uid).await?),
        })
    }

    // Jobs persisted as RUNNING were interrupted by a crash; relaunch
    // them. Jobs the user paused stay paused.
    async fn resume_crashed_jobs(&self) -> Result<(), EngineError> {
        for (uid, record) in self.jobs.scan().await? {
            if record.state != JobState::Running {
                continue;
            }

            log::info!("Resuming job {uid} interrupted by a crash");
            if let Err(err) = self.resume(&uid).await {
                log::error!("Could not resume crashed job {uid}: {err}");
            }
        }

        Ok(())
    }

    /// Pause all jobs, stop every background task and wait for them.
    pub async fn shutdown(mut self) {
        self.jobs.pause_all().await;
        self.stop.signal(StopCause::Cancel);

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                log::warn!("Background task ended abnormally: {err}");
            }
        }
    }
}

fn check_size(product: &Product, size: Decimal) -> Result<(), EngineError> {
    if size < product.base_min_size {
        return Err(EngineError::invalid(format!(
            "size {size} is below the {} minimum {}",
            product.product_id, product.base_min_size
        )));
    }
    if size > product.base_max_size {
        return Err(EngineError::invalid(format!(
            "size {size} is above the {} maximum {}",
            product.product_id, product.base_max_size
        )));
    }

    Ok(())
}

async fn refresh_products(
    exchange: Arc<dyn Exchange>,
    products: Arc<DashMap<String, Product>>,
    interval: std::time::Duration,
    stop: StopToken,
) {
    loop {
        tokio::select! {
            () = stop.stopped() => return,
            () = tokio::time::sleep(interval) => {}
        }

        match exchange.get_products().await {
            Ok(fresh) => {
                for product in fresh {
                    products.insert(product.product_id.clone(), product);
                }
            }
            Err(err) => log::warn!("Product catalog refresh failed: {err}"),
        }
    }
}
