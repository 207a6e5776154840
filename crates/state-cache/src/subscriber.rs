//! Per entity state machine tying logs, snapshots and state generation
//! together.

use {
    crate::{
        EventSourced,
        LogMeta,
        Reduction,
        SnapshotStore,
        SubscriberConfig,
        generator,
        log_source::{BlockLogSource, LogSubscribing, SubscriptionId},
    },
    alloy::{primitives::Address, rpc::types::Log},
    anyhow::{Context as _, Result},
    ethrpc::{Block, BlockInfo},
    prometheus::IntCounterVec,
    std::sync::{Arc, Mutex, RwLock},
    tracing::instrument,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Uninitialized,
    Initializing,
    Live,
    /// The tracked entity no longer exists. Terminal.
    Invalidated,
}

/// Keeps the recent states of one on-chain entity up to date by reducing the
/// logs of its addresses.
///
/// Blocks whose logs cannot be reduced are regenerated from chain reads
/// instead, so a stored snapshot is never the result of a partially applied
/// block.
pub struct Subscriber<H: EventSourced> {
    name: String,
    metrics_label: &'static str,
    handler: H,
    addresses: RwLock<Vec<Address>>,
    log_source: Arc<dyn BlockLogSource>,
    config: SubscriberConfig,
    inner: Mutex<Inner<H::State>>,
    metrics: &'static Metrics,
}

struct Inner<S> {
    status: Status,
    store: SnapshotStore<S>,
    pending: Option<Pending<S>>,
    subscription: Option<SubscriptionId>,
    /// Most recent block that was delivered by the log source. Blocks up to it
    /// arriving again mean the chain reorganized.
    followed: Option<u64>,
}

/// The state of the block whose logs are currently being reduced.
enum Pending<S> {
    Clean { block: BlockInfo, state: Arc<S> },
    Poisoned { block: BlockInfo, reason: String },
}

impl<S> Pending<S> {
    fn block(&self) -> &BlockInfo {
        match self {
            Self::Clean { block, .. } | Self::Poisoned { block, .. } => block,
        }
    }
}

impl<S> Inner<S> {
    /// The state a block without any logs so far starts from.
    fn base(&self, block: &BlockInfo) -> Pending<S> {
        let Some(base) = self.store.latest_before(block.number) else {
            return Pending::Poisoned {
                block: *block,
                reason: "no snapshot before block".to_string(),
            };
        };
        if base.block_number + 1 < block.number {
            return Pending::Poisoned {
                block: *block,
                reason: format!(
                    "blocks {} to {} were never followed",
                    base.block_number + 1,
                    block.number - 1
                ),
            };
        }
        Pending::Clean {
            block: *block,
            state: base.state,
        }
    }

    /// Forgets a block whose state could neither be reduced nor generated.
    ///
    /// Without a snapshot of it the next block cannot be reduced either. A
    /// block replacing followed ones also drops their now outdated snapshots.
    fn lose(&mut self, block: u64) {
        if self.followed.is_some_and(|followed| block <= followed) {
            self.store.truncate(block);
        }
    }
}

impl<H: EventSourced> Subscriber<H> {
    pub fn new(
        name: impl Into<String>,
        metrics_label: &'static str,
        handler: H,
        addresses: Vec<Address>,
        log_source: Arc<dyn BlockLogSource>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            name: name.into(),
            metrics_label,
            handler,
            addresses: RwLock::new(addresses),
            log_source,
            config,
            inner: Mutex::new(Inner {
                status: Status::Uninitialized,
                store: SnapshotStore::new(config.snapshot_retention),
                pending: None,
                subscription: None,
                followed: None,
            }),
            metrics: Metrics::instance(observe::metrics::get_storage_registry()).unwrap(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.addresses.read().unwrap().clone()
    }

    /// The id under which the subscriber is registered with its log source.
    /// Owners use it to unsubscribe after [`Self::invalidate`].
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.inner.lock().unwrap().subscription
    }

    /// Stores the state at `block` and starts following the logs of all later
    /// blocks.
    ///
    /// Without a `seed` the state is generated from chain reads. On failure
    /// the subscriber stays uninitialized and initialization can be retried.
    #[instrument(skip(self, seed), fields(name = %self.name))]
    pub async fn initialize(self: &Arc<Self>, block: u64, seed: Option<H::State>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            anyhow::ensure!(
                inner.status == Status::Uninitialized,
                "cannot initialize subscriber in status {:?}",
                inner.status
            );
            inner.status = Status::Initializing;
        }

        let state = match seed {
            Some(state) => Ok(state),
            None => self.generate_with_retries(block).await,
        };
        let result = state.and_then(|state| self.start(block, state));
        if result.is_err() {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != Status::Invalidated {
                inner.status = Status::Uninitialized;
                inner.store = SnapshotStore::new(self.config.snapshot_retention);
            }
        }
        result
    }

    fn start(self: &Arc<Self>, block: u64, state: H::State) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            anyhow::ensure!(
                inner.status == Status::Initializing,
                "subscriber was invalidated during initialization"
            );
            inner.store.put(block, Arc::new(state))?;
            inner.followed = Some(block);
            inner.status = Status::Live;
        }

        let subscriber: Arc<dyn LogSubscribing> = self.clone();
        let id = self
            .log_source
            .subscribe(subscriber, self.addresses(), block)
            .context("failed to subscribe to block logs")?;
        self.inner.lock().unwrap().subscription = Some(id);
        tracing::debug!(?id, "subscriber live");
        Ok(())
    }

    /// Reduces all logs of a block and commits the result.
    pub async fn on_block(&self, block: &BlockInfo, logs: &[Log]) {
        for log in logs {
            self.on_log(log, block);
        }
        self.finish_block(block).await;
    }

    /// The state at exactly `block`.
    pub fn get_state(&self, block: u64) -> Option<Arc<H::State>> {
        let state = self.inner.lock().unwrap().store.get(block);
        let counter = match state {
            Some(_) => &self.metrics.hits,
            None => &self.metrics.misses,
        };
        counter.with_label_values(&[self.metrics_label]).inc();
        state
    }

    /// The most recent state, whatever block it belongs to.
    pub fn get_stale_state(&self) -> Option<Arc<H::State>> {
        self.inner.lock().unwrap().store.get_stale()
    }

    pub fn get_state_block_number(&self) -> Option<u64> {
        self.inner.lock().unwrap().store.latest_block_number()
    }

    /// Builds the state at `block` from chain reads without storing it.
    pub async fn generate_state(&self, block: Block) -> Result<H::State> {
        self.handler.generate_state(block).await
    }

    /// Stores a state that was generated for `block`.
    pub fn put_state(&self, block: u64, state: H::State) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        anyhow::ensure!(
            inner.status == Status::Live,
            "cannot store state in status {:?}",
            inner.status
        );
        inner.store.put(block, Arc::new(state))?;
        Ok(())
    }

    /// The state at `block`, generated from chain reads on a cache miss.
    ///
    /// Generated states are cached if they are more recent than everything
    /// stored so far. Once the log source reaches such a block its reduced
    /// state replaces the generated one. Returns `None` if no state is
    /// available.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn state_or_generate(&self, block: u64) -> Option<Arc<H::State>> {
        if let Some(state) = self.get_state(block) {
            return Some(state);
        }
        let state = match self.handler.generate_state(Block::Number(block)).await {
            Ok(state) => Arc::new(state),
            Err(err) => {
                tracing::warn!(?err, "no state available");
                return None;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        let is_newer = inner
            .store
            .latest_block_number()
            .is_none_or(|latest| block > latest);
        if inner.status == Status::Live && is_newer {
            if let Err(err) = inner.store.put(block, state.clone()) {
                tracing::debug!(?err, "generated state not stored");
            }
        }
        Some(state)
    }

    /// Drops all state and stops processing logs for good.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = Status::Invalidated;
        inner.pending = None;
        inner.store.invalidate();
        tracing::debug!(name = %self.name, "subscriber invalidated");
    }

    /// Starts watching additional addresses. Already watched ones are
    /// ignored.
    pub fn extend_watch_set(&self, addresses: impl IntoIterator<Item = Address>) -> Result<()> {
        let added = {
            let mut watched = self.addresses.write().unwrap();
            let mut added = Vec::new();
            for address in addresses {
                if !watched.contains(&address) && !added.contains(&address) {
                    added.push(address);
                }
            }
            watched.extend(&added);
            added
        };
        if added.is_empty() {
            return Ok(());
        }
        tracing::debug!(name = %self.name, ?added, "extending watch set");
        match self.subscription() {
            Some(id) => self.log_source.extend(id, added),
            None => Ok(()),
        }
    }

    async fn generate_with_retries(&self, block: u64) -> Result<H::State> {
        generator::with_retries(&self.config, || {
            self.handler.generate_state(Block::Number(block))
        })
        .await
    }

    /// Stores the state of a followed block. A block that is not after the
    /// last followed one replaces it and everything after it.
    fn commit(&self, inner: &mut Inner<H::State>, block: u64, state: Arc<H::State>) {
        let reorg = inner.followed.is_some_and(|followed| block <= followed);
        let result = match reorg {
            true => inner.store.supersede(block, state).map(|dropped| {
                tracing::debug!(name = %self.name, block, dropped, "superseded snapshots");
                self.metrics
                    .reorgs
                    .with_label_values(&[self.metrics_label])
                    .inc();
            }),
            // Generated snapshots of blocks ahead of the log source stay.
            false => inner.store.insert(block, state),
        };
        match result {
            Ok(()) => inner.followed = Some(block),
            Err(err) => tracing::debug!(name = %self.name, ?err, "snapshot not stored"),
        }
    }

    /// Takes the pending state if it belongs to `block`.
    ///
    /// A clean pending state of an earlier block that never got finished is
    /// committed. A poisoned one poisons `block` as well since its base is
    /// unknown.
    fn take_pending(
        &self,
        inner: &mut Inner<H::State>,
        block: &BlockInfo,
    ) -> Option<Pending<H::State>> {
        match inner.pending.take()? {
            pending if pending.block() == block => Some(pending),
            Pending::Clean {
                block: previous,
                state,
            } if previous.number < block.number => {
                tracing::debug!(
                    name = %self.name,
                    block = previous.number,
                    "committing unfinished block"
                );
                self.commit(inner, previous.number, state);
                None
            }
            Pending::Poisoned {
                block: previous,
                reason,
            } if previous.number < block.number => {
                tracing::warn!(
                    name = %self.name,
                    block = previous.number,
                    %reason,
                    "unfinished block could not be reduced"
                );
                inner.lose(previous.number);
                None
            }
            // A different block with the same or a lower number replaces
            // everything reduced so far.
            _ => None,
        }
    }

    async fn regenerate(&self, block: &BlockInfo, reason: &str) {
        tracing::debug!(%reason, "regenerating block state");
        self.metrics
            .regenerations
            .with_label_values(&[self.metrics_label])
            .inc();
        let state = self.generate_with_retries(block.number).await;

        let mut inner = self.inner.lock().unwrap();
        if inner.status != Status::Live {
            return;
        }
        match state {
            Ok(state) => self.commit(&mut inner, block.number, Arc::new(state)),
            Err(err) => {
                tracing::error!(?err, "failed to regenerate block state");
                inner.lose(block.number);
            }
        }
    }
}

#[async_trait::async_trait]
impl<H: EventSourced> LogSubscribing for Subscriber<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_log(&self, log: &Log, block: &BlockInfo) {
        if log.removed {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.status != Status::Live {
            return;
        }

        let pending = self
            .take_pending(&mut inner, block)
            .unwrap_or_else(|| inner.base(block));
        let pending = match pending {
            Pending::Clean { block, state } => {
                let meta = LogMeta::new(log, &block);
                match self.handler.apply(&state, log, &meta) {
                    Reduction::Updated(state) => Pending::Clean {
                        block,
                        state: Arc::new(state),
                    },
                    Reduction::Unchanged | Reduction::Unhandled => Pending::Clean { block, state },
                    Reduction::Inconsistent(reason) => {
                        tracing::debug!(
                            name = %self.name,
                            block = block.number,
                            %reason,
                            "inconsistent log"
                        );
                        Pending::Poisoned { block, reason }
                    }
                }
            }
            poisoned => poisoned,
        };
        inner.pending = Some(pending);
    }

    #[instrument(skip_all, fields(name = %self.name, block = block.number))]
    async fn finish_block(&self, block: &BlockInfo) {
        let reason = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != Status::Live {
                return;
            }
            // Without logs the block does not change the state.
            let pending = self
                .take_pending(&mut inner, block)
                .unwrap_or_else(|| inner.base(block));
            match pending {
                Pending::Clean { state, .. } => {
                    self.commit(&mut inner, block.number, state);
                    return;
                }
                Pending::Poisoned { reason, .. } => reason,
            }
        };
        self.regenerate(block, &reason).await;
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "state_cache")]
struct Metrics {
    /// Snapshot lookups that found the requested block.
    #[metric(labels("source"))]
    hits: IntCounterVec,

    /// Snapshot lookups that did not find the requested block.
    #[metric(labels("source"))]
    misses: IntCounterVec,

    /// Blocks whose state had to be generated because reduction failed.
    #[metric(labels("source"))]
    regenerations: IntCounterVec,

    /// Blocks that replaced already stored snapshots.
    #[metric(labels("source"))]
    reorgs: IntCounterVec,
}
