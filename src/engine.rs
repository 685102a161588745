//! Main sync loop
//!
//! Orchestrates polling the ledger for new blocks, matching their events
//! against the watch registry, refreshing affected objects, and resolving
//! pending transactions.
//!
//! The engine owns every mutable structure (registry, tracker, caches) and
//! runs as a single task. A poll always finishes before the next tick is
//! armed, and caller requests arriving through a [`SyncHandle`] are served
//! between polls, so nothing here needs a lock.

use crate::cache::{CacheSnapshot, ObjectCache};
use crate::error::{SyncError, SyncResult};
use crate::hooks::{ObjectId, WatchTarget};
use crate::identity::{IdentityChange, IdentityMonitor};
use crate::ledger::{Ledger, LedgerError};
use crate::logs::{fetch_block_logs, transaction_logs, EventLogEntry};
use crate::model::{count_objects, enumeration_range, refresh_object, CompiledModel, MethodCall, ObjectMethods};
use crate::registry::{UnhookedWatchPolicy, WatchId, WatchRegistry};
use crate::tracker::{PendingTx, PendingTxTracker};
use crate::types::{Block, Receipt};
use alloy_primitives::Address;
use futures::future::{join_all, try_join_all};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Runtime settings for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name attached to the engine's log span
    pub system_name: String,
    /// Delay between the end of one poll and the start of the next
    pub poll_interval: Duration,
    /// Most blocks processed in one poll when the chain has moved ahead
    pub max_catchup_blocks: u64,
    pub unhooked_watches: UnhookedWatchPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_name: "Windlass".to_string(),
            poll_interval: Duration::from_secs(1),
            max_catchup_blocks: 32,
            unhooked_watches: UnhookedWatchPolicy::default(),
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No new block.
    Idle,
    /// Blocks `from..=to` were processed.
    Processed { from: u64, to: u64 },
    /// The ledger could not be read; nothing was processed.
    Failed,
}

/// Work queued by watch callbacks during block evaluation.
#[derive(Debug)]
enum Trigger {
    Discovered { model: String, key: ObjectId },
    Changed { model: String, key: ObjectId },
    Removed { model: String, key: ObjectId },
}

struct ModelState {
    model: CompiledModel,
    /// Tracked keys and their concrete watch (`None` when the model has no
    /// update hooks and unhooked watches are rejected)
    tracked: BTreeMap<ObjectId, Option<WatchId>>,
    cache: ObjectCache,
}

enum Command {
    WatchObject {
        model: String,
        key: ObjectId,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    StopWatch {
        model: String,
        key: ObjectId,
        reply: oneshot::Sender<SyncResult<bool>>,
    },
    Enumerate {
        model: String,
        limit: u64,
        offset: u64,
        reply: oneshot::Sender<SyncResult<usize>>,
    },
    Invoke {
        model: String,
        call: MethodCall,
        reply: oneshot::Sender<SyncResult<PendingTx>>,
    },
}

/// Synchronizes model caches with the ledger.
pub struct SyncEngine<L: Ledger> {
    ledger: Arc<L>,
    config: EngineConfig,
    contracts: Vec<String>,
    registry: WatchRegistry,
    pending: PendingTxTracker,
    identity: IdentityMonitor,
    models: BTreeMap<String, ModelState>,
    /// Tracked objects whose last refresh failed, re-read on every poll
    stale: BTreeSet<(String, ObjectId)>,
    /// Head reported by the first poll, where processing starts
    first_head: Option<u64>,
    latest_block: Option<u64>,
    triggers_tx: mpsc::UnboundedSender<Trigger>,
    triggers_rx: mpsc::UnboundedReceiver<Trigger>,
    commands_rx: mpsc::Receiver<Command>,
    cache_tx: watch::Sender<Arc<CacheSnapshot>>,
    identity_tx: watch::Sender<Option<Address>>,
}

impl<L: Ledger> SyncEngine<L> {
    /// Create an engine and the handle callers use to reach it.
    ///
    /// Registers one wildcard watch per model that declares creation events.
    pub fn new(
        ledger: Arc<L>,
        config: EngineConfig,
        models: Vec<CompiledModel>,
    ) -> SyncResult<(Self, SyncHandle)> {
        let contracts = ledger.contract_names();
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (cache_tx, cache_rx) = watch::channel(Arc::new(CacheSnapshot::new()));
        let (identity_tx, identity_rx) = watch::channel(None);

        let mut engine = Self {
            ledger,
            registry: WatchRegistry::new(config.unhooked_watches),
            config,
            contracts,
            pending: PendingTxTracker::new(),
            identity: IdentityMonitor::new(),
            models: BTreeMap::new(),
            stale: BTreeSet::new(),
            first_head: None,
            latest_block: None,
            triggers_tx,
            triggers_rx,
            commands_rx,
            cache_tx,
            identity_tx,
        };

        info!("Initializing {} object models...", models.len());
        for model in models {
            engine.add_model(model)?;
        }
        engine.publish();

        let handle = SyncHandle {
            commands: commands_tx,
            cache: cache_rx,
            identity: identity_rx,
        };
        Ok((engine, handle))
    }

    fn add_model(&mut self, model: CompiledModel) -> SyncResult<()> {
        let name = model.name().to_string();
        if self.models.contains_key(&name) {
            return Err(SyncError::InvalidModel {
                model: name,
                reason: "declared twice".to_string(),
            });
        }
        for contract in model.definition.events.keys() {
            if !self.contracts.contains(contract) {
                warn!(
                    "Model {} listens to {} events, but no such contract is bound",
                    name, contract
                );
            }
        }

        if !model.creation_hooks.is_empty() {
            let tx = self.triggers_tx.clone();
            let model_name = name.clone();
            self.registry.subscribe(
                WatchTarget::Any,
                model.creation_hooks.clone(),
                Box::new(move |key: ObjectId| {
                    let _ = tx.send(Trigger::Discovered {
                        model: model_name.clone(),
                        key,
                    });
                }),
                None,
            )?;
        }

        debug!("...Initialized model {}", name);
        self.models.insert(
            name,
            ModelState {
                model,
                tracked: BTreeMap::new(),
                cache: ObjectCache::new(),
            },
        );
        Ok(())
    }

    /// Highest block fully processed so far.
    pub fn latest_block(&self) -> Option<u64> {
        self.latest_block
    }

    pub fn pending_transactions(&self) -> usize {
        self.pending.len()
    }

    /// Tracked objects waiting for a successful re-read.
    pub fn stale_objects(&self) -> usize {
        self.stale.len()
    }

    pub fn methods(&self, model: &str) -> Option<&ObjectMethods> {
        self.models.get(model).map(|state| &state.model.methods)
    }

    pub fn cache(&self, model: &str) -> Option<&ObjectCache> {
        self.models.get(model).map(|state| &state.cache)
    }

    /// Copy of every model's cache.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::new(
            self.models
                .iter()
                .map(|(name, state)| (name.clone(), state.cache.clone()))
                .collect(),
        )
    }

    fn publish(&self) {
        self.cache_tx.send_replace(self.snapshot());
    }

    /// Run the sync loop until the task is cancelled.
    ///
    /// The first poll starts immediately; each following one starts
    /// `poll_interval` after the previous one finished.
    #[instrument(skip_all, fields(system = %self.config.system_name))]
    pub async fn run(mut self) {
        info!("Starting sync loop (poll interval {:?})", self.config.poll_interval);

        let mut next_tick = Instant::now();
        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {
                    self.poll().await;
                    next_tick = Instant::now() + self.config.poll_interval;
                }
                command = self.commands_rx.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All handles dropped, serving polls only");
                        commands_open = false;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::WatchObject { model, key, reply } => {
                let _ = reply.send(self.watch_object(&model, key).await);
            }
            Command::StopWatch { model, key, reply } => {
                let _ = reply.send(self.stop_watch(&model, key).await);
            }
            Command::Enumerate {
                model,
                limit,
                offset,
                reply,
            } => {
                let _ = reply.send(self.enumerate_objects(&model, limit, offset).await);
            }
            Command::Invoke { model, call, reply } => {
                let _ = reply.send(self.invoke(&model, call).await);
            }
        }
    }

    /// One poll: refresh the signing identity, retry stale objects, then
    /// process any new blocks.
    ///
    /// Ledger failures are logged and end the poll early; a block whose
    /// events or receipts could not be read is not marked processed and is
    /// retried on the next poll.
    pub async fn poll(&mut self) -> PollOutcome {
        debug!("Beginning poll");
        self.refresh_identity().await;
        if !self.stale.is_empty() {
            debug!("Retrying {} stale objects", self.stale.len());
            self.drain_triggers().await;
        }

        let height = match self.ledger.current_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!("{}", SyncError::unavailable("current_height", e));
                return PollOutcome::Failed;
            }
        };

        let Some(range) = self.next_range(height) else {
            debug!("Up to date. Latest: {:?}, height: {}", self.latest_block, height);
            return PollOutcome::Idle;
        };

        let from = *range.start();
        let mut processed = None;
        for number in range {
            if let Err(e) = self.process_block(number).await {
                warn!("Block {} not processed, will retry: {}", number, e);
                return match processed {
                    Some(to) => PollOutcome::Processed { from, to },
                    None => PollOutcome::Failed,
                };
            }
            self.latest_block = Some(number);
            processed = Some(number);
        }

        match processed {
            Some(to) => PollOutcome::Processed { from, to },
            None => PollOutcome::Idle,
        }
    }

    /// Blocks to process for a reported `height`, or `None` if nothing is new.
    ///
    /// Processing starts at the head seen by the first poll, and stays there
    /// until that block goes through.
    fn next_range(&mut self, height: u64) -> Option<RangeInclusive<u64>> {
        let next = match self.latest_block {
            Some(latest) => latest + 1,
            None => *self.first_head.get_or_insert(height),
        };
        if height < next {
            return None;
        }

        let window = self.config.max_catchup_blocks.max(1);
        let from = next.max(height.saturating_sub(window - 1));
        if from > next {
            warn!(
                "Skipping blocks {}..={} (beyond catch-up window of {})",
                next,
                from - 1,
                window
            );
        }
        Some(from..=height)
    }

    /// Every ledger read for a block happens before any state changes, so a
    /// failed block leaves nothing half-applied and can simply be retried.
    async fn process_block(&mut self, number: u64) -> SyncResult<()> {
        let block = self
            .ledger
            .get_block(number)
            .await
            .map_err(|e| SyncError::unavailable(format!("get_block({})", number), e))?;
        let events = fetch_block_logs(self.ledger.as_ref(), number, &self.contracts).await?;
        let receipts = self.fetch_receipts(&block).await?;

        info!(
            "New block detected: {} ({} transactions, {} events)",
            number,
            block.transactions.len(),
            events.len()
        );

        let fired = self.registry.evaluate(&events);
        if fired > 0 {
            debug!("Block {} fired {} watch callbacks", number, fired);
        }
        self.drain_triggers().await;
        self.resolve_transactions(receipts, &events);
        Ok(())
    }

    /// Receipts for the block's transactions that someone is waiting on.
    ///
    /// A lookup that fails, or a receipt the node does not have yet, fails
    /// the block.
    async fn fetch_receipts(&self, block: &Block) -> SyncResult<Vec<Receipt>> {
        let ledger = self.ledger.as_ref();
        let lookups = block
            .transactions
            .iter()
            .filter(|hash| self.pending.is_pending(hash))
            .map(|hash| async move {
                let operation = format!("get_transaction_receipt({:?})", hash);
                match ledger.get_transaction_receipt(*hash).await {
                    Ok(Some(receipt)) => Ok(receipt),
                    Ok(None) => Err(SyncError::unavailable(
                        operation,
                        LedgerError::NotFound(format!(
                            "receipt for {:?} in block {}",
                            hash, block.number
                        )),
                    )),
                    Err(e) => Err(SyncError::unavailable(operation, e)),
                }
            });
        try_join_all(lookups).await
    }

    fn resolve_transactions(&mut self, receipts: Vec<Receipt>, events: &[EventLogEntry]) {
        for receipt in receipts {
            let hash = receipt.transaction_hash;
            self.pending
                .resolve(hash, receipt, transaction_logs(events, hash));
        }
    }

    async fn refresh_identity(&mut self) {
        let seen = match self.ledger.current_signing_identity().await {
            Ok(seen) => seen,
            Err(e) => {
                warn!("{}", SyncError::unavailable("current_signing_identity", e));
                return;
            }
        };

        match self.identity.observe(seen) {
            IdentityChange::Initial(identity) => {
                info!("Initial identity detected: {:?}", identity);
                self.identity_tx.send_replace(Some(identity));
            }
            IdentityChange::Changed { previous, current } => {
                info!("New identity selected: {:?} (was {:?})", current, previous);
                self.identity_tx.send_replace(Some(current));
            }
            IdentityChange::Pending => {
                warn!("{}; waiting for an identity to be selected", SyncError::IdentityUnavailable)
            }
            IdentityChange::Unchanged | IdentityChange::StillPending => {}
        }
    }

    /// Start tracking `key`: register its concrete watch.
    ///
    /// Returns `false` if the key was already tracked.
    fn track(&mut self, model: &str, key: ObjectId) -> SyncResult<bool> {
        let state = self
            .models
            .get_mut(model)
            .ok_or_else(|| SyncError::UnknownModel(model.to_string()))?;
        if state.tracked.contains_key(&key) {
            return Ok(false);
        }

        let update_tx = self.triggers_tx.clone();
        let delete_tx = self.triggers_tx.clone();
        let update_model = model.to_string();
        let delete_model = model.to_string();
        let subscribed = self.registry.subscribe(
            WatchTarget::Key(key),
            state.model.update_hooks.clone(),
            Box::new(move |key: ObjectId| {
                let _ = update_tx.send(Trigger::Changed {
                    model: update_model.clone(),
                    key,
                });
            }),
            Some(Box::new(move |target: WatchTarget| {
                if let WatchTarget::Key(key) = target {
                    let _ = delete_tx.send(Trigger::Removed {
                        model: delete_model,
                        key,
                    });
                }
            })),
        );

        let watch = match subscribed {
            Ok(id) => Some(id),
            Err(SyncError::MissingHooks) => {
                warn!(
                    "{} declares no update events; #{} is read once and never refreshed",
                    model, key
                );
                None
            }
            Err(e) => return Err(e),
        };
        state.tracked.insert(key, watch);
        Ok(true)
    }

    /// Apply everything the watch callbacks queued: track discovered keys,
    /// refresh changed and stale ones, drop removed ones. Publishes once if
    /// anything in the cache changed.
    async fn drain_triggers(&mut self) {
        let mut refreshes: Vec<(String, ObjectId)> =
            std::mem::take(&mut self.stale).into_iter().collect();
        let mut changed = false;

        while let Ok(trigger) = self.triggers_rx.try_recv() {
            match trigger {
                Trigger::Discovered { model, key } => {
                    match self.track(&model, key) {
                        Ok(true) => info!("Discovered new {} #{}", model, key),
                        Ok(false) => {}
                        Err(e) => warn!("Failed to track {} #{}: {}", model, key, e),
                    }
                    if !refreshes.iter().any(|(m, k)| *m == model && *k == key) {
                        refreshes.push((model, key));
                    }
                }
                Trigger::Changed { model, key } => {
                    if !refreshes.iter().any(|(m, k)| *m == model && *k == key) {
                        refreshes.push((model, key));
                    }
                }
                Trigger::Removed { model, key } => {
                    refreshes.retain(|(m, k)| !(*m == model && *k == key));
                    if let Some(state) = self.models.get_mut(&model) {
                        state.tracked.remove(&key);
                        changed |= state.cache.remove(key).is_some();
                    }
                }
            }
        }

        changed |= self.refresh_all(refreshes).await;
        if changed {
            self.publish();
        }
    }

    /// Re-read every `(model, key)` concurrently and store the results.
    ///
    /// Returns whether any cache entry was written. A failed read leaves the
    /// previous entry untouched and marks the object stale, so the next poll
    /// reads it again.
    async fn refresh_all(&mut self, keys: Vec<(String, ObjectId)>) -> bool {
        if keys.is_empty() {
            return false;
        }

        let ledger = Arc::clone(&self.ledger);
        let models = &self.models;
        let reads = keys.iter().map(|(model, key)| {
            let ledger = ledger.as_ref();
            async move {
                let state = models
                    .get(model)
                    .ok_or_else(|| SyncError::UnknownModel(model.clone()))?;
                refresh_object(ledger, &state.model, *key).await
            }
        });
        let results = join_all(reads).await;

        let mut changed = false;
        for ((model, key), result) in keys.into_iter().zip(results) {
            match result {
                Ok(object) => {
                    if let Some(state) = self.models.get_mut(&model) {
                        if state.tracked.contains_key(&key) {
                            debug!("Refreshed {} #{}", model, key);
                            state.cache.insert(key, object);
                            changed = true;
                        }
                    }
                }
                Err(e) => {
                    let tracked = self
                        .models
                        .get(&model)
                        .is_some_and(|state| state.tracked.contains_key(&key));
                    if tracked {
                        warn!("Failed to refresh {} #{}, will retry: {}", model, key, e);
                        self.stale.insert((model, key));
                    } else {
                        warn!("Failed to refresh {} #{}: {}", model, key, e);
                    }
                }
            }
        }
        changed
    }

    /// Track `key` and read it into the cache right away.
    ///
    /// A failed initial read is logged; the watch stays in place and the
    /// object is read again on the next poll.
    pub async fn watch_object(&mut self, model: &str, key: ObjectId) -> SyncResult<()> {
        self.track(model, key)?;
        if self.refresh_all(vec![(model.to_string(), key)]).await {
            self.publish();
        }
        Ok(())
    }

    /// Stop tracking `key` and drop its cache entry.
    ///
    /// Returns `false` if the key was not tracked.
    pub async fn stop_watch(&mut self, model: &str, key: ObjectId) -> SyncResult<bool> {
        let state = self
            .models
            .get_mut(model)
            .ok_or_else(|| SyncError::UnknownModel(model.to_string()))?;
        let Some(watch) = state.tracked.remove(&key) else {
            return Ok(false);
        };

        match watch {
            Some(id) => {
                self.registry.unsubscribe(id);
            }
            None => {
                let _ = self.triggers_tx.send(Trigger::Removed {
                    model: model.to_string(),
                    key,
                });
            }
        }
        self.drain_triggers().await;
        Ok(true)
    }

    /// Backfill objects `[offset, offset + limit)` as counted by the model's
    /// default enumerator. Returns how many keys were read.
    pub async fn enumerate_objects(&mut self, model: &str, limit: u64, offset: u64) -> SyncResult<usize> {
        let state = self
            .models
            .get(model)
            .ok_or_else(|| SyncError::UnknownModel(model.to_string()))?;
        let count = count_objects(self.ledger.as_ref(), &state.model).await?;
        let range = enumeration_range(count, limit, offset);
        info!(
            "Enumerating {} objects {:?} of {}",
            model, range, count
        );

        let mut keys = Vec::new();
        for key in range {
            self.track(model, key)?;
            keys.push((model.to_string(), key));
        }
        let total = keys.len();
        if self.refresh_all(keys).await {
            self.publish();
        }
        Ok(total)
    }

    /// Submit a write against `model` and return its completion handle.
    ///
    /// Returns as soon as the ledger accepts the transaction; the handle
    /// resolves when a later poll sees it in a block.
    pub async fn invoke(&mut self, model: &str, call: MethodCall) -> SyncResult<PendingTx> {
        if self.identity.current().is_none() {
            self.refresh_identity().await;
        }
        let signer = self.identity.current().ok_or(SyncError::IdentityUnavailable)?;

        let state = self
            .models
            .get(model)
            .ok_or_else(|| SyncError::UnknownModel(model.to_string()))?;
        let (method, args) = state.model.methods.prepare(call)?;

        let hash = self
            .ledger
            .send_transaction(&method.contract, &method.method, &args, signer)
            .await
            .map_err(|e| {
                SyncError::unavailable(format!("{}.{}", method.contract, method.method), e)
            })?;
        info!("{}: submitted TX {:?}", method.title, hash);
        Ok(self.pending.register(hash))
    }
}

/// Cloneable handle for talking to a running [`SyncEngine`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    cache: watch::Receiver<Arc<CacheSnapshot>>,
    identity: watch::Receiver<Option<Address>>,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub async fn watch_object(&self, model: &str, key: ObjectId) -> SyncResult<()> {
        let model = model.to_string();
        self.request(|reply| Command::WatchObject { model, key, reply })
            .await
    }

    pub async fn stop_watch(&self, model: &str, key: ObjectId) -> SyncResult<bool> {
        let model = model.to_string();
        self.request(|reply| Command::StopWatch { model, key, reply })
            .await
    }

    pub async fn enumerate_objects(&self, model: &str, limit: u64, offset: u64) -> SyncResult<usize> {
        let model = model.to_string();
        self.request(|reply| Command::Enumerate {
            model,
            limit,
            offset,
            reply,
        })
        .await
    }

    pub async fn invoke(&self, model: &str, call: MethodCall) -> SyncResult<PendingTx> {
        let model = model.to_string();
        self.request(|reply| Command::Invoke { model, call, reply })
            .await
    }

    /// Latest published cache snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.cache.borrow().clone()
    }

    /// Receiver notified with the full snapshot whenever the cache changes.
    pub fn subscribe_cache(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.cache.clone()
    }

    /// Receiver notified when the signing identity is first seen or changes.
    pub fn subscribe_identity(&self) -> watch::Receiver<Option<Address>> {
        self.identity.clone()
    }
}
