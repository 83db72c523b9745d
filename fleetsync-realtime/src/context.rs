//! Consumer-facing API.
//!
//! The application root owns one [`SyncContext`]. Views ask it for a
//! [`ResourceHandle`] per resource key; the handle reads through the cache,
//! follows the change feed (or polls), and detaches everything on drop.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use fleetsync_cache::{
    Checkpoint, OptimisticUpdate, OptimisticWriter, ResourceSnapshot, ResourceStore, Rows,
    WriteOp,
};
use fleetsync_core::{
    CacheError, ChangeFeed, Fetcher, Record, ResourceKey, RowWriter, SelectQuery, SyncConfig,
    SyncError, SyncResult,
};

use crate::bridge::{RealtimeBridge, RealtimeGuard};
use crate::status::{RealtimeMode, RealtimeStatus};

/// Owns the store, the realtime bridge, and the write path.
#[derive(Debug, Clone)]
pub struct SyncContext {
    store: ResourceStore,
    bridge: RealtimeBridge,
    writer: OptimisticWriter,
}

impl SyncContext {
    /// Build a context from the three backend seams.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        writer: Arc<dyn RowWriter>,
        feed: Arc<dyn ChangeFeed>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        let store = ResourceStore::new(fetcher, config);
        let bridge = RealtimeBridge::new(store.clone(), feed);
        let writer = OptimisticWriter::new(store.clone(), writer);
        Ok(Self {
            store,
            bridge,
            writer,
        })
    }

    /// Build a context over one backend implementing every seam.
    pub fn with_backend<B>(backend: B, config: SyncConfig) -> SyncResult<Self>
    where
        B: Fetcher + RowWriter + ChangeFeed + 'static,
    {
        let backend = Arc::new(backend);
        Self::new(backend.clone(), backend.clone(), backend, config)
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn bridge(&self) -> &RealtimeBridge {
        &self.bridge
    }

    pub fn config(&self) -> &SyncConfig {
        self.store.config()
    }

    pub fn register(&self, key: ResourceKey, query: SelectQuery) -> SyncResult<()> {
        self.store.register(key, query)
    }

    /// Open a handle on a registered key.
    ///
    /// Starts a fetch if nothing is cached. Must be called within a tokio
    /// runtime.
    pub fn resource(&self, key: &ResourceKey, mode: RealtimeMode) -> SyncResult<ResourceHandle> {
        let query = self.store.query(key)?;
        let receiver = self.store.watch(key)?;
        let realtime = match mode {
            RealtimeMode::Enabled => Some(self.bridge.subscribe(&query.table)?),
            RealtimeMode::Disabled => None,
        };
        let poller = Poller::spawn(
            self.store.clone(),
            key.clone(),
            realtime.as_ref().map(RealtimeGuard::status_watch),
        );
        self.store.get(key)?;
        debug!(key = %key, ?mode, "Opened resource handle");

        Ok(ResourceHandle {
            key: key.clone(),
            store: self.store.clone(),
            writer: self.writer.clone(),
            receiver,
            realtime,
            _poller: poller,
        })
    }

    /// Close every realtime channel and cancel pending refreshes.
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
    }
}

/// Refreshes a key at the revalidate interval while realtime is not
/// delivering. Stops when dropped.
struct Poller {
    handle: AbortHandle,
}

impl Poller {
    fn spawn(
        store: ResourceStore,
        key: ResourceKey,
        status: Option<watch::Receiver<RealtimeStatus>>,
    ) -> Self {
        let period = store.config().revalidate_interval();
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let should_poll = status
                    .as_ref()
                    .map(|s| s.borrow().is_degraded())
                    .unwrap_or(true);
                if !should_poll {
                    continue;
                }
                match store.refresh(&key).await {
                    Ok(_) => {}
                    Err(SyncError::Cache(CacheError::UnknownResource { .. })) => break,
                    Err(err) => warn!(key = %key, error = %err, "Poll refresh failed"),
                }
            }
        });
        Self {
            handle: task.abort_handle(),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A consumer's view of one resource key.
pub struct ResourceHandle {
    key: ResourceKey,
    store: ResourceStore,
    writer: OptimisticWriter,
    receiver: watch::Receiver<ResourceSnapshot>,
    realtime: Option<RealtimeGuard>,
    _poller: Poller,
}

impl ResourceHandle {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Current state; revalidates in the background when stale.
    pub fn snapshot(&self) -> SyncResult<ResourceSnapshot> {
        self.store.get(&self.key)
    }

    /// Last published rows.
    pub fn data(&self) -> Option<Rows> {
        self.receiver.borrow().data.clone()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.receiver.borrow().error.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.store
            .snapshot(&self.key)
            .map(|s| s.is_stale)
            .unwrap_or(true)
    }

    /// Wait for the next published change.
    pub async fn changed(&mut self) -> SyncResult<ResourceSnapshot> {
        self.receiver
            .changed()
            .await
            .map_err(|_| CacheError::UnknownResource {
                key: self.key.to_string(),
            })?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    pub async fn refresh(&self) -> SyncResult<Rows> {
        self.store.refresh(&self.key).await
    }

    pub fn optimistic_update(&self, update: OptimisticUpdate) -> SyncResult<Checkpoint> {
        self.store.optimistic_update(&self.key, update)
    }

    /// Optimistic write; see [`OptimisticWriter::write`].
    pub async fn write(&self, op: WriteOp) -> SyncResult<Record> {
        self.writer.write(&self.key, op).await
    }

    /// `None` when the handle was opened without realtime.
    pub fn realtime_status(&self) -> Option<RealtimeStatus> {
        self.realtime.as_ref().map(RealtimeGuard::status)
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key)
            .field("realtime", &self.realtime_status())
            .finish()
    }
}
