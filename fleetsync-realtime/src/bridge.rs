//! Bridge from backend change channels to cache refreshes.
//!
//! One channel per table, shared by every consumer through ref-counted
//! [`RealtimeGuard`]s. Each table runs a listener task:
//!
//! ```text
//! Connecting -> Live -> (event) arm debounce timers -> Live
//!                 |
//!            channel lost -> Reconnecting { attempt } -> ... -> Degraded
//! ```
//!
//! Events never refresh directly. They (re)arm the store's per-key debounce
//! timer for every key affected by the table, so a burst of changes becomes
//! one refresh once the feed has been quiet for `debounce_ms`.
//!
//! A channel that closes or reports an error counts as a failure. Failures
//! and backoff reset once a channel delivers a change, not merely on a
//! successful subscribe, since servers may reject a channel after accepting
//! the subscribe request.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetsync_cache::ResourceStore;
use fleetsync_core::{
    ChangeFeed, FeedMessage, FeedSubscription, SubscriptionError, SyncConfig, SyncResult,
    TableName,
};

use crate::backoff::Backoff;
use crate::status::RealtimeStatus;

struct TableSubscription {
    refcount: usize,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<RealtimeStatus>,
    task: JoinHandle<()>,
}

struct BridgeInner {
    store: ResourceStore,
    feed: Arc<dyn ChangeFeed>,
    config: SyncConfig,
    subscriptions: DashMap<TableName, TableSubscription>,
    closed: AtomicBool,
}

enum PumpEnd {
    Shutdown,
    Dropped,
    Failed(String),
}

/// Shares backend change channels between consumers.
///
/// Cloning is cheap; clones share subscriptions.
#[derive(Clone)]
pub struct RealtimeBridge {
    inner: Arc<BridgeInner>,
}

impl RealtimeBridge {
    pub fn new(store: ResourceStore, feed: Arc<dyn ChangeFeed>) -> Self {
        let config = store.config().clone();
        Self {
            inner: Arc::new(BridgeInner {
                store,
                feed,
                config,
                subscriptions: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Follow changes on `table`. The first guard for a table opens its
    /// channel; dropping the last one closes it.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(&self, table: &TableName) -> SyncResult<RealtimeGuard> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SubscriptionError::ChannelFailed {
                table: table.to_string(),
                reason: "realtime bridge is shut down".to_string(),
            }
            .into());
        }

        let status = match self.inner.subscriptions.entry(table.clone()) {
            Entry::Occupied(mut existing) => {
                let subscription = existing.get_mut();
                subscription.refcount += 1;
                subscription.status.clone()
            }
            Entry::Vacant(slot) => {
                let (shutdown, shutdown_rx) = watch::channel(false);
                let (status_tx, status) = watch::channel(RealtimeStatus::Connecting);
                let inner = self.inner.clone();
                let task_table = table.clone();
                let task = tokio::spawn(async move {
                    inner.listen(task_table, shutdown_rx, status_tx).await;
                });
                slot.insert(TableSubscription {
                    refcount: 1,
                    shutdown,
                    status: status.clone(),
                    task,
                });
                status
            }
        };

        Ok(RealtimeGuard {
            bridge: self.clone(),
            table: table.clone(),
            status,
        })
    }

    /// Number of consumers holding a guard for `table`.
    pub fn subscriber_count(&self, table: &TableName) -> usize {
        self.inner
            .subscriptions
            .get(table)
            .map(|s| s.refcount)
            .unwrap_or(0)
    }

    pub fn status(&self, table: &TableName) -> Option<RealtimeStatus> {
        self.inner
            .subscriptions
            .get(table)
            .map(|s| *s.status.borrow())
    }

    /// Tables with an active subscription.
    pub fn tables(&self) -> Vec<TableName> {
        let mut tables: Vec<TableName> = self
            .inner
            .subscriptions
            .iter()
            .map(|s| s.key().clone())
            .collect();
        tables.sort();
        tables
    }

    /// Close every channel and wait for the listeners to exit.
    ///
    /// Guards outliving the bridge become inert.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let tables = self.tables();
        let mut tasks = Vec::with_capacity(tables.len());
        for table in tables {
            if let Some((_, subscription)) = self.inner.subscriptions.remove(&table) {
                let _ = subscription.shutdown.send(true);
                self.inner.cancel_timers(&table);
                tasks.push(subscription.task);
            }
        }
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Realtime listener ended abnormally");
            }
        }
        info!("Realtime bridge shut down");
    }

    fn release(&self, table: &TableName) {
        let Entry::Occupied(mut existing) = self.inner.subscriptions.entry(table.clone()) else {
            return;
        };
        existing.get_mut().refcount -= 1;
        if existing.get().refcount > 0 {
            return;
        }
        let subscription = existing.remove();
        let _ = subscription.shutdown.send(true);
        self.inner.cancel_timers(table);
        debug!(table = %table, "Last realtime guard released");
    }
}

impl BridgeInner {
    async fn listen(
        self: Arc<Self>,
        table: TableName,
        mut shutdown: watch::Receiver<bool>,
        status: watch::Sender<RealtimeStatus>,
    ) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let mut failures: u32 = 0;
        let mut has_connected = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.feed.subscribe(&table) => result,
            };

            match subscribed {
                Ok(mut subscription) => {
                    info!(
                        table = %table,
                        channel = %subscription.channel_id,
                        "Subscribed to change feed"
                    );
                    status.send_replace(RealtimeStatus::Live);
                    if has_connected {
                        debug!(table = %table, "Resubscribed, catching up on missed changes");
                        self.arm(&table);
                    }
                    has_connected = true;

                    let end = self
                        .pump(&table, &mut subscription, &mut shutdown, &mut failures, &mut backoff)
                        .await;
                    if let Err(err) = self.feed.unsubscribe(&subscription.channel_id).await {
                        debug!(table = %table, error = %err, "Unsubscribe failed");
                    }
                    match end {
                        PumpEnd::Shutdown => break,
                        PumpEnd::Dropped => {
                            failures += 1;
                            warn!(
                                table = %table,
                                attempt = failures,
                                "Change channel dropped, reconnecting"
                            );
                        }
                        PumpEnd::Failed(reason) => {
                            failures += 1;
                            let failed = SubscriptionError::ChannelFailed {
                                table: table.to_string(),
                                reason,
                            };
                            warn!(
                                table = %table,
                                error = %failed,
                                attempt = failures,
                                "Change channel failed, reconnecting"
                            );
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        table = %table,
                        error = %err,
                        attempt = failures,
                        "Failed to subscribe to change feed"
                    );
                }
            }

            if failures >= self.config.degraded_after_failures {
                if !status.borrow().is_degraded() {
                    let degraded = SubscriptionError::Degraded {
                        table: table.to_string(),
                        attempts: failures,
                    };
                    warn!(table = %table, error = %degraded, "Realtime degraded, consumers will poll");
                }
                status.send_replace(RealtimeStatus::Degraded);
            } else {
                status.send_replace(RealtimeStatus::Reconnecting { attempt: failures });
            }

            let delay = backoff.next_delay();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        status.send_replace(RealtimeStatus::Closed);
        info!(table = %table, "Unsubscribed from change feed");
    }

    async fn pump(
        &self,
        table: &TableName,
        subscription: &mut FeedSubscription,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
        backoff: &mut Backoff,
    ) -> PumpEnd {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.changed() => return PumpEnd::Shutdown,
                message = subscription.events.recv() => message,
            };
            match message {
                Some(FeedMessage::Change(event)) => {
                    debug!(table = %table, kind = ?event.kind, "Change received");
                    if *failures > 0 {
                        debug!(table = %table, "Change channel healthy again");
                        *failures = 0;
                    }
                    backoff.reset();
                    self.arm(table);
                }
                Some(FeedMessage::Error(message)) => return PumpEnd::Failed(message),
                None => return PumpEnd::Dropped,
            }
        }
    }

    /// (Re)arm the debounce timer of every key affected by `table`.
    fn arm(&self, table: &TableName) {
        let debounce = self.config.debounce();
        for key in self.store.affected_keys(table) {
            if let Err(err) = self.store.schedule_refresh_for(&key, debounce, table) {
                debug!(key = %key, error = %err, "Could not schedule refresh");
            }
        }
    }

    /// Withdraw `table` from every timer it armed, including dependents.
    fn cancel_timers(&self, table: &TableName) {
        self.store.cancel_scheduled_for(table);
    }
}

impl std::fmt::Debug for RealtimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeBridge")
            .field("tables", &self.tables())
            .finish()
    }
}

/// Keeps a table's change channel open while alive.
pub struct RealtimeGuard {
    bridge: RealtimeBridge,
    table: TableName,
    status: watch::Receiver<RealtimeStatus>,
}

impl RealtimeGuard {
    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn status(&self) -> RealtimeStatus {
        *self.status.borrow()
    }

    /// Observe status changes.
    pub fn status_watch(&self) -> watch::Receiver<RealtimeStatus> {
        self.status.clone()
    }
}

impl Drop for RealtimeGuard {
    fn drop(&mut self) {
        self.bridge.release(&self.table);
    }
}

impl std::fmt::Debug for RealtimeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeGuard")
            .field("table", &self.table)
            .field("status", &self.status())
            .finish()
    }
}
