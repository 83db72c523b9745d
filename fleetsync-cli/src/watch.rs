//! Resource watchers: one task per configured resource, each turning
//! published snapshots into JSON lines.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use fleetsync_backend::{RestBackend, WsChangeFeed};
use fleetsync_cache::ResourceSnapshot;
use fleetsync_realtime::{RealtimeStatus, ResourceHandle, SyncContext};

use crate::config::{CliConfig, ResourceConfig};
use crate::error::CliError;

const LINE_BUFFER: usize = 64;

/// Context over the REST and WebSocket adapters with every configured
/// resource registered.
pub fn build_context(config: &CliConfig) -> Result<SyncContext, CliError> {
    let rest = Arc::new(RestBackend::new(&config.backend)?);
    let feed = Arc::new(WsChangeFeed::new(&config.backend)?);
    let ctx = SyncContext::new(rest.clone(), rest, feed, config.sync.clone())?;
    register_all(&ctx, &config.resources)?;
    info!(
        url = %config.backend.url,
        resources = config.resources.len(),
        "Sync context ready"
    );
    Ok(ctx)
}

pub fn register_all(ctx: &SyncContext, resources: &[ResourceConfig]) -> Result<(), CliError> {
    for resource in resources {
        ctx.register(resource.key.clone(), resource.query.clone())?;
    }
    Ok(())
}

/// One output line for a snapshot.
pub fn render_snapshot(snapshot: &ResourceSnapshot, realtime: Option<RealtimeStatus>) -> Value {
    json!({
        "key": snapshot.key,
        "rows": snapshot.rows(),
        "updated_at": snapshot.updated_at,
        "stale": snapshot.is_stale,
        "validating": snapshot.is_validating,
        "optimistic": snapshot.is_optimistic(),
        "error": snapshot.error.as_ref().map(|e| e.to_string()),
        "realtime": realtime,
    })
}

/// Running watchers and the lines they produce.
pub struct Watchers {
    lines: mpsc::Receiver<Value>,
    tasks: JoinSet<()>,
}

impl Watchers {
    /// Open a handle per resource and start forwarding its changes.
    pub fn spawn(ctx: &SyncContext, resources: &[ResourceConfig]) -> Result<Self, CliError> {
        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        let mut tasks = JoinSet::new();
        for resource in resources {
            let handle = ctx.resource(&resource.key, resource.realtime)?;
            tasks.spawn(forward(handle, tx.clone()));
        }
        Ok(Self { lines, tasks })
    }

    /// Next rendered snapshot; `None` once every watcher has stopped.
    pub async fn next_line(&mut self) -> Option<Value> {
        self.lines.recv().await
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every watcher, dropping their handles.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}

async fn forward(mut handle: ResourceHandle, lines: mpsc::Sender<Value>) {
    loop {
        let snapshot = match handle.changed().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(key = %handle.key(), error = %err, "Watcher stopped");
                break;
            }
        };
        let line = render_snapshot(&snapshot, handle.realtime_status());
        if lines.send(line).await.is_err() {
            break;
        }
    }
}
