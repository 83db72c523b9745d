//! In-memory backend for tests.
//!
//! `MockBackend` implements all three backend seams over a set of in-memory
//! tables. Writes enforce the fleet foreign keys and publish change events to
//! open feed channels, so cache and realtime code can be exercised end to
//! end without a network.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use fleetsync_core::{
    BackendError, ChangeEvent, ChangeFeed, FeedMessage, FeedSubscription, Fetcher, Record,
    RowKey, RowWriter, SelectQuery, SubscriptionError, SyncError, SyncResult, TableName,
};
use serde_json::Value;

/// Buffer of each mock feed channel.
pub const CHANNEL_CAPACITY: usize = 256;

/// A referential constraint enforced on insert and update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: TableName,
    pub column: String,
    pub references: TableName,
    pub constraint: String,
}

impl ForeignKey {
    /// `{table}.{column}` must match an `id` in `references`. The constraint
    /// is named the way Postgres names it by default.
    pub fn new(table: TableName, column: impl Into<String>, references: TableName) -> Self {
        let column = column.into();
        let constraint = format!("{}_{}_fkey", table.relation(), column);
        Self {
            table,
            column,
            references,
            constraint,
        }
    }
}

#[derive(Debug)]
struct Channel {
    table: TableName,
    sender: mpsc::Sender<FeedMessage>,
}

#[derive(Debug, Default)]
struct MockState {
    tables: HashMap<TableName, Vec<Record>>,
    foreign_keys: Vec<ForeignKey>,
    select_calls: HashMap<TableName, usize>,
    select_failures: HashMap<TableName, VecDeque<SyncError>>,
    select_latency: Option<Duration>,
    write_failures: VecDeque<SyncError>,
    subscribe_calls: HashMap<TableName, usize>,
    subscribe_failures: usize,
    channels: HashMap<String, Channel>,
    next_channel: u64,
}

/// Mock backend. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of `table`. Rows are stored as given, duplicates
    /// included.
    pub fn seed(&self, table: &TableName, rows: Vec<Record>) {
        self.lock().tables.insert(table.clone(), rows);
    }

    pub fn with_foreign_key(self, fk: ForeignKey) -> Self {
        self.lock().foreign_keys.push(fk);
        self
    }

    /// Delay every select by `latency`.
    pub fn with_select_latency(self, latency: Duration) -> Self {
        self.lock().select_latency = Some(latency);
        self
    }

    pub fn rows(&self, table: &TableName) -> Vec<Record> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Number of selects issued against `table`, including failed ones.
    pub fn select_calls(&self, table: &TableName) -> usize {
        self.lock().select_calls.get(table).copied().unwrap_or(0)
    }

    pub fn subscribe_calls(&self, table: &TableName) -> usize {
        self.lock().subscribe_calls.get(table).copied().unwrap_or(0)
    }

    /// The next select on `table` fails with `err`. Calls queue up.
    pub fn fail_next_select(&self, table: &TableName, err: impl Into<SyncError>) {
        self.lock()
            .select_failures
            .entry(table.clone())
            .or_default()
            .push_back(err.into());
    }

    /// The next write of any kind fails with `err`.
    pub fn fail_next_write(&self, err: impl Into<SyncError>) {
        self.lock().write_failures.push_back(err.into());
    }

    /// The next `count` subscribe attempts fail.
    pub fn fail_subscribes(&self, count: usize) {
        self.lock().subscribe_failures = count;
    }

    /// Open channels on `table`.
    pub fn open_channels(&self, table: &TableName) -> usize {
        self.lock()
            .channels
            .values()
            .filter(|channel| &channel.table == table && !channel.sender.is_closed())
            .count()
    }

    /// Deliver `event` to every open channel on its table. Returns how many
    /// channels received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let state = self.lock();
        deliver(&state, &event.table, FeedMessage::Change(event.clone()))
    }

    /// Send a channel-level error to every channel on `table`.
    pub fn emit_error(&self, table: &TableName, message: impl Into<String>) -> usize {
        let state = self.lock();
        deliver(&state, table, FeedMessage::Error(message.into()))
    }

    /// Close every channel on `table` from the backend side.
    pub fn drop_channels(&self, table: &TableName) -> usize {
        let mut state = self.lock();
        let before = state.channels.len();
        state.channels.retain(|_, channel| &channel.table != table);
        before - state.channels.len()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock backend state poisoned")
    }

    fn check_write(state: &mut MockState) -> SyncResult<()> {
        match state.write_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_foreign_keys(state: &MockState, table: &TableName, row: &Record) -> SyncResult<()> {
        for fk in state.foreign_keys.iter().filter(|fk| &fk.table == table) {
            let Some(value) = row.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let exists = state
                .tables
                .get(&fk.references)
                .map(|rows| rows.iter().any(|r| r.get("id") == Some(value)))
                .unwrap_or(false);
            if !exists {
                return Err(BackendError::constraint(
                    table.as_str(),
                    fk.constraint.clone(),
                    format!(
                        "insert or update on table \"{}\" violates foreign key constraint \"{}\"",
                        table, fk.constraint
                    ),
                )
                .into());
            }
        }
        Ok(())
    }
}

fn deliver(state: &MockState, table: &TableName, message: FeedMessage) -> usize {
    state
        .channels
        .values()
        .filter(|channel| &channel.table == table)
        .filter(|channel| channel.sender.try_send(message.clone()).is_ok())
        .count()
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn next_int_id(rows: &[Record]) -> i64 {
    rows.iter()
        .filter_map(|r| match r.key("id") {
            Some(RowKey::Int(id)) => Some(id),
            _ => None,
        })
        .max()
        .unwrap_or(0)
        + 1
}

#[async_trait]
impl Fetcher for MockBackend {
    async fn select(&self, query: &SelectQuery) -> SyncResult<Vec<Record>> {
        let latency = {
            let mut state = self.lock();
            *state.select_calls.entry(query.table.clone()).or_default() += 1;
            state.select_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(err) = state
            .select_failures
            .get_mut(&query.table)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let mut rows: Vec<Record> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        Ok(rows.iter().map(|r| r.project(&query.columns)).collect())
    }
}

#[async_trait]
impl RowWriter for MockBackend {
    async fn insert(&self, table: &TableName, mut row: Record) -> SyncResult<Record> {
        let mut state = self.lock();
        Self::check_write(&mut state)?;

        let existing = state.tables.get(table).map(Vec::as_slice).unwrap_or(&[]);
        match row.key("id") {
            Some(id) if existing.iter().any(|r| r.key("id").as_ref() == Some(&id)) => {
                let constraint = format!("{}_pkey", table.relation());
                return Err(BackendError::constraint(
                    table.as_str(),
                    constraint.clone(),
                    format!("duplicate key value violates unique constraint \"{constraint}\""),
                )
                .into());
            }
            Some(_) => {}
            None => row.set("id", next_int_id(existing)),
        }
        Self::check_foreign_keys(&state, table, &row)?;

        state
            .tables
            .entry(table.clone())
            .or_default()
            .push(row.clone());
        deliver(
            &state,
            table,
            FeedMessage::Change(ChangeEvent::insert(table.clone(), row.clone())),
        );
        Ok(row)
    }

    async fn update(
        &self,
        table: &TableName,
        id_field: &str,
        id: &RowKey,
        patch: Record,
    ) -> SyncResult<Record> {
        let mut state = self.lock();
        Self::check_write(&mut state)?;

        let Some(old) = state
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| r.key(id_field).as_ref() == Some(id)))
            .cloned()
        else {
            return Err(BackendError::invalid_response(format!(
                "no row in {table} with {id_field} = {id}"
            ))
            .into());
        };
        let mut updated = old.clone();
        updated.merge(&patch);
        Self::check_foreign_keys(&state, table, &updated)?;

        if let Some(slot) = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| r.key(id_field).as_ref() == Some(id)))
        {
            *slot = updated.clone();
        }
        deliver(
            &state,
            table,
            FeedMessage::Change(ChangeEvent::update(
                table.clone(),
                Some(old),
                updated.clone(),
            )),
        );
        Ok(updated)
    }

    async fn delete(&self, table: &TableName, id_field: &str, id: &RowKey) -> SyncResult<Record> {
        let mut state = self.lock();
        Self::check_write(&mut state)?;

        let removed = state.tables.get_mut(table).and_then(|rows| {
            let index = rows
                .iter()
                .position(|r| r.key(id_field).as_ref() == Some(id))?;
            Some(rows.remove(index))
        });
        let Some(removed) = removed else {
            return Err(BackendError::invalid_response(format!(
                "no row in {table} with {id_field} = {id}"
            ))
            .into());
        };
        deliver(
            &state,
            table,
            FeedMessage::Change(ChangeEvent::delete(table.clone(), removed.clone())),
        );
        Ok(removed)
    }
}

#[async_trait]
impl ChangeFeed for MockBackend {
    async fn subscribe(&self, table: &TableName) -> SyncResult<FeedSubscription> {
        let mut state = self.lock();
        *state.subscribe_calls.entry(table.clone()).or_default() += 1;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(SubscriptionError::ChannelFailed {
                table: table.to_string(),
                reason: "mock subscribe failure".to_string(),
            }
            .into());
        }

        state.next_channel += 1;
        let channel_id = format!("realtime:{}:{}", table, state.next_channel);
        let (sender, events) = mpsc::channel(CHANNEL_CAPACITY);
        state.channels.insert(
            channel_id.clone(),
            Channel {
                table: table.clone(),
                sender,
            },
        );
        Ok(FeedSubscription { channel_id, events })
    }

    async fn unsubscribe(&self, channel_id: &str) -> SyncResult<()> {
        self.lock().channels.remove(channel_id);
        Ok(())
    }
}
