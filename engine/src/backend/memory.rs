use super::{
    matches_filter, Backend, BackendError, BackendErrorKind, BackendResult, ChangePage,
    ChangeStream, FeedEvent, FeedEventKind, SnapshotQuery, SortOrder, SyncCursor,
};
use crate::{Record, RecordId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All rows of an in-memory backend, by table then id.
pub type Tables = BTreeMap<String, BTreeMap<RecordId, Record>>;

/// A remote procedure. Runs against a private copy of the tables, which is
/// committed only if it returns `Ok`.
pub type Procedure = Arc<dyn Fn(&mut Tables, Value) -> BackendResult<Value> + Send + Sync>;

/// Backend capability, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Query,
    Subscribe,
    Upsert,
    Call,
}

#[derive(Debug, Clone)]
enum FeedMessage {
    Event(FeedEvent),
    Disconnect,
}

#[derive(Default)]
struct State {
    tables: Tables,
    online: bool,
    failures: HashMap<BackendOp, VecDeque<BackendErrorKind>>,
    unique: Vec<(String, String)>,
    upserts: usize,
    /// Change position of each row's latest write, by table then id
    positions: BTreeMap<String, HashMap<RecordId, i64>>,
    change_seq: i64,
}

impl State {
    fn record_change(&mut self, table: &str, id: &RecordId) {
        self.change_seq += 1;
        let seq = self.change_seq;
        self.positions
            .entry(table.to_string())
            .or_default()
            .insert(id.clone(), seq);
    }
}

/// In-process backend with last-write-wins upserts and a broadcast change
/// feed. Connectivity and individual failures can be scripted.
pub struct MemoryBackend {
    state: Mutex<State>,
    procedures: RwLock<HashMap<String, Procedure>>,
    feed: broadcast::Sender<FeedMessage>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State {
                online: true,
                ..State::default()
            }),
            procedures: RwLock::new(HashMap::new()),
            feed,
        }
    }

    /// Go offline or back online. Going offline ends every live feed.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        if state.online && !online {
            let _ = self.feed.send(FeedMessage::Disconnect);
        }
        state.online = online;
    }

    /// Fail the next call of `op` with `kind`. Calls queue up.
    pub fn inject_failure(&self, op: BackendOp, kind: BackendErrorKind) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(kind);
    }

    /// Reject upserts that would give two live rows of `table` the same
    /// `field` value.
    pub fn unique(&self, table: &str, field: &str) {
        self.state
            .lock()
            .unique
            .push((table.to_string(), field.to_string()));
    }

    pub fn register_procedure<F>(&self, name: &str, procedure: F)
    where
        F: Fn(&mut Tables, Value) -> BackendResult<Value> + Send + Sync + 'static,
    {
        self.procedures
            .write()
            .insert(name.to_string(), Arc::new(procedure));
    }

    /// Write a row as another client would, bypassing connectivity and
    /// injected failures.
    pub fn write_remote(&self, table: &str, row: Record) -> Record {
        let mut state = self.state.lock();
        self.store_row(&mut state, table, row)
    }

    /// Every row of `table`, tombstones included.
    pub fn rows(&self, table: &str) -> BTreeMap<RecordId, Record> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Record> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Number of upserts that reached the backend.
    pub fn upsert_count(&self) -> usize {
        self.state.lock().upserts
    }

    fn check(&self, state: &mut State, op: BackendOp) -> BackendResult<()> {
        if !state.online {
            return Err(BackendError::new(BackendErrorKind::Network, "backend unreachable"));
        }
        if let Some(kind) = state.failures.get_mut(&op).and_then(|f| f.pop_front()) {
            return Err(BackendError::new(kind, format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn check_unique(state: &State, table: &str, row: &Record) -> BackendResult<()> {
        for (t, field) in &state.unique {
            if t != table || row.deleted {
                continue;
            }
            let Some(value) = row.field(field) else {
                continue;
            };
            let taken = state.tables.get(table).is_some_and(|rows| {
                rows.values()
                    .any(|r| r.id != row.id && r.is_active() && r.field(field) == Some(value))
            });
            if taken {
                return Err(BackendError::new(
                    BackendErrorKind::Constraint,
                    format!("duplicate value for {table}.{field}"),
                ));
            }
        }
        Ok(())
    }

    /// Last-write-wins write. Returns the row held afterwards.
    fn store_row(&self, state: &mut State, table: &str, mut row: Record) -> Record {
        let rows = state.tables.entry(table.to_string()).or_default();
        let existing = rows.get(&row.id);

        if let Some(existing) = existing {
            if existing.updated_at > row.updated_at || existing.same_version(&row) {
                return existing.clone();
            }
            row.created_at = existing.created_at;
        }
        let kind = match (existing, row.deleted) {
            (_, true) => FeedEventKind::Delete,
            (None, false) => FeedEventKind::Insert,
            (Some(_), false) => FeedEventKind::Update,
        };
        rows.insert(row.id.clone(), row.clone());
        state.record_change(table, &row.id);
        let _ = self.feed.send(FeedMessage::Event(FeedEvent {
            table: table.to_string(),
            kind,
            row: row.clone(),
        }));
        row
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, table: &str, query: &SnapshotQuery) -> BackendResult<Vec<Record>> {
        let mut state = self.state.lock();
        self.check(&mut state, BackendOp::Query)?;

        let mut rows: Vec<Record> = state
            .tables
            .get(table)
            .map(|rows| rows.values().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(SyncCursor::of);
        if query.order == SortOrder::Desc {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn changes_since(
        &self,
        table: &str,
        filter: &Map<String, Value>,
        since: i64,
        limit: usize,
    ) -> BackendResult<ChangePage> {
        let mut state = self.state.lock();
        self.check(&mut state, BackendOp::Query)?;
        let state = &*state;

        let (Some(positions), Some(rows)) = (state.positions.get(table), state.tables.get(table))
        else {
            return Ok(ChangePage {
                rows: Vec::new(),
                cursor: since,
            });
        };
        let mut changed: Vec<(i64, &Record)> = positions
            .iter()
            .filter(|(_, seq)| **seq > since)
            .filter_map(|(id, &seq)| rows.get(id).map(|row| (seq, row)))
            .filter(|(_, row)| matches_filter(row, filter))
            .collect();
        changed.sort_by_key(|(seq, _)| *seq);
        changed.truncate(limit);

        Ok(ChangePage {
            cursor: changed.last().map_or(since, |(seq, _)| *seq),
            rows: changed.into_iter().map(|(_, row)| row.clone()).collect(),
        })
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: &Map<String, Value>,
    ) -> BackendResult<ChangeStream> {
        let rx = {
            let mut state = self.state.lock();
            self.check(&mut state, BackendOp::Subscribe)?;
            self.feed.subscribe()
        };

        let table = table.to_string();
        let filter = filter.clone();
        let stream = futures::stream::unfold(Some(rx), move |rx| {
            let table = table.clone();
            let filter = filter.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(FeedMessage::Event(event)) => {
                            if event.table == table && matches_filter(&event.row, &filter) {
                                return Some((Ok(event), Some(rx)));
                            }
                        }
                        Ok(FeedMessage::Disconnect) => {
                            let err = BackendError::new(BackendErrorKind::Network, "feed lost");
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let err = BackendError::new(
                                BackendErrorKind::Unavailable,
                                format!("feed lagged by {missed} events"),
                            );
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn upsert(&self, table: &str, row: &Record) -> BackendResult<Record> {
        let mut state = self.state.lock();
        self.check(&mut state, BackendOp::Upsert)?;
        Self::check_unique(&state, table, row)?;
        state.upserts += 1;
        Ok(self.store_row(&mut state, table, row.clone()))
    }

    async fn call(&self, procedure: &str, params: Value) -> BackendResult<Value> {
        let handler = self.procedures.read().get(procedure).cloned().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Validation,
                format!("unknown procedure: {procedure}"),
            )
        })?;

        let mut state = self.state.lock();
        self.check(&mut state, BackendOp::Call)?;

        let mut scratch = state.tables.clone();
        let result = handler(&mut scratch, params)?;

        let before = std::mem::take(&mut state.tables);
        for (table, rows) in &scratch {
            for row in rows.values() {
                let previous = before.get(table).and_then(|r| r.get(&row.id));
                if previous == Some(row) {
                    continue;
                }
                state.record_change(table, &row.id);
                let kind = match (previous, row.deleted) {
                    (_, true) => FeedEventKind::Delete,
                    (None, false) => FeedEventKind::Insert,
                    (Some(_), false) => FeedEventKind::Update,
                };
                let _ = self.feed.send(FeedMessage::Event(FeedEvent {
                    table: table.clone(),
                    kind,
                    row: row.clone(),
                }));
            }
        }
        state.tables = scratch;
        Ok(result)
    }
}
