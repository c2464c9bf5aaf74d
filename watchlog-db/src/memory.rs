//! An in-process [`StoreClient`] for tests and offline development.
//!
//! Rows are plain JSON objects. Unique constraints, delete cascades, stored
//! procedures and change subscriptions are emulated closely enough for the
//! app's queries, and individual operations can be made to fail on demand.

use crate::{
    query::{Direction, Filter, Row, Select, compare_values, tables},
    store::{ChangeEvent, ChangeKind, ChangeReceiver, Result, StoreClient, StoreError},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
};
use time::{OffsetDateTime, macros::format_description};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Procedure,
    Subscribe,
}

pub type Procedure = Arc<dyn Fn(&Tables, &Row) -> Result<Vec<Row>> + Send + Sync>;

/// Read-only view of every table, handed to registered procedures.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Tables(HashMap<String, Vec<Row>>);

impl Tables {
    #[must_use]
    pub fn rows(&self, table: &str) -> &[Row] {
        self.0.get(table).map_or(&[], Vec::as_slice)
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
struct Cascade {
    parent_table: String,
    child_table: String,
    child_column: String,
}

struct Subscriber {
    table: String,
    filter: Filter,
    sender: UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct MemoryState {
    tables: Tables,
    last_id: i64,
    unique: Vec<(String, Vec<String>)>,
    cascades: Vec<Cascade>,
    procedures: HashMap<String, Procedure>,
    failures: HashSet<(Operation, String)>,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the app's tables, the one-like-per-user and one-edge-per-pair
    /// constraints, and the cascades the schema migration declares.
    #[must_use]
    pub fn with_app_schema() -> Self {
        Self::new()
            .with_table(tables::PROFILES)
            .with_table(tables::MEDIA_ENTRIES)
            .with_table(tables::POSTS)
            .with_table(tables::POST_LIKES)
            .with_table(tables::COMMENTS)
            .with_table(tables::FOLLOWS)
            .with_unique(tables::POST_LIKES, &["post_id", "user_id"])
            .with_unique(tables::FOLLOWS, &["follower_id", "following_id"])
            .with_cascade(tables::POSTS, tables::POST_LIKES, "post_id")
            .with_cascade(tables::POSTS, tables::COMMENTS, "post_id")
            .with_cascade(tables::COMMENTS, tables::COMMENTS, "parent_comment_id")
    }

    #[must_use]
    pub fn with_table(self, table: &str) -> Self {
        self.state
            .lock()
            .tables
            .0
            .entry(table.to_owned())
            .or_default();
        self
    }

    #[must_use]
    pub fn with_unique(self, table: &str, columns: &[&str]) -> Self {
        self.state.lock().unique.push((
            table.to_owned(),
            columns.iter().map(|&column| column.to_owned()).collect(),
        ));
        self
    }

    /// Deleting a row of `parent_table` also deletes rows of `child_table` whose
    /// `child_column` holds its id.
    #[must_use]
    pub fn with_cascade(self, parent_table: &str, child_table: &str, child_column: &str) -> Self {
        self.state.lock().cascades.push(Cascade {
            parent_table: parent_table.to_owned(),
            child_table: child_table.to_owned(),
            child_column: child_column.to_owned(),
        });
        self
    }

    pub fn register_procedure(
        &self,
        name: &str,
        procedure: impl Fn(&Tables, &Row) -> Result<Vec<Row>> + Send + Sync + 'static,
    ) {
        self.state
            .lock()
            .procedures
            .insert(name.to_owned(), Arc::new(procedure));
    }

    /// Makes `operation` on `target` (a table, or a procedure name) fail until [`Self::recover`].
    pub fn fail(&self, operation: Operation, target: &str) {
        self.state
            .lock()
            .failures
            .insert((operation, target.to_owned()));
    }

    pub fn recover(&self, operation: Operation, target: &str) {
        self.state
            .lock()
            .failures
            .remove(&(operation, target.to_owned()));
    }

    /// Inserts a row directly, bypassing injected failures.
    pub fn seed(&self, table: &str, row: Value) -> Result<Row> {
        let Value::Object(row) = row else {
            return Err(StoreError::Decode(<serde_json::Error as serde::de::Error>::custom(
                "seeded rows must be JSON objects",
            )));
        };

        self.state.lock().insert(table, row)
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().tables.rows(table).to_vec()
    }

    /// Ends the change streams on `table` that filter on `column`, as if their
    /// listener had gone away.
    pub fn disconnect(&self, table: &str, column: &str) {
        let ends = |subscriber: &Subscriber| {
            subscriber.table == table && subscriber.filter.column() == column
        };
        self.state
            .lock()
            .subscribers
            .retain(|subscriber| !ends(subscriber));
    }
}

impl MemoryState {
    fn check(&self, operation: Operation, target: &str) -> Result<()> {
        if self.failures.contains(&(operation, target.to_owned())) {
            debug!(?operation, target, "Injected store failure");
            return Err(StoreError::Unavailable(format!(
                "{operation:?} on {target} is failing"
            )));
        }

        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut Vec<Row>> {
        self.tables
            .0
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))
    }

    fn insert(&mut self, table: &str, mut row: Row) -> Result<Row> {
        if !self.tables.0.contains_key(table) {
            return Err(StoreError::UnknownTable(table.to_owned()));
        }

        match row.get("id").and_then(Value::as_i64) {
            Some(id) => self.last_id = self.last_id.max(id),
            None => {
                self.last_id += 1;
                row.insert("id".to_owned(), self.last_id.into());
            }
        }
        if !row.contains_key("created_at") {
            // Fixed-width so that string ordering matches time ordering.
            let now = OffsetDateTime::now_utc().format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
            ))?;
            row.insert("created_at".to_owned(), now.into());
        }

        let conflicts = {
            let existing = self.tables.rows(table);
            self.unique
                .iter()
                .filter(|(unique_table, _)| unique_table == table)
                .any(|(_, columns)| {
                    existing.iter().any(|other| {
                        columns
                            .iter()
                            .all(|column| other.get(column) == row.get(column))
                    })
                })
        };
        if conflicts {
            return Err(StoreError::Conflict {
                table: table.to_owned(),
            });
        }

        self.table_mut(table)?.push(row.clone());
        self.notify(table, ChangeKind::Insert, &row);

        Ok(row)
    }

    fn delete(&mut self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        let rows = self.table_mut(table)?;
        let (deleted, kept): (Vec<Row>, Vec<Row>) = std::mem::take(rows)
            .into_iter()
            .partition(|row| filters.iter().all(|filter| filter.matches(row)));
        *rows = kept;

        let mut pending: Vec<(String, Row)> = deleted
            .iter()
            .map(|row| (table.to_owned(), row.clone()))
            .collect();
        while let Some((parent_table, parent)) = pending.pop() {
            self.notify(&parent_table, ChangeKind::Delete, &parent);

            let Some(parent_id) = parent.get("id").cloned() else {
                continue;
            };
            let cascades: Vec<Cascade> = self
                .cascades
                .iter()
                .filter(|cascade| cascade.parent_table == parent_table)
                .cloned()
                .collect();
            for cascade in cascades {
                let child_filter = Filter::eq(cascade.child_column, parent_id.clone());
                let children = self.table_mut(&cascade.child_table)?;
                let (removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(children)
                    .into_iter()
                    .partition(|row| child_filter.matches(row));
                *children = kept;
                pending.extend(
                    removed
                        .into_iter()
                        .map(|row| (cascade.child_table.clone(), row)),
                );
            }
        }

        Ok(deleted)
    }

    fn notify(&mut self, table: &str, kind: ChangeKind, record: &Row) {
        self.subscribers
            .retain(|subscriber| !subscriber.sender.is_closed());

        for subscriber in &self.subscribers {
            if subscriber.table == table && subscriber.filter.matches(record) {
                // A receiver dropped since the retain above is harmless.
                let _ = subscriber.sender.send(ChangeEvent {
                    table: table.to_owned(),
                    kind,
                    record: record.clone(),
                });
            }
        }
    }
}

impl StoreClient for MemoryStore {
    async fn select(&self, query: &Select) -> Result<Vec<Row>> {
        let state = self.state.lock();
        state.check(Operation::Select, &query.table)?;
        if !state.tables.0.contains_key(&query.table) {
            return Err(StoreError::UnknownTable(query.table.clone()));
        }

        let mut rows: Vec<Row> = state
            .tables
            .rows(&query.table)
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();

        if !query.order.is_empty() {
            rows.sort_by(|a, b| {
                query.order.iter().fold(Ordering::Equal, |ordering, order| {
                    ordering.then_with(|| {
                        let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                        match order.direction {
                            Direction::Ascending => ordering,
                            Direction::Descending => ordering.reverse(),
                        }
                    })
                })
            });
        }

        if let Some(range) = query.range {
            rows = rows
                .into_iter()
                .skip(range.from)
                .take(range.len())
                .collect();
        }

        Ok(rows)
    }

    async fn insert(&self, table: &str, values: Row) -> Result<Row> {
        let mut state = self.state.lock();
        state.check(Operation::Insert, table)?;
        state.insert(table, values)
    }

    async fn update(&self, table: &str, filters: &[Filter], values: Row) -> Result<Vec<Row>> {
        if filters.is_empty() {
            return Err(StoreError::UnfilteredWrite("update"));
        }
        let mut state = self.state.lock();
        state.check(Operation::Update, table)?;

        let mut updated = Vec::new();
        for row in state.table_mut(table)? {
            if filters.iter().all(|filter| filter.matches(row)) {
                row.extend(values.clone());
                updated.push(row.clone());
            }
        }
        for row in &updated {
            state.notify(table, ChangeKind::Update, row);
        }

        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        if filters.is_empty() {
            return Err(StoreError::UnfilteredWrite("delete"));
        }
        let mut state = self.state.lock();
        state.check(Operation::Delete, table)?;
        state.delete(table, filters)
    }

    async fn call_procedure(&self, name: &str, args: Row) -> Result<Vec<Row>> {
        let procedure = {
            let state = self.state.lock();
            state.check(Operation::Procedure, name)?;
            state
                .procedures
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::ProcedureUnavailable(name.to_owned()))?
        };

        let tables = self.state.lock().tables.clone();
        procedure(&tables, &args)
    }

    async fn subscribe(&self, table: &str, filter: Filter) -> Result<ChangeReceiver> {
        let mut state = self.state.lock();
        state.check(Operation::Subscribe, table)?;
        if !state.tables.0.contains_key(table) {
            return Err(StoreError::UnknownTable(table.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            table: table.to_owned(),
            filter,
            sender,
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        memory::{MemoryStore, Operation},
        query::{Direction, Filter, Range, Row, Select, tables},
        store::{ChangeKind, StoreClient, StoreError},
    };
    use serde_json::{Value, json};

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn select_orders_and_ranges() {
        let store = MemoryStore::with_app_schema();
        let posts = [
            (1, "2025-01-01T00:00:00Z"),
            (2, "2025-01-03T00:00:00Z"),
            (3, "2025-01-02T00:00:00Z"),
        ];
        for (id, created_at) in posts {
            store
                .seed(
                    tables::POSTS,
                    json!({ "id": id, "user_id": 1, "created_at": created_at }),
                )
                .unwrap();
        }

        let query = Select::from_table(tables::POSTS)
            .order_by("created_at", Direction::Descending)
            .range(Range::page(1, 5));
        let ids: Vec<Value> = store
            .select(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row["id"].clone())
            .collect();

        assert_eq!(ids, [json!(3), json!(1)]);
    }

    #[tokio::test]
    async fn later_sort_keys_break_ties() {
        let store = MemoryStore::with_app_schema();
        for id in [4, 7, 5] {
            store
                .seed(
                    tables::POSTS,
                    json!({ "id": id, "user_id": 1, "created_at": "2025-01-01T00:00:00Z" }),
                )
                .unwrap();
        }

        let page = |offset| {
            Select::from_table(tables::POSTS)
                .order_by("created_at", Direction::Descending)
                .order_by("id", Direction::Descending)
                .range(Range::page(offset, 2))
        };
        let mut ids = Vec::new();
        for offset in [0, 2] {
            ids.extend(
                store
                    .select(&page(offset))
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|row| row["id"].clone()),
            );
        }

        assert_eq!(ids, [json!(7), json!(5), json!(4)]);
    }

    #[tokio::test]
    async fn insert_assigns_ids_after_seeded_ones() {
        let store = MemoryStore::with_app_schema();
        store
            .seed(tables::COMMENTS, json!({ "id": 10, "post_id": 1 }))
            .unwrap();

        let inserted = store
            .insert(tables::COMMENTS, row(json!({ "post_id": 1 })))
            .await
            .unwrap();

        assert_eq!(inserted["id"], json!(11));
        assert!(inserted["created_at"].is_string());
    }

    #[tokio::test]
    async fn duplicate_like_conflicts() {
        let store = MemoryStore::with_app_schema();
        let like = row(json!({ "post_id": 1, "user_id": 2 }));

        store
            .insert(tables::POST_LIKES, like.clone())
            .await
            .unwrap();
        let error = store.insert(tables::POST_LIKES, like).await.unwrap_err();

        assert!(matches!(error, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn deleting_a_comment_cascades_to_replies() {
        let store = MemoryStore::with_app_schema();
        for (id, parent) in [(1, None), (2, Some(1)), (3, Some(2)), (4, None)] {
            store
                .seed(
                    tables::COMMENTS,
                    json!({ "id": id, "post_id": 1, "parent_comment_id": parent }),
                )
                .unwrap();
        }

        let deleted = store
            .delete(tables::COMMENTS, &[Filter::eq("id", 1)])
            .await
            .unwrap();

        assert_eq!(deleted.len(), 1);
        let remaining: Vec<Value> = store
            .rows(tables::COMMENTS)
            .into_iter()
            .map(|row| row["id"].clone())
            .collect();
        assert_eq!(remaining, [json!(4)]);
    }

    #[tokio::test]
    async fn injected_failures_until_recovered() {
        let store = MemoryStore::with_app_schema();
        store.fail(Operation::Select, tables::POSTS);

        let query = Select::from_table(tables::POSTS);
        assert!(matches!(
            store.select(&query).await,
            Err(StoreError::Unavailable(_))
        ));

        store.recover(Operation::Select, tables::POSTS);
        assert!(store.select(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_procedure_is_reported() {
        let store = MemoryStore::with_app_schema();

        let error = store
            .call_procedure("get_feed", Row::new())
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::ProcedureUnavailable(name) if name == "get_feed"));

        store.register_procedure(
            "get_feed",
            |tables, _| Ok(tables.rows(tables::POSTS).to_vec()),
        );
        assert!(
            store
                .call_procedure("get_feed", Row::new())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn subscribers_only_see_matching_rows() {
        let store = MemoryStore::with_app_schema();
        let mut changes = store
            .subscribe(tables::FOLLOWS, Filter::eq("following_id", 5))
            .await
            .unwrap();

        store
            .insert(
                tables::FOLLOWS,
                row(json!({ "follower_id": 1, "following_id": 4 })),
            )
            .await
            .unwrap();
        store
            .insert(
                tables::FOLLOWS,
                row(json!({ "follower_id": 1, "following_id": 5 })),
            )
            .await
            .unwrap();

        let event = changes.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.record["following_id"], json!(5));
        assert!(changes.try_recv().is_err());
    }
}
