//! [`StoreClient`] backed by PostgreSQL.
//!
//! Queries are assembled with [`QueryBuilder`]; every row is projected through
//! `to_jsonb` so callers see the same JSON objects the hosted API returns.
//! Change events arrive via `LISTEN` on [`CHANGE_CHANNEL`], fed by the trigger in
//! `migrations/0001_init.sql`.

use crate::{
    query::{Direction, Filter, Row, Select},
    store::{ChangeEvent, ChangeReceiver, Result, StoreClient, StoreError},
};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, postgres::PgListener, types::Json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const CHANGE_CHANNEL: &str = "watchlog_changes";

const UNDEFINED_FUNCTION: &str = "42883";
const UNDEFINED_TABLE: &str = "42P01";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Quotes a table, column or procedure name. Only lowercase snake case is accepted.
fn identifier(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(StoreError::InvalidIdentifier(name.to_owned()))
    }
}

fn column_list<'a>(columns: impl IntoIterator<Item = &'a String>) -> Result<String> {
    Ok(columns
        .into_iter()
        .map(|column| identifier(column))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::Null => builder.push("NULL"),
        Value::Bool(value) => builder.push_bind(*value),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => builder.push_bind(integer),
            None => builder.push_bind(number.as_f64()),
        },
        Value::String(text) => builder.push_bind(text.clone()),
        Value::Array(_) | Value::Object(_) => builder.push_bind(Json(value.clone())),
    };
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) -> Result<()> {
    for (index, filter) in filters.iter().enumerate() {
        builder.push(if index == 0 { " WHERE " } else { " AND " });
        let column = identifier(filter.column())?;

        match filter {
            Filter::Eq {
                value: Value::Null, ..
            } => {
                builder.push("t.").push(column).push(" IS NULL");
            }
            Filter::Eq { value, .. } => {
                builder.push("t.").push(column).push(" = ");
                push_value(builder, value);
            }
            Filter::In { values, .. } if values.is_empty() => {
                builder.push("FALSE");
            }
            Filter::In { values, .. } => {
                builder.push("t.").push(column).push(" IN (");
                for (position, value) in values.iter().enumerate() {
                    if position > 0 {
                        builder.push(", ");
                    }
                    push_value(builder, value);
                }
                builder.push(")");
            }
        }
    }

    Ok(())
}

/// Maps database errors the app reacts to onto their store-level meaning.
fn classify(target: &str, error: sqlx::Error) -> StoreError {
    if let Some(database_error) = error.as_database_error() {
        if database_error.is_unique_violation() {
            return StoreError::Conflict {
                table: target.to_owned(),
            };
        }
        match database_error.code().as_deref() {
            Some(UNDEFINED_FUNCTION) => return StoreError::ProcedureUnavailable(target.to_owned()),
            Some(UNDEFINED_TABLE) => return StoreError::UnknownTable(target.to_owned()),
            _ => {}
        }
    }

    StoreError::Sqlx(error)
}

fn unwrap_rows(rows: Vec<Json<Row>>) -> Vec<Row> {
    rows.into_iter().map(|Json(row)| row).collect()
}

impl StoreClient for PgStore {
    async fn select(&self, query: &Select) -> Result<Vec<Row>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT to_jsonb(t) FROM ");
        builder.push(identifier(&query.table)?).push(" AS t");
        push_filters(&mut builder, &query.filters)?;

        for (position, order) in query.order.iter().enumerate() {
            builder
                .push(if position == 0 { " ORDER BY " } else { ", " })
                .push("t.")
                .push(identifier(&order.column)?)
                .push(match order.direction {
                    Direction::Ascending => " ASC",
                    Direction::Descending => " DESC",
                });
        }
        if let Some(range) = query.range {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(range.len()).unwrap_or(i64::MAX))
                .push(" OFFSET ")
                .push_bind(i64::try_from(range.from).unwrap_or(i64::MAX));
        }

        let rows = builder
            .build_query_scalar::<Json<Row>>()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| classify(&query.table, error))?;

        Ok(unwrap_rows(rows))
    }

    async fn insert(&self, table: &str, values: Row) -> Result<Row> {
        let table_name = identifier(table)?;
        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO ");
        builder.push(&table_name).push(" AS t");

        if values.is_empty() {
            builder.push(" DEFAULT VALUES");
        } else {
            let columns = column_list(values.keys())?;
            builder
                .push(" (")
                .push(&columns)
                .push(") SELECT ")
                .push(&columns)
                .push(" FROM jsonb_populate_record(NULL::")
                .push(&table_name)
                .push(", ")
                .push_bind(Json(values))
                .push(")");
        }
        builder.push(" RETURNING to_jsonb(t)");

        let Json(row) = builder
            .build_query_scalar::<Json<Row>>()
            .fetch_one(&self.pool)
            .await
            .map_err(|error| classify(table, error))?;

        Ok(row)
    }

    async fn update(&self, table: &str, filters: &[Filter], values: Row) -> Result<Vec<Row>> {
        if filters.is_empty() {
            return Err(StoreError::UnfilteredWrite("update"));
        }
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let table_name = identifier(table)?;
        let columns = column_list(values.keys())?;
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE ");
        builder
            .push(&table_name)
            .push(" AS t SET (")
            .push(&columns)
            .push(") = (SELECT ")
            .push(&columns)
            .push(" FROM jsonb_populate_record(NULL::")
            .push(&table_name)
            .push(", ")
            .push_bind(Json(values))
            .push("))");
        push_filters(&mut builder, filters)?;
        builder.push(" RETURNING to_jsonb(t)");

        let rows = builder
            .build_query_scalar::<Json<Row>>()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| classify(table, error))?;

        Ok(unwrap_rows(rows))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        if filters.is_empty() {
            return Err(StoreError::UnfilteredWrite("delete"));
        }

        let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM ");
        builder.push(identifier(table)?).push(" AS t");
        push_filters(&mut builder, filters)?;
        builder.push(" RETURNING to_jsonb(t)");

        let rows = builder
            .build_query_scalar::<Json<Row>>()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| classify(table, error))?;

        Ok(unwrap_rows(rows))
    }

    async fn call_procedure(&self, name: &str, args: Row) -> Result<Vec<Row>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT to_jsonb(r) FROM ");
        builder.push(identifier(name)?).push("(");
        for (position, (argument, value)) in args.iter().enumerate() {
            if position > 0 {
                builder.push(", ");
            }
            builder.push(identifier(argument)?).push(" => ");
            push_value(&mut builder, value);
        }
        builder.push(") AS r");

        let rows = builder
            .build_query_scalar::<Json<Row>>()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| classify(name, error))?;

        Ok(unwrap_rows(rows))
    }

    async fn subscribe(&self, table: &str, filter: Filter) -> Result<ChangeReceiver> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let table = table.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sender.closed() => break,
                    notification = listener.recv() => {
                        let notification = match notification {
                            Ok(notification) => notification,
                            Err(error) => {
                                warn!(%error, %table, "Change listener failed");
                                break;
                            }
                        };
                        match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                            Ok(event) if event.table == table && filter.matches(&event.record) => {
                                if sender.send(event).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(error) => warn!(%error, "Undecodable change notification"),
                        }
                    }
                }
            }
            debug!(%table, "Change subscription ended");
        });

        Ok(receiver)
    }
}
