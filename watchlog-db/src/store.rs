use crate::query::{Filter, Row, Select};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("Procedure {0} is not available")]
    ProcedureUnavailable(String),
    #[error("Write to {table} conflicts with an existing row")]
    Conflict { table: String },
    #[error("Table {0} does not exist")]
    UnknownTable(String),
    #[error("Store is unavailable: {0}")]
    Unavailable(String),
    #[error("Identifier {0:?} cannot be used in a query")]
    InvalidIdentifier(String),
    #[error("Refusing to {0} rows without a filter")]
    UnfilteredWrite(&'static str),
    #[error("Row could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Timestamp could not be formatted: {0}")]
    Timestamp(#[from] time::error::Format),
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change on a watched table. For deletes `record` is the removed row.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub record: Row,
}

pub type ChangeReceiver = UnboundedReceiver<ChangeEvent>;

/// Generic access to the relational store.
///
/// Row-level security is enforced by the store itself; implementations surface
/// rejected writes as errors and never retry.
pub trait StoreClient: Send + Sync {
    fn select(&self, query: &Select) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Inserts one row and returns it as stored, including generated columns.
    fn insert(&self, table: &str, values: Row) -> impl Future<Output = Result<Row>> + Send;

    /// Updates every row matching all `filters` and returns the updated rows.
    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        values: Row,
    ) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Deletes every row matching all `filters` and returns the deleted rows.
    fn delete(&self, table: &str, filters: &[Filter])
    -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Calls a stored procedure with named arguments.
    ///
    /// A procedure that is not installed yields [`StoreError::ProcedureUnavailable`].
    fn call_procedure(&self, name: &str, args: Row)
    -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Streams changes to rows of `table` that match `filter`.
    ///
    /// The stream ends when the store side of the subscription goes away.
    fn subscribe(
        &self,
        table: &str,
        filter: Filter,
    ) -> impl Future<Output = Result<ChangeReceiver>> + Send;
}
