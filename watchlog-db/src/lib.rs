//! Access to the hosted relational store.
//!
//! [`store::StoreClient`] is the generic select/insert/update/delete/procedure
//! contract the backend exposes. [`pg::PgStore`] talks to PostgreSQL directly and
//! [`memory::MemoryStore`] keeps everything in process. [`client::DbClient`] layers
//! the typed queries the app needs on top of either.

pub mod client;
pub mod memory;
pub mod pg;
pub mod query;
pub mod record;
pub mod store;
