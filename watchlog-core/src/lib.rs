//! Feed aggregation, comment threads and the session state that ties them together.
//!
//! [`session::Session`] is what a presentation layer holds on to: it owns the loaded
//! feed, a comment tree per post and the thread viewer, and talks to the store
//! through a [`watchlog_db::client::DbClient`].

pub mod comments;
pub mod config;
pub mod error;
pub mod feed;
pub mod session;
