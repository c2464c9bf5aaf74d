//! Domain model shared by the store adapters and the feed engine.

pub mod model;
