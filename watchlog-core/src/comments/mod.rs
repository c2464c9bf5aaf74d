//! Nested comments: building the tree from flat rows and the focused thread viewer.

pub mod thread;
pub mod tree;
