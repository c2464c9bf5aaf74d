pub mod aggregator;
pub mod likes;
pub mod pagination;
