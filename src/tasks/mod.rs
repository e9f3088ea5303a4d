pub mod aggregator;
pub mod publisher;
