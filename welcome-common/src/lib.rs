pub mod metrics;
pub mod seed;
pub mod store;
