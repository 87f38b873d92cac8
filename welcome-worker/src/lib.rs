pub mod config;
pub mod error;
pub mod janitor;
pub mod notifier;
pub mod pool;
pub mod processor;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_utils;
