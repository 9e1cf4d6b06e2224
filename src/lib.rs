pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod persister;
pub mod providers;
pub mod reporting;
pub mod retry;
pub mod store;
pub mod token_manager;
pub mod walker;

#[cfg(test)]
mod test_support;
