pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod materializer;
pub mod models;
pub mod poller;
pub mod provider;
pub mod routes;
pub mod store;

#[cfg(test)]
mod testing;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
