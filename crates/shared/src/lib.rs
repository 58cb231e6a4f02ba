//! pinvault shared types and storage
//!
//! Domain records (accounts, stored objects, subscriptions, orders), the
//! `RecordStore` abstraction over them, and database helpers shared by the
//! billing engine, the upload service and the worker.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use db::*;
pub use error::*;
pub use store::{InMemoryRecordStore, PgRecordStore, RecordStore};
pub use types::*;
