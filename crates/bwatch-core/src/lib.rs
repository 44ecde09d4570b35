//! Core domain + application logic for the business-account monitor.
//!
//! This crate is framework-agnostic. Telegram, SQLite and the remote document
//! store live behind ports (traits) implemented in adapter crates.

pub mod access;
pub mod config;
pub mod context;
pub mod dedup;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod ownership;
pub mod ports;
pub mod router;
pub mod store;
pub mod update;
pub mod utils;
pub mod vault;

#[cfg(test)]
pub(crate) mod testkit;

pub use errors::{Error, Result};
