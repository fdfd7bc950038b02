// ABOUTME: Library root for view-materializer
// ABOUTME: Exports the materialization core, database backends and CLI commands

pub mod commands;
pub mod config;
pub mod database;
pub mod materialize;
pub mod postgres;
pub mod sql;
pub mod sqlite;
pub mod utils;
pub mod value;

pub use materialize::{SyncEngine, SyncError, SyncReport, Watermark};
pub use value::SqlValue;
