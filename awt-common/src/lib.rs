//! # AWT Common Library
//!
//! Shared code for the automated water tester:
//! - Database layer (SQLite) and entity models
//! - Instrument settings (database-first configuration)
//! - Error types
//! - Alarm and measurement-report delivery

pub mod alarms;
pub mod db;
pub mod error;

pub use error::{Error, Result};
