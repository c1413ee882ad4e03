//! shelfscan - runs a report of named document queries against a book collection.
//!
//! This library exposes the core modules for use by the binary and integration tests.

pub mod app;
pub mod books;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod query;
pub mod report;
