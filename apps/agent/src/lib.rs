// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Keeply backup agent library.
//!
//! The engine is layered bottom-up: `store` (encrypted SQLite inventory),
//! `scan` (walker -> workers -> writer pipeline plus orchestration), `jobs`
//! (async controller with watchdog and recovery) and `api` (the HTTP/WS
//! edge). The content-addressed blob store lives in the `keeply-cas` crate.

pub mod api;
pub mod config;
pub mod jobs;
pub mod scan;
pub mod store;
