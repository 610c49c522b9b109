//! OnionWatch - availability monitor for .onion and .i2p services.
//!
//! Targets live in SQLite, are grouped into mirror families, and are
//! probed through a SOCKS proxy in planned, concurrency-capped sweeps.

pub mod activity;
pub mod config;
pub mod db;
pub mod error;
pub mod normalize;
pub mod planner;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod seed;
pub mod web;

pub use error::MonitorError;
