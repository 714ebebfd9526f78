//! Durable storage layer for the kiln evaluation platform.
//!
//! PostgreSQL-backed persistence for evaluation records and their event
//! trail. The broker-side state (queues, executor pool, running index) lives
//! in `kiln-core`; this crate is the authoritative store that everything
//! else reconciles against.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
