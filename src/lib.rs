//! Purpose: Library crate behind the `keyferry` CLI and its tests.
//! Exports: `api` (stable facade), `core`, `store`, `engine`.
//! Role: Dump, restore, and live-sync of Redis-compatible keyspaces.
//! Invariants: Orchestrators depend only on the `Store`/`Connector` traits, never on a backend.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod engine;
pub mod store;
