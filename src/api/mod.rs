//! Purpose: Define the public Rust API boundary for keyferry.
//! Exports: Orchestrators, their options and reports, store backends, and the error model.
//! Role: Additive-only surface used by the CLI and by embedding programs.
//! Invariants: Callers never need to name an internal module path.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::cursor::ScanOptions;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::record::{Expiry, Record};
pub use crate::engine::dump::{DatabaseDump, DumpOptions, DumpReport, ErrorPolicy, dump};
pub use crate::engine::restore::{RestoreOptions, RestoreReport, restore};
pub use crate::engine::sync::{DatabaseSync, SyncOptions, SyncReport, sync};
pub use crate::engine::transfer::WritePolicy;
pub use crate::store::memory::{MemoryConnector, MemoryServer, MemoryStore};
pub use crate::store::redis::{RedisConnector, RedisStore};
pub use crate::store::{Connector, Endpoint, Store};
