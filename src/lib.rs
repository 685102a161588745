//! Windlass - keeps in-memory object caches in sync with on-chain contracts
//!
//! Object models declare which contract owns a kind of object, how to read
//! its properties, and which events announce creation or change. The sync
//! engine polls the ledger for new blocks, matches their events against the
//! registered watches, re-reads affected objects, and publishes fresh cache
//! snapshots. Writes go out as transactions whose completion resolves once
//! a later block includes them.

pub mod abi;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod ledger;
pub mod logs;
pub mod model;
pub mod registry;
pub mod rpc;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod mock;

// Re-export the main types for convenience
pub use cache::{CacheSnapshot, CachedObject, ObjectCache};
pub use engine::{EngineConfig, PollOutcome, SyncEngine, SyncHandle};
pub use error::{SyncError, SyncResult};
pub use hooks::{HookPattern, ObjectId, WatchTarget};
pub use ledger::{Ledger, LedgerError, LedgerResult};
pub use model::{CompiledModel, MethodCall, ModelDefinition};
pub use tracker::{PendingTx, TxCompletion};
