//! Load orchestration for dataloom.
//!
//! [`LoadEngine`] plans the catalog, prepares the destination through the
//! [`ResetManager`], loads each table with [`TableLoader`] and finally
//! synchronizes identity generators.

pub mod ddl;
pub mod destination;
pub mod engine;
pub mod errors;
pub mod keys;
pub mod loader;
pub mod model;
pub mod reset;
pub mod script;
pub mod sequence;

pub use destination::{
    Destination, IdentityState, InsertOutcome, InsertRequest, LedgerEntry, MemoryDestination,
    PostgresDestination, ReferenceUpdate,
};
pub use engine::LoadEngine;
pub use errors::LoadError;
pub use keys::KeyRegistry;
pub use loader::{RestoredReferences, TableLoader};
pub use model::{
    LoadOptions, LoadReport, LoadResult, LoadStatus, ResetMode, ResetStrategy, ResetSummary,
    RunOutcome, SyncResult, SyncStatus,
};
pub use reset::{ResetManager, apply_guarded};
pub use script::{ScriptStatement, SplitScript, split_statements};
pub use sequence::synchronize_sequences;
