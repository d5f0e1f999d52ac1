// Re-export the Database struct and other public items
pub mod core;
mod enrichment;
mod paper;
mod queue;
mod schema;

// Re-export Database and essential traits
pub use self::core::Database;
pub use self::core::DbLockErrorExt;
pub use self::enrichment::{EnrichmentStatus, QuarantineEntry, QuarantinedEntity};
pub use self::paper::{verify_snapshot, SnapshotScope};
pub use self::queue::ClaimedBatch;
