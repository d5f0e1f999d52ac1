pub mod batch;
pub mod broadcast;
pub mod country;
pub mod dedup;
pub mod normalizer;
pub mod pipeline;
pub mod resolver;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch::{BatchResolver, BatchStats};
pub use broadcast::{broadcast, Broadcast, ExcludedRecord};
pub use dedup::{dedupe, DedupMap, UniqueEntity};
pub use pipeline::{EnrichmentEngine, RunReport};
pub use resolver::resolve_record;
pub use types::{
    CandidateSource, Category, EnrichmentRow, EntityResolution, Method, QuarantineReason,
    ResolutionCandidate, ResolutionResult, TargetRecord,
};
