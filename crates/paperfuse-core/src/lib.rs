//! Paperfuse core — paper data model, title matching, provenance merging.

pub mod error;
pub mod matcher;
pub mod merge;
pub mod paper;

pub use error::{CoreError, Result};
pub use matcher::{
    MatchCandidate, MatchEvidence, MatchResult, MatchTier, is_confident_source_match,
    normalize_title, score,
};
pub use merge::{ApplyOutcome, MergeEngine};
pub use paper::{
    AbstractRecord, CitationRecord, CrossIds, EnrichmentFragment, FailureKind, FragmentFailure,
    IdentifierObservation, IdentifierRecord, Paper, PaperId, Provenance, UrlRecord,
};
