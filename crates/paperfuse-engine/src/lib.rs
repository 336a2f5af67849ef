//! Paperfuse engine — concurrent enrichment of a paper collection from
//! external bibliographic sources, with crash-consistent session
//! checkpointing.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod harvest;
pub mod http;
pub mod orchestrator;
pub mod sources;
pub mod worker;

pub use checkpoint::{SessionCheckpoint, SessionStore, SourceProgress, input_fingerprint};
pub use config::ConsolidationConfig;
pub use error::{EngineError, Result};
pub use harvest::IdentifierHarvester;
pub use http::RateLimitedClient;
pub use orchestrator::{Orchestrator, RunState, RunSummary};
pub use sources::{OpenAlexClient, SemanticScholarClient, SourceClient, SourceFields, SourceHit};
pub use worker::{EnrichmentWorker, WorkerEvent};
