//! Provider clients. Each source exposes the same narrow surface: resolve a
//! batch of identifier keys, search by title, and declare its batch size.

use async_trait::async_trait;
use paperfuse_core::matcher::MatchCandidate;
use paperfuse_core::{
    AbstractRecord, CitationRecord, EnrichmentFragment, IdentifierObservation, IdentifierRecord,
    Paper, PaperId, UrlRecord,
};

use crate::error::Result;

pub mod openalex;
pub mod semantic_scholar;

pub use openalex::OpenAlexClient;
pub use semantic_scholar::SemanticScholarClient;

/// Enrichment payload extracted from one provider record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFields {
    pub citation_count: Option<u64>,
    pub abstract_text: Option<String>,
    pub urls: Vec<String>,
    pub identifiers: Vec<IdentifierObservation>,
}

/// One record as returned by a provider lookup or search, with enough stub
/// fields to run the title matcher against it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceHit {
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub fields: SourceFields,
}

impl SourceHit {
    pub fn candidate(&self) -> MatchCandidate<'_> {
        MatchCandidate {
            title: &self.title,
            year: self.year,
            authors: &self.authors,
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Largest identifier batch the provider accepts in one request.
    fn batch_size(&self) -> usize;

    /// Provider lookup key for a paper whose cross-reference identifiers are
    /// already known, or `None` when the paper must go through title search.
    fn key_for(&self, paper: &Paper) -> Option<String>;

    /// Resolve up to `batch_size` keys in one request. The result is aligned
    /// with the input order, `None` for keys the provider does not know.
    async fn lookup_batch(&self, keys: &[String]) -> Result<Vec<Option<SourceHit>>>;

    async fn search_title(&self, title: &str) -> Result<Vec<SourceHit>>;
}

/// Turn a matched hit into the fragment the merge engine consumes. Every
/// record carries the source name and a retrieval timestamp.
pub fn fragment_from_hit(paper_id: &PaperId, source: &str, hit: &SourceHit) -> EnrichmentFragment {
    let mut fragment = EnrichmentFragment::new(paper_id.clone(), source);
    if let Some(count) = hit.fields.citation_count {
        fragment.citations.push(CitationRecord::now(source, count));
    }
    if let Some(text) = &hit.fields.abstract_text {
        fragment
            .abstracts
            .push(AbstractRecord::now(source, text.clone()));
    }
    for url in &hit.fields.urls {
        fragment.urls.push(UrlRecord::now(source, url.clone()));
    }
    for observation in &hit.fields.identifiers {
        fragment
            .identifiers
            .push(IdentifierRecord::now(source, observation.clone()));
    }
    fragment
}
