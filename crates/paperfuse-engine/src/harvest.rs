//! Identifier harvesting: a pre-enrichment pass that resolves missing
//! cross-reference identifiers through the fast provider, so the per-source
//! workers can use batched identifier lookups instead of title search.

use paperfuse_core::matcher::{self, MatchCandidate};
use paperfuse_core::{
    EnrichmentFragment, FragmentFailure, IdentifierRecord, Paper,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::sources::SourceClient;

pub struct IdentifierHarvester<'a> {
    source: &'a dyn SourceClient,
}

impl<'a> IdentifierHarvester<'a> {
    pub fn new(source: &'a dyn SourceClient) -> Self {
        Self { source }
    }

    /// Resolve identifiers for every paper that has none. Returns the
    /// identifier-only fragments produced and whether the pass ran to
    /// completion (false when shutdown interrupted it).
    pub async fn harvest(
        &self,
        papers: &[Paper],
        shutdown: &watch::Receiver<bool>,
    ) -> (Vec<EnrichmentFragment>, bool) {
        let mut fragments = Vec::new();
        let missing: Vec<&Paper> = papers.iter().filter(|p| !p.ids.has_any()).collect();
        if missing.is_empty() {
            return (fragments, true);
        }
        info!(count = missing.len(), source = self.source.name(), "harvesting identifiers");

        for paper in missing {
            if *shutdown.borrow() {
                return (fragments, false);
            }
            match self.resolve(paper).await {
                Ok(Some(fragment)) => fragments.push(fragment),
                Ok(None) => {
                    debug!(paper = %paper.id, "no confident identifier match");
                }
                Err(failure) => {
                    warn!(paper = %paper.id, error = %failure.message, "identifier harvest failed");
                    fragments.push(EnrichmentFragment::failed(
                        paper.id.clone(),
                        self.source.name(),
                        failure,
                    ));
                }
            }
        }
        (fragments, true)
    }

    async fn resolve(
        &self,
        paper: &Paper,
    ) -> std::result::Result<Option<EnrichmentFragment>, FragmentFailure> {
        let hits = self.source.search_title(&paper.title).await.map_err(|e| {
            if e.is_retryable() {
                FragmentFailure::transient(e.to_string())
            } else {
                FragmentFailure::permanent(e.to_string())
            }
        })?;

        let target = MatchCandidate {
            title: &paper.title,
            year: paper.year,
            authors: &paper.authors,
        };
        let best = hits
            .iter()
            .map(|hit| (hit, matcher::score(&target, &hit.candidate())))
            .max_by(|(_, a), (_, b)| a.score.total_cmp(&b.score));

        let Some((hit, result)) = best else {
            return Ok(None);
        };
        if !matcher::is_confident_source_match(&result) {
            return Ok(None);
        }

        // Identifier-only fragment: the enrichment fields this hit carries
        // are left to the per-source worker, which will now reach this paper
        // through the batch path.
        let mut fragment = EnrichmentFragment::new(paper.id.clone(), self.source.name());
        for observation in &hit.fields.identifiers {
            fragment
                .identifiers
                .push(IdentifierRecord::now(self.source.name(), observation.clone()));
        }
        if fragment.identifiers.is_empty() {
            return Ok(None);
        }
        Ok(Some(fragment))
    }
}
