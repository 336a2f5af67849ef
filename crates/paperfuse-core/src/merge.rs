//! Single-consumer merge engine. All fragment application funnels through
//! one `MergeEngine`, so no locking is needed on the paper set itself.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{CoreError, Result};
use crate::paper::{EnrichmentFragment, FailureKind, Paper, PaperId};

/// What applying a fragment did, for logging at the call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub records_appended: usize,
    pub identifiers_adopted: usize,
    /// Identifier observations that lost first-write-wins to an earlier source.
    pub identifier_conflicts: usize,
    pub failure: Option<FailureKind>,
}

/// Owns the papers for the duration of a run and applies enrichment
/// fragments to them. Append-only for provenance records, first-write-wins
/// for scalar identifiers.
#[derive(Debug, Default)]
pub struct MergeEngine {
    papers: HashMap<PaperId, Paper>,
    order: Vec<PaperId>,
    enriched: BTreeMap<String, BTreeSet<PaperId>>,
    transient_failures: BTreeMap<String, BTreeSet<PaperId>>,
    permanent_failures: BTreeMap<String, BTreeSet<PaperId>>,
}

impl MergeEngine {
    pub fn new(papers: Vec<Paper>) -> Self {
        let order: Vec<PaperId> = papers.iter().map(|p| p.id.clone()).collect();
        let papers = papers.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            papers,
            order,
            enriched: BTreeMap::new(),
            transient_failures: BTreeMap::new(),
            permanent_failures: BTreeMap::new(),
        }
    }

    /// Restore failure ledgers from a previous session.
    pub fn restore_permanent_failures(&mut self, failures: BTreeMap<String, BTreeSet<PaperId>>) {
        self.permanent_failures = failures;
    }

    pub fn len(&self) -> usize {
        self.papers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.papers.is_empty()
    }

    pub fn get(&self, id: &PaperId) -> Option<&Paper> {
        self.papers.get(id)
    }

    pub fn contains(&self, id: &PaperId) -> bool {
        self.papers.contains_key(id)
    }

    /// Papers in their original input order.
    pub fn snapshot(&self) -> Vec<Paper> {
        self.order
            .iter()
            .filter_map(|id| self.papers.get(id).cloned())
            .collect()
    }

    pub fn enriched_count(&self, source: &str) -> usize {
        self.enriched.get(source).map_or(0, BTreeSet::len)
    }

    pub fn transient_failures(&self) -> &BTreeMap<String, BTreeSet<PaperId>> {
        &self.transient_failures
    }

    pub fn permanent_failures(&self) -> &BTreeMap<String, BTreeSet<PaperId>> {
        &self.permanent_failures
    }

    pub fn is_permanent_failure(&self, source: &str, id: &PaperId) -> bool {
        self.permanent_failures
            .get(source)
            .is_some_and(|set| set.contains(id))
    }

    /// Apply one fragment. Provenance records append unconditionally;
    /// identifier observations additionally attempt the scalar cross-id
    /// fields under first-write-wins.
    pub fn apply(&mut self, fragment: &EnrichmentFragment) -> Result<ApplyOutcome> {
        let paper = self
            .papers
            .get_mut(&fragment.paper_id)
            .ok_or_else(|| CoreError::UnknownPaper(fragment.paper_id.clone()))?;

        let mut outcome = ApplyOutcome::default();

        paper.citations.extend(fragment.citations.iter().cloned());
        paper.abstracts.extend(fragment.abstracts.iter().cloned());
        paper.urls.extend(fragment.urls.iter().cloned());
        outcome.records_appended =
            fragment.citations.len() + fragment.abstracts.len() + fragment.urls.len();

        for record in &fragment.identifiers {
            paper.identifier_history.push(record.clone());
            if paper.ids.observe(&record.value) {
                outcome.identifiers_adopted += 1;
            } else {
                outcome.identifier_conflicts += 1;
            }
        }
        outcome.records_appended += fragment.identifiers.len();

        match &fragment.error {
            None => {
                if !fragment.is_empty() {
                    self.enriched
                        .entry(fragment.source.clone())
                        .or_default()
                        .insert(fragment.paper_id.clone());
                }
            }
            Some(failure) => {
                outcome.failure = Some(failure.kind);
                let ledger = match failure.kind {
                    FailureKind::Transient => &mut self.transient_failures,
                    FailureKind::Permanent => &mut self.permanent_failures,
                };
                ledger
                    .entry(fragment.source.clone())
                    .or_default()
                    .insert(fragment.paper_id.clone());
            }
        }

        Ok(outcome)
    }
}
