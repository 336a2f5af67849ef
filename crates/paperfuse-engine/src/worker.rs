//! Per-source enrichment workers. Each worker owns its remaining papers,
//! resolves them against one provider (identifier batches first, title search
//! as fallback), and streams fragments to the merge loop over a bounded
//! channel. A failing paper never aborts the rest of the batch.

use std::sync::Arc;

use paperfuse_core::matcher::{self, MatchCandidate};
use paperfuse_core::{EnrichmentFragment, FragmentFailure, Paper};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::sources::{SourceClient, fragment_from_hit};

#[derive(Debug)]
pub enum WorkerEvent {
    Fragment(EnrichmentFragment),
    /// Sent only when the worker processed every remaining paper; a worker
    /// stopped by shutdown ends without it.
    SourceFinished { source: String },
}

pub struct EnrichmentWorker {
    source: Arc<dyn SourceClient>,
    tx: mpsc::Sender<WorkerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl EnrichmentWorker {
    pub fn new(
        source: Arc<dyn SourceClient>,
        tx: mpsc::Sender<WorkerEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            tx,
            shutdown,
        }
    }

    /// Process `papers` to completion or shutdown. Consumes the worker; the
    /// sender half drops on return, which is what lets the merge loop detect
    /// a crashed worker.
    pub async fn run(self, papers: Vec<Paper>) {
        let name = self.source.name();
        info!(source = name, papers = papers.len(), "worker started");

        let mut keyed: Vec<(Paper, String)> = Vec::new();
        let mut unkeyed: Vec<Paper> = Vec::new();
        for paper in papers {
            match self.source.key_for(&paper) {
                Some(key) => keyed.push((paper, key)),
                None => unkeyed.push(paper),
            }
        }

        for chunk in keyed.chunks(self.source.batch_size().max(1)) {
            if *self.shutdown.borrow() {
                info!(source = name, "worker stopping on shutdown");
                return;
            }
            let keys: Vec<String> = chunk.iter().map(|(_, k)| k.clone()).collect();
            match self.source.lookup_batch(&keys).await {
                Ok(hits) => {
                    for ((paper, _), hit) in chunk.iter().zip(hits) {
                        match hit {
                            Some(hit) => {
                                let fragment = fragment_from_hit(&paper.id, name, &hit);
                                if self.emit(fragment).await.is_err() {
                                    return;
                                }
                            }
                            // Provider does not know this identifier; give the
                            // paper a second chance through title search.
                            None => unkeyed.push(paper.clone()),
                        }
                    }
                }
                Err(e) => {
                    warn!(source = name, error = %e, "batch lookup failed");
                    let failure = failure_from(&e);
                    for (paper, _) in chunk {
                        let fragment = EnrichmentFragment::failed(
                            paper.id.clone(),
                            name,
                            failure.clone(),
                        );
                        if self.emit(fragment).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        for paper in unkeyed {
            if *self.shutdown.borrow() {
                info!(source = name, "worker stopping on shutdown");
                return;
            }
            let fragment = self.enrich_by_title(&paper).await;
            if self.emit(fragment).await.is_err() {
                return;
            }
        }

        info!(source = name, "worker finished");
        let _ = self
            .tx
            .send(WorkerEvent::SourceFinished {
                source: name.to_string(),
            })
            .await;
    }

    async fn enrich_by_title(&self, paper: &Paper) -> EnrichmentFragment {
        let name = self.source.name();
        let hits = match self.source.search_title(&paper.title).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(source = name, paper = %paper.id, error = %e, "title search failed");
                return EnrichmentFragment::failed(paper.id.clone(), name, failure_from(&e));
            }
        };

        let target = MatchCandidate {
            title: &paper.title,
            year: paper.year,
            authors: &paper.authors,
        };
        let best = hits
            .iter()
            .map(|hit| (hit, matcher::score(&target, &hit.candidate())))
            .max_by(|(_, a), (_, b)| a.score.total_cmp(&b.score));

        match best {
            Some((hit, result)) if matcher::is_confident_source_match(&result) => {
                fragment_from_hit(&paper.id, name, hit)
            }
            _ => {
                debug!(source = name, paper = %paper.id, "no confident match");
                // Empty fragment: the paper counts as processed with nothing
                // found, which is not a failure.
                EnrichmentFragment::new(paper.id.clone(), name)
            }
        }
    }

    async fn emit(&self, fragment: EnrichmentFragment) -> Result<(), ()> {
        self.tx
            .send(WorkerEvent::Fragment(fragment))
            .await
            .map_err(|_| ())
    }
}

fn failure_from(e: &EngineError) -> FragmentFailure {
    if e.is_retryable() {
        FragmentFailure::transient(e.to_string())
    } else {
        FragmentFailure::permanent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use paperfuse_core::{FailureKind, PaperId};

    use super::*;
    use crate::sources::stub::{StubSource, hit};

    async fn run_worker(source: StubSource, papers: Vec<Paper>) -> (Vec<EnrichmentFragment>, bool) {
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = EnrichmentWorker::new(Arc::new(source), tx, shutdown_rx);
        tokio::spawn(worker.run(papers));

        let mut fragments = Vec::new();
        let mut finished = false;
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Fragment(f) => fragments.push(f),
                WorkerEvent::SourceFinished { .. } => finished = true,
            }
        }
        (fragments, finished)
    }

    fn paper_with_doi(id: &str, title: &str, doi: &str) -> Paper {
        let mut paper = Paper::stub(id, title, Vec::new(), None, Some(2017));
        paper.ids.set_doi(doi);
        paper
    }

    #[tokio::test]
    async fn keyed_papers_are_resolved_in_batches() {
        let source = StubSource::named("alpha")
            .with_hit("10.1/a", hit("First Paper", Some(2017), 10))
            .with_hit("10.1/b", hit("Second Paper", Some(2017), 20));
        let papers = vec![
            paper_with_doi("p1", "First Paper", "10.1/a"),
            paper_with_doi("p2", "Second Paper", "10.1/b"),
        ];

        let (fragments, finished) = run_worker(source, papers).await;
        assert!(finished);
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| f.error.is_none()));
        assert_eq!(fragments[0].citations[0].value, 10);
        assert_eq!(fragments[1].citations[0].value, 20);
    }

    #[tokio::test]
    async fn one_failing_batch_does_not_abort_the_rest() {
        let mut source = StubSource::named("alpha")
            .with_hit("10.1/good", hit("Good Paper", Some(2017), 5));
        source.batch = 1;
        source.transient_keys.insert("10.1/bad".to_string());
        let papers = vec![
            paper_with_doi("p1", "Bad Paper", "10.1/bad"),
            paper_with_doi("p2", "Good Paper", "10.1/good"),
        ];

        let (fragments, finished) = run_worker(source, papers).await;
        assert!(finished);
        assert_eq!(fragments.len(), 2);

        let bad = fragments
            .iter()
            .find(|f| f.paper_id == PaperId::from("p1"))
            .unwrap();
        assert_eq!(bad.error.as_ref().unwrap().kind, FailureKind::Transient);

        let good = fragments
            .iter()
            .find(|f| f.paper_id == PaperId::from("p2"))
            .unwrap();
        assert!(good.error.is_none());
        assert_eq!(good.citations[0].value, 5);
    }

    #[tokio::test]
    async fn unknown_key_falls_back_to_title_search() {
        let source = StubSource::named("alpha")
            .with_hit("some-other-key", hit("Findable By Title", Some(2017), 7));
        // DOI not in the stub's key index, but the title is.
        let papers = vec![paper_with_doi("p1", "Findable By Title", "10.1/unknown")];

        let (fragments, finished) = run_worker(source, papers).await;
        assert!(finished);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].error.is_none());
        assert_eq!(fragments[0].citations[0].value, 7);
    }

    #[tokio::test]
    async fn low_confidence_search_result_yields_empty_fragment() {
        let source = StubSource::named("alpha");
        let papers = vec![Paper::stub(
            "p1",
            "A Paper Nobody Indexed",
            Vec::new(),
            None,
            None,
        )];

        let (fragments, finished) = run_worker(source, papers).await;
        assert!(finished);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_empty());
        assert!(fragments[0].error.is_none());
    }

    #[tokio::test]
    async fn shutdown_suppresses_source_finished() {
        let source = StubSource::named("alpha");
        let papers = vec![Paper::stub("p1", "One", Vec::new(), None, None)];

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        let worker = EnrichmentWorker::new(Arc::new(source), tx, shutdown_rx);
        tokio::spawn(worker.run(papers));

        let mut saw_finished = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, WorkerEvent::SourceFinished { .. }) {
                saw_finished = true;
            }
        }
        assert!(!saw_finished);
    }
}
