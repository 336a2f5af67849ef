//! Run orchestration: session setup, the identifier harvest pass, per-source
//! worker lifecycle, the single merge consumer, and checkpoint cadence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{info, warn};
use uuid::Uuid;

use paperfuse_core::{EnrichmentFragment, FailureKind, MergeEngine, Paper};

use crate::checkpoint::{SessionCheckpoint, SessionStore, input_fingerprint};
use crate::config::ConsolidationConfig;
use crate::error::{EngineError, Result};
use crate::harvest::IdentifierHarvester;
use crate::sources::SourceClient;
use crate::worker::{EnrichmentWorker, WorkerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Harvesting,
    Enriching,
    Finalizing,
    Completed,
    Failed,
    /// Graceful shutdown: in-flight work drained, checkpoint written, session
    /// left resumable.
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub session_id: String,
    pub papers: usize,
    /// Papers that received at least one record, per source.
    pub enriched: BTreeMap<String, usize>,
    pub transient_failures: BTreeMap<String, usize>,
    pub permanent_failures: BTreeMap<String, usize>,
    pub output: Option<PathBuf>,
}

pub struct Orchestrator {
    config: ConsolidationConfig,
    sources: Vec<Arc<dyn SourceClient>>,
    store: SessionStore,
}

impl Orchestrator {
    pub fn new(config: ConsolidationConfig, sources: Vec<Arc<dyn SourceClient>>) -> Self {
        let store = SessionStore::new(config.session_root.clone());
        Self {
            config,
            sources,
            store,
        }
    }

    /// Consolidate `papers` to completion, shutdown, or failure. `shutdown`
    /// flipping to true requests a graceful stop.
    pub async fn run(
        &self,
        papers: Vec<Paper>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        info!(papers = papers.len(), state = ?RunState::Initializing, "run starting");
        if papers.is_empty() {
            return Err(EngineError::Config("no papers to consolidate".to_string()));
        }
        let sources = self.selected_sources()?;

        let fingerprint = input_fingerprint(&papers);
        let (mut merge, mut checkpoint) = self.open_session(papers, &fingerprint)?;

        // The lock is held from here on; release it on every exit path that
        // is not an archive.
        match self
            .drive(&sources, &mut merge, &mut checkpoint, shutdown)
            .await
        {
            Ok(RunState::Completed) => {
                let output = self.store.write_output(&merge.snapshot())?;
                self.store.archive(&checkpoint.session_id)?;
                info!(output = %output.display(), "run completed");
                Ok(self.summary(RunState::Completed, &checkpoint, &merge, Some(output)))
            }
            Ok(state) => {
                self.store.release_lock();
                Ok(self.summary(state, &checkpoint, &merge, None))
            }
            Err(e) => {
                warn!(error = %e, state = ?RunState::Failed, "run failed");
                self.store.release_lock();
                Err(e)
            }
        }
    }

    fn selected_sources(&self) -> Result<Vec<Arc<dyn SourceClient>>> {
        let sources: Vec<Arc<dyn SourceClient>> = match &self.config.single_source {
            Some(name) => self
                .sources
                .iter()
                .filter(|s| s.name() == name)
                .cloned()
                .collect(),
            None => self.sources.clone(),
        };
        if sources.is_empty() {
            return Err(EngineError::Config(match &self.config.single_source {
                Some(name) => format!("unknown source {name:?}"),
                None => "no sources configured".to_string(),
            }));
        }
        Ok(sources)
    }

    fn open_session(
        &self,
        papers: Vec<Paper>,
        fingerprint: &str,
    ) -> Result<(MergeEngine, SessionCheckpoint)> {
        if self.config.resume
            && let Some(previous) = self.store.latest_resumable(fingerprint)?
        {
            info!(session = %previous.session_id, "resuming session");
            self.store.take_over_lock(&previous.session_id)?;
            let mut merge = MergeEngine::new(previous.papers.clone());
            merge.restore_permanent_failures(previous.permanent_failures.clone());
            return Ok((merge, previous));
        }

        let session_id = Uuid::new_v4().to_string();
        info!(session = %session_id, "starting fresh session");
        self.store.acquire_lock(&session_id)?;
        let checkpoint =
            SessionCheckpoint::new(session_id, fingerprint.to_string(), papers.clone());
        Ok((MergeEngine::new(papers), checkpoint))
    }

    async fn drive(
        &self,
        sources: &[Arc<dyn SourceClient>],
        merge: &mut MergeEngine,
        checkpoint: &mut SessionCheckpoint,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunState> {
        // First durable state before any network work: from here on a crash
        // leaves a session on disk next to the lock, so resume can take over.
        self.save_checkpoint(checkpoint, merge)?;

        let mut ticker = interval(self.config.checkpoint_interval);
        ticker.tick().await; // the first tick is immediate

        // Harvest pass: resolve missing identifiers through the fast
        // provider before the per-source workers start batching.
        info!(state = ?RunState::Harvesting, "harvesting identifiers");
        let harvest_source = sources
            .iter()
            .find(|s| s.name() == "semantic_scholar")
            .unwrap_or(&sources[0]);
        let (fragments, finished) = {
            let snapshot = merge.snapshot();
            let harvester = IdentifierHarvester::new(harvest_source.as_ref());
            let harvest = harvester.harvest(&snapshot, &shutdown);
            tokio::pin!(harvest);
            loop {
                tokio::select! {
                    outcome = &mut harvest => break outcome,
                    _ = ticker.tick() => self.save_checkpoint(checkpoint, merge)?,
                }
            }
        };
        for fragment in &fragments {
            merge.apply(fragment)?;
        }
        if !finished {
            self.save_checkpoint(checkpoint, merge)?;
            return Ok(RunState::Interrupted);
        }

        info!(state = ?RunState::Enriching, sources = sources.len(), "spawning workers");
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut pending = 0usize;
        for source in sources {
            let remaining: Vec<Paper> = merge
                .snapshot()
                .into_iter()
                .filter(|p| {
                    let progress = checkpoint.progress(source.name());
                    !progress.processed.contains(&p.id)
                        && !merge.is_permanent_failure(source.name(), &p.id)
                })
                .collect();
            if remaining.is_empty() {
                info!(source = source.name(), "nothing left to enrich");
                checkpoint.progress(source.name()).completed = true;
                continue;
            }
            let worker =
                EnrichmentWorker::new(Arc::clone(source), tx.clone(), shutdown.clone());
            tokio::spawn(worker.run(remaining));
            pending += 1;
        }
        drop(tx);

        let mut shutdown_closed = false;

        while pending > 0 {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Some(source) = self.absorb(merge, checkpoint, event)? {
                            info!(source = %source, "source finished");
                            pending -= 1;
                            self.save_checkpoint(checkpoint, merge)?;
                        }
                    }
                    None => {
                        if *shutdown.borrow() {
                            break;
                        }
                        return Err(EngineError::ChannelClosed);
                    }
                },
                _ = ticker.tick() => {
                    self.save_checkpoint(checkpoint, merge)?;
                }
                changed = shutdown.changed(), if !shutdown_closed => {
                    if changed.is_err() {
                        shutdown_closed = true;
                    }
                }
            }
        }

        if *shutdown.borrow() {
            // Drain everything the workers still emit while they wind down;
            // the channel closes once the last sender notices the shutdown.
            info!("shutdown requested, draining workers");
            while let Some(event) = rx.recv().await {
                self.absorb(merge, checkpoint, event)?;
            }
            self.save_checkpoint(checkpoint, merge)?;
            return Ok(RunState::Interrupted);
        }

        info!(state = ?RunState::Finalizing, "all sources finished");
        self.save_checkpoint(checkpoint, merge)?;
        Ok(RunState::Completed)
    }

    /// Apply one worker event. Returns the source name when the event closed
    /// out a source.
    fn absorb(
        &self,
        merge: &mut MergeEngine,
        checkpoint: &mut SessionCheckpoint,
        event: WorkerEvent,
    ) -> Result<Option<String>> {
        match event {
            WorkerEvent::Fragment(fragment) => {
                self.absorb_fragment(merge, checkpoint, &fragment)?;
                Ok(None)
            }
            WorkerEvent::SourceFinished { source } => {
                checkpoint.progress(&source).completed = true;
                Ok(Some(source))
            }
        }
    }

    fn absorb_fragment(
        &self,
        merge: &mut MergeEngine,
        checkpoint: &mut SessionCheckpoint,
        fragment: &EnrichmentFragment,
    ) -> Result<()> {
        let outcome = merge.apply(fragment)?;
        match outcome.failure {
            // Success and permanent failure are both definitive outcomes;
            // transient failures stay unprocessed so resume retries them.
            None | Some(FailureKind::Permanent) => {
                checkpoint
                    .progress(&fragment.source)
                    .processed
                    .insert(fragment.paper_id.clone());
            }
            Some(FailureKind::Transient) => {}
        }
        Ok(())
    }

    fn save_checkpoint(
        &self,
        checkpoint: &mut SessionCheckpoint,
        merge: &MergeEngine,
    ) -> Result<()> {
        checkpoint.papers = merge.snapshot();
        checkpoint.permanent_failures = merge.permanent_failures().clone();
        checkpoint.last_checkpoint_at = Utc::now();
        self.store.save(checkpoint)
    }

    fn summary(
        &self,
        state: RunState,
        checkpoint: &SessionCheckpoint,
        merge: &MergeEngine,
        output: Option<PathBuf>,
    ) -> RunSummary {
        RunSummary {
            state,
            session_id: checkpoint.session_id.clone(),
            papers: merge.len(),
            enriched: self
                .sources
                .iter()
                .map(|s| (s.name().to_string(), merge.enriched_count(s.name())))
                .collect(),
            transient_failures: merge
                .transient_failures()
                .iter()
                .map(|(source, ids)| (source.clone(), ids.len()))
                .collect(),
            permanent_failures: merge
                .permanent_failures()
                .iter()
                .map(|(source, ids)| (source.clone(), ids.len()))
                .collect(),
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use paperfuse_core::{CitationRecord, IdentifierObservation, PaperId};

    use super::*;
    use crate::checkpoint::input_fingerprint;
    use crate::sources::stub::{StubSource, hit};
    use crate::sources::{SourceFields, SourceHit};

    fn config_for(dir: &tempfile::TempDir) -> ConsolidationConfig {
        ConsolidationConfig {
            session_root: dir.path().to_path_buf(),
            ..ConsolidationConfig::default()
        }
    }

    fn paper_with_doi(id: &str, title: &str, doi: &str) -> Paper {
        let mut paper = Paper::stub(id, title, Vec::new(), None, Some(2017));
        paper.ids.set_doi(doi);
        paper
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn two_sources_enrich_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = StubSource::named("alpha")
            .with_hit("10.1/a", hit("First Paper", Some(2017), 10))
            .with_hit("10.1/b", hit("Second Paper", Some(2017), 20));
        let beta = StubSource::named("beta")
            .with_hit("10.1/a", hit("First Paper", Some(2017), 11))
            .with_hit("10.1/b", hit("Second Paper", Some(2017), 21));

        let orchestrator = Orchestrator::new(
            config_for(&dir),
            vec![Arc::new(alpha) as Arc<dyn SourceClient>, Arc::new(beta)],
        );
        let papers = vec![
            paper_with_doi("p1", "First Paper", "10.1/a"),
            paper_with_doi("p2", "Second Paper", "10.1/b"),
        ];
        let (_tx, rx) = shutdown_pair();

        let summary = orchestrator.run(papers, rx).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.enriched["alpha"], 2);
        assert_eq!(summary.enriched["beta"], 2);

        let output = summary.output.unwrap();
        let papers: Vec<Paper> =
            serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
        let p1 = papers.iter().find(|p| p.id == PaperId::from("p1")).unwrap();
        assert_eq!(p1.citations.len(), 2);
        let counts: Vec<u64> = p1.citations.iter().map(|c| c.value).collect();
        assert!(counts.contains(&10) && counts.contains(&11));

        // Session archived, lock gone.
        assert!(dir.path().join("archived").exists());
        assert!(!dir.path().join("active.lock").exists());
    }

    #[tokio::test]
    async fn harvested_identifiers_feed_the_batch_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::named("semantic_scholar").with_hit(
            "10.1/x",
            SourceHit {
                fields: SourceFields {
                    citation_count: Some(42),
                    identifiers: vec![IdentifierObservation::new("doi", "10.1/x")],
                    ..SourceFields::default()
                },
                ..hit("Attention Is All You Need", Some(2017), 42)
            },
        );

        let orchestrator =
            Orchestrator::new(config_for(&dir), vec![Arc::new(source) as Arc<dyn SourceClient>]);
        let papers = vec![Paper::stub(
            "p1",
            "Attention Is All You Need",
            Vec::new(),
            None,
            Some(2017),
        )];
        let (_tx, rx) = shutdown_pair();

        let summary = orchestrator.run(papers, rx).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);

        let output: Vec<Paper> =
            serde_json::from_slice(&std::fs::read(summary.output.unwrap()).unwrap()).unwrap();
        assert_eq!(output[0].ids.doi.as_deref(), Some("10.1/x"));
        assert_eq!(output[0].citations.len(), 1);
        assert_eq!(output[0].citations[0].value, 42);
        assert!(!output[0].identifier_history.is_empty());
    }

    #[tokio::test]
    async fn resume_skips_already_processed_papers() {
        let dir = tempfile::tempdir().unwrap();
        let papers = vec![
            paper_with_doi("p1", "First", "10.1/a"),
            paper_with_doi("p2", "Second", "10.1/b"),
            paper_with_doi("p3", "Third", "10.1/c"),
        ];
        let fingerprint = input_fingerprint(&papers);

        // Simulate a crashed earlier run: p1 enriched, p2 processed with
        // nothing found, p3 untouched.
        let mut previous_papers = papers.clone();
        previous_papers[0]
            .citations
            .push(CitationRecord::now("alpha", 10));
        let mut previous =
            SessionCheckpoint::new("prev".to_string(), fingerprint, previous_papers);
        previous.progress("alpha").processed.insert(PaperId::from("p1"));
        previous.progress("alpha").processed.insert(PaperId::from("p2"));
        let store = SessionStore::new(dir.path());
        store.save(&previous).unwrap();

        let alpha = StubSource::named("alpha")
            .with_hit("10.1/a", hit("First", Some(2017), 99))
            .with_hit("10.1/b", hit("Second", Some(2017), 99))
            .with_hit("10.1/c", hit("Third", Some(2017), 30));
        let config = ConsolidationConfig {
            resume: true,
            ..config_for(&dir)
        };
        let orchestrator =
            Orchestrator::new(config, vec![Arc::new(alpha) as Arc<dyn SourceClient>]);
        let (_tx, rx) = shutdown_pair();

        let summary = orchestrator.run(papers, rx).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.session_id, "prev");

        let output: Vec<Paper> =
            serde_json::from_slice(&std::fs::read(summary.output.unwrap()).unwrap()).unwrap();
        let by_id = |id: &str| output.iter().find(|p| p.id == PaperId::from(id)).unwrap();
        // p1 keeps its old record and is not re-fetched.
        assert_eq!(by_id("p1").citations.len(), 1);
        assert_eq!(by_id("p1").citations[0].value, 10);
        // p2 was already processed; still nothing.
        assert!(by_id("p2").citations.is_empty());
        // p3 is the only new work.
        assert_eq!(by_id("p3").citations.len(), 1);
        assert_eq!(by_id("p3").citations[0].value, 30);
    }

    #[tokio::test]
    async fn preset_shutdown_interrupts_and_leaves_session_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::named("alpha");
        let orchestrator =
            Orchestrator::new(config_for(&dir), vec![Arc::new(source) as Arc<dyn SourceClient>]);
        // No identifiers, so the run has harvest work to interrupt.
        let papers = vec![Paper::stub("p1", "Some Paper", Vec::new(), None, None)];
        let (tx, rx) = shutdown_pair();
        tx.send(true).unwrap();

        let summary = orchestrator.run(papers, rx).await.unwrap();
        assert_eq!(summary.state, RunState::Interrupted);
        assert!(summary.output.is_none());

        // Session stays resumable: checkpoint on disk, lock released, no
        // archive, no output.
        let sessions: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .collect();
        assert_eq!(sessions.len(), 1);
        assert!(!dir.path().join("active.lock").exists());
        assert!(!dir.path().join("consolidated.json").exists());
    }

    #[tokio::test]
    async fn unknown_single_source_fails_before_workers_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConsolidationConfig {
            single_source: Some("nonexistent".to_string()),
            ..config_for(&dir)
        };
        let orchestrator = Orchestrator::new(
            config,
            vec![Arc::new(StubSource::named("alpha")) as Arc<dyn SourceClient>],
        );
        let (_tx, rx) = shutdown_pair();

        let err = orchestrator
            .run(
                vec![paper_with_doi("p1", "First", "10.1/a")],
                rx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(!dir.path().join("active.lock").exists());
    }

    #[tokio::test]
    async fn resume_recovers_a_crashed_session_with_a_leftover_lock() {
        let dir = tempfile::tempdir().unwrap();
        let papers = vec![paper_with_doi("p1", "First", "10.1/a")];
        let fingerprint = input_fingerprint(&papers);

        // A killed run leaves its lock and its first checkpoint behind.
        let store = SessionStore::new(dir.path());
        store.acquire_lock("crashed").unwrap();
        store
            .save(&SessionCheckpoint::new(
                "crashed".to_string(),
                fingerprint,
                papers.clone(),
            ))
            .unwrap();

        let alpha = StubSource::named("alpha").with_hit("10.1/a", hit("First", Some(2017), 7));
        let config = ConsolidationConfig {
            resume: true,
            ..config_for(&dir)
        };
        let orchestrator =
            Orchestrator::new(config, vec![Arc::new(alpha) as Arc<dyn SourceClient>]);
        let (_tx, rx) = shutdown_pair();

        let summary = orchestrator.run(papers, rx).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.session_id, "crashed");
        assert_eq!(summary.enriched["alpha"], 1);
        assert!(!dir.path().join("active.lock").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_checkpoints_persist_progress_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = StubSource {
            latency: Duration::from_secs(100),
            batch: 1,
            ..StubSource::named("alpha")
        }
        .with_hit("10.1/a", hit("First", Some(2017), 10))
        .with_hit("10.1/b", hit("Second", Some(2017), 20));
        let config = ConsolidationConfig {
            checkpoint_interval: Duration::from_secs(60),
            ..config_for(&dir)
        };
        let orchestrator =
            Orchestrator::new(config, vec![Arc::new(alpha) as Arc<dyn SourceClient>]);
        let papers = vec![
            paper_with_doi("p1", "First", "10.1/a"),
            paper_with_doi("p2", "Second", "10.1/b"),
        ];
        let (_tx, rx) = shutdown_pair();
        let handle = tokio::spawn(async move { orchestrator.run(papers, rx).await });

        // The session is on disk before the first provider response lands.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let store = SessionStore::new(dir.path());
        let session_id = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .file_name()
            .to_string_lossy()
            .into_owned();
        let initial = store.load(&session_id).unwrap();
        assert!(initial.papers.iter().all(|p| p.citations.is_empty()));

        // The first batch answers at t=100s; the 60s ticker persists that
        // fragment at t=120s while the second batch is still in flight.
        tokio::time::sleep(Duration::from_secs(129)).await;
        let mid = store.load(&session_id).unwrap();
        let p1 = mid
            .papers
            .iter()
            .find(|p| p.id == PaperId::from("p1"))
            .unwrap();
        assert_eq!(p1.citations.len(), 1);
        assert_eq!(p1.citations[0].value, 10);
        assert!(!mid.sources["alpha"].completed);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.enriched["alpha"], 2);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected_by_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.acquire_lock("other-run").unwrap();

        let orchestrator = Orchestrator::new(
            config_for(&dir),
            vec![Arc::new(StubSource::named("alpha")) as Arc<dyn SourceClient>],
        );
        let (_tx, rx) = shutdown_pair();
        let err = orchestrator
            .run(vec![paper_with_doi("p1", "First", "10.1/a")], rx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionLocked(_)));
        // The foreign lock must survive.
        assert!(dir.path().join("active.lock").exists());
    }
}
