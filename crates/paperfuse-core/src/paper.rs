use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable internal identifier assigned by the upstream collection stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaperId(String);

impl PaperId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PaperId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PaperId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value plus which source produced it and when. Append-only: records are
/// never edited or removed once written; a later observation from the same
/// source adds a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance<T> {
    pub source: String,
    pub retrieved_at: DateTime<Utc>,
    pub value: T,
}

impl<T> Provenance<T> {
    pub fn now(source: impl Into<String>, value: T) -> Self {
        Self {
            source: source.into(),
            retrieved_at: Utc::now(),
            value,
        }
    }
}

pub type CitationRecord = Provenance<u64>;
pub type AbstractRecord = Provenance<String>;
pub type UrlRecord = Provenance<String>;
pub type IdentifierRecord = Provenance<IdentifierObservation>;

/// One cross-reference identifier as observed at a source, e.g.
/// `{scheme: "doi", value: "10.1000/xyz"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierObservation {
    pub scheme: String,
    pub value: String,
}

impl IdentifierObservation {
    pub fn new(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
        }
    }
}

/// Scalar cross-reference identifiers. Every field is first-write-wins: once
/// set by any source it is never overwritten, even if a later source
/// disagrees. The setters report whether the write took so callers can log
/// conflicts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossIds {
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    /// Provider-native identifiers keyed by scheme (e.g. "semantic_scholar").
    #[serde(default)]
    pub native: BTreeMap<String, String>,
}

impl CrossIds {
    pub fn set_doi(&mut self, value: &str) -> bool {
        set_once(&mut self.doi, value)
    }

    pub fn set_arxiv(&mut self, value: &str) -> bool {
        set_once(&mut self.arxiv_id, value)
    }

    pub fn set_native(&mut self, scheme: &str, value: &str) -> bool {
        let trimmed = value.trim();
        if trimmed.is_empty() || self.native.contains_key(scheme) {
            return false;
        }
        self.native.insert(scheme.to_string(), trimmed.to_string());
        true
    }

    /// Dispatch an observation to the matching scalar field.
    pub fn observe(&mut self, observation: &IdentifierObservation) -> bool {
        match observation.scheme.as_str() {
            "doi" => self.set_doi(&observation.value),
            "arxiv" => self.set_arxiv(&observation.value),
            scheme => self.set_native(scheme, &observation.value),
        }
    }

    pub fn has_any(&self) -> bool {
        self.doi.is_some() || self.arxiv_id.is_some() || !self.native.is_empty()
    }
}

fn set_once(slot: &mut Option<String>, value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || slot.is_some() {
        return false;
    }
    *slot = Some(trimmed.to_string());
    true
}

/// The unit of consolidation. Owned exclusively by the merge engine during a
/// run; read-only to everything downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: PaperId,
    pub title: String,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    #[serde(default)]
    pub ids: CrossIds,
    #[serde(default)]
    pub citations: Vec<CitationRecord>,
    #[serde(default)]
    pub abstracts: Vec<AbstractRecord>,
    #[serde(default)]
    pub urls: Vec<UrlRecord>,
    #[serde(default)]
    pub identifier_history: Vec<IdentifierRecord>,
}

impl Paper {
    /// A stub record as supplied by the upstream collection stage.
    pub fn stub(
        id: impl Into<PaperId>,
        title: impl Into<String>,
        authors: Vec<String>,
        venue: Option<String>,
        year: Option<i32>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            authors,
            venue,
            year,
            ids: CrossIds::default(),
            citations: Vec::new(),
            abstracts: Vec::new(),
            urls: Vec::new(),
            identifier_history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, connection reset, 5xx, rate-limit exhaustion. Eligible for
    /// retry on a future run.
    Transient,
    /// 404/403/401 or a response that failed validation. Skipped on resume
    /// even when a retry of failures is requested.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FragmentFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// Per-paper output of one enrichment worker for one source. Immutable;
/// consumed exactly once by the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentFragment {
    pub paper_id: PaperId,
    pub source: String,
    #[serde(default)]
    pub citations: Vec<CitationRecord>,
    #[serde(default)]
    pub abstracts: Vec<AbstractRecord>,
    #[serde(default)]
    pub urls: Vec<UrlRecord>,
    #[serde(default)]
    pub identifiers: Vec<IdentifierRecord>,
    pub error: Option<FragmentFailure>,
}

impl EnrichmentFragment {
    pub fn new(paper_id: PaperId, source: impl Into<String>) -> Self {
        Self {
            paper_id,
            source: source.into(),
            citations: Vec::new(),
            abstracts: Vec::new(),
            urls: Vec::new(),
            identifiers: Vec::new(),
            error: None,
        }
    }

    pub fn failed(paper_id: PaperId, source: impl Into<String>, failure: FragmentFailure) -> Self {
        let mut fragment = Self::new(paper_id, source);
        fragment.error = Some(failure);
        fragment
    }

    /// True when the fragment carries no provenance records at all.
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
            && self.abstracts.is_empty()
            && self.urls.is_empty()
            && self.identifiers.is_empty()
    }
}
