use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};

use paperfuse_core::{IdentifierObservation, Paper};

use crate::error::{EngineError, Result};
use crate::http::RateLimitedClient;
use crate::sources::{SourceClient, SourceFields, SourceHit};

const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const BATCH_SIZE: usize = 500;
const BATCH_FIELDS: &str = "paperId,externalIds,title,abstract,year,authors,citationCount,openAccessPdf";
const SEARCH_FIELDS: &str = "paperId,externalIds,title,abstract,year,authors,citationCount,openAccessPdf";
const SEARCH_LIMIT: u32 = 10;
const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// Semantic Scholar Graph API client. The fast, high-coverage provider; also
/// used by the identifier harvester.
pub struct SemanticScholarClient {
    client: RateLimitedClient,
    api_key: Option<String>,
    base_url: String,
}

impl SemanticScholarClient {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        // Keyed access allows a much tighter request cadence.
        let min_interval = if api_key.as_deref().is_some_and(|k| !k.trim().is_empty()) {
            Duration::from_millis(100)
        } else {
            Duration::from_secs(1)
        };
        Self::with_config(BASE_URL.to_string(), api_key, min_interval)
    }

    fn with_config(
        base_url: String,
        api_key: Option<String>,
        min_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: RateLimitedClient::new(
                "semantic_scholar",
                min_interval,
                2,
                3,
                "paperfuse-engine/0.1",
            )?,
            api_key,
            base_url,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(base_url: String) -> Self {
        Self::with_config(base_url, None, Duration::from_millis(1)).unwrap()
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(key) = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let value = HeaderValue::from_str(key).map_err(|e| EngineError::Parse(e.to_string()))?;
            headers.insert(API_KEY_HEADER, value);
        }
        Ok(headers)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| EngineError::Parse(format!("invalid Semantic Scholar base URL: {e}")))?;
        {
            let mut segs = url.path_segments_mut().map_err(|_| {
                EngineError::Parse("invalid Semantic Scholar base URL".to_string())
            })?;
            for segment in segments {
                segs.push(segment);
            }
        }
        Ok(url)
    }
}

/// Parse one batch/search entry. `None` for null entries, which the batch
/// endpoint emits for unresolved ids.
fn hit_from_json(v: &Value) -> Option<SourceHit> {
    let paper_id = v.get("paperId").and_then(Value::as_str)?;

    let title = v
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let authors = v
        .get("authors")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|author| author.get("name").and_then(Value::as_str))
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let year = v
        .get("year")
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok());

    let mut fields = SourceFields {
        citation_count: v.get("citationCount").and_then(Value::as_u64),
        abstract_text: v
            .get("abstract")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned),
        ..SourceFields::default()
    };

    fields
        .identifiers
        .push(IdentifierObservation::new("semantic_scholar", paper_id));
    if let Some(ids) = v.get("externalIds").and_then(Value::as_object) {
        if let Some(doi) = ids.get("DOI").and_then(Value::as_str) {
            fields.identifiers.push(IdentifierObservation::new("doi", doi));
        }
        if let Some(arxiv) = ids.get("ArXiv").and_then(Value::as_str) {
            fields
                .identifiers
                .push(IdentifierObservation::new("arxiv", arxiv));
        }
    }

    if let Some(url) = v
        .get("openAccessPdf")
        .and_then(|pdf| pdf.get("url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        fields.urls.push(url.to_string());
    }

    Some(SourceHit {
        title,
        authors,
        year,
        fields,
    })
}

#[async_trait]
impl SourceClient for SemanticScholarClient {
    fn name(&self) -> &'static str {
        "semantic_scholar"
    }

    fn batch_size(&self) -> usize {
        BATCH_SIZE
    }

    fn key_for(&self, paper: &Paper) -> Option<String> {
        if let Some(doi) = &paper.ids.doi {
            return Some(format!("DOI:{doi}"));
        }
        if let Some(arxiv) = &paper.ids.arxiv_id {
            return Some(format!("ArXiv:{arxiv}"));
        }
        paper.ids.native.get("semantic_scholar").cloned()
    }

    async fn lookup_batch(&self, keys: &[String]) -> Result<Vec<Option<SourceHit>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut url = self.endpoint(&["paper", "batch"])?;
        url.query_pairs_mut().append_pair("fields", BATCH_FIELDS);
        let body = json!({ "ids": keys });

        let response: Value = self
            .client
            .post_json_with_headers(url.as_str(), &body, self.auth_headers()?)
            .await?;

        let items = response
            .as_array()
            .or_else(|| response.get("data").and_then(Value::as_array))
            .ok_or_else(|| {
                EngineError::Parse("unexpected Semantic Scholar batch response".to_string())
            })?;
        if items.len() != keys.len() {
            return Err(EngineError::Parse(format!(
                "Semantic Scholar batch returned {} entries for {} ids",
                items.len(),
                keys.len()
            )));
        }

        Ok(items.iter().map(hit_from_json).collect())
    }

    async fn search_title(&self, title: &str) -> Result<Vec<SourceHit>> {
        let mut url = self.endpoint(&["paper", "search"])?;
        url.query_pairs_mut()
            .append_pair("query", title)
            .append_pair("limit", &SEARCH_LIMIT.to_string())
            .append_pair("fields", SEARCH_FIELDS);

        let body = self
            .client
            .get_with_headers(url.as_str(), self.auth_headers()?)
            .await?;
        let json: Value =
            serde_json::from_str(&body).map_err(|e| EngineError::Parse(e.to_string()))?;

        Ok(json
            .get("data")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(hit_from_json).collect())
            .unwrap_or_default())
    }
}
