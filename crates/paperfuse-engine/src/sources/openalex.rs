use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use paperfuse_core::{IdentifierObservation, Paper};

use crate::error::{EngineError, Result};
use crate::http::RateLimitedClient;
use crate::sources::{SourceClient, SourceFields, SourceHit};

const BASE_URL: &str = "https://api.openalex.org";
const BATCH_SIZE: usize = 50;
const SEARCH_LIMIT: u32 = 10;
const DOI_URL_PREFIX: &str = "https://doi.org/";
const WORK_URL_PREFIX: &str = "https://openalex.org/";

/// OpenAlex works API client. Batch lookup goes through the `filter=doi:`
/// endpoint, so only DOI-bearing papers are batchable; everything else falls
/// back to title search.
pub struct OpenAlexClient {
    client: RateLimitedClient,
    base_url: String,
    /// Contact address for the polite pool; appended as `mailto`.
    mailto: Option<String>,
}

impl OpenAlexClient {
    pub fn new(mailto: Option<String>) -> Result<Self> {
        Self::with_config(BASE_URL.to_string(), mailto, Duration::from_millis(100))
    }

    fn with_config(
        base_url: String,
        mailto: Option<String>,
        min_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: RateLimitedClient::new(
                "openalex",
                min_interval,
                2,
                3,
                "paperfuse-engine/0.1",
            )?,
            base_url,
            mailto: mailto
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(base_url: String) -> Self {
        Self::with_config(base_url, None, Duration::from_millis(1)).unwrap()
    }

    fn works_endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| EngineError::Parse(format!("invalid OpenAlex base URL: {e}")))?;
        {
            let mut segs = url
                .path_segments_mut()
                .map_err(|_| EngineError::Parse("invalid OpenAlex base URL".to_string()))?;
            segs.push("works");
        }
        if let Some(mailto) = &self.mailto {
            url.query_pairs_mut().append_pair("mailto", mailto);
        }
        Ok(url)
    }
}

fn normalize_doi(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .trim_start_matches(DOI_URL_PREFIX)
        .to_string()
}

/// Rebuild the abstract text from OpenAlex's inverted index representation.
fn reconstruct_abstract(index: &HashMap<String, Vec<u32>>) -> Option<String> {
    let max_position = index
        .values()
        .flat_map(|positions| positions.iter())
        .max()
        .copied()? as usize;

    let mut slots = vec![""; max_position + 1];
    for (word, positions) in index {
        for &pos in positions {
            let idx = pos as usize;
            if idx < slots.len() {
                slots[idx] = word;
            }
        }
    }

    let text = slots
        .into_iter()
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() { None } else { Some(text) }
}

fn parse_inverted_index(v: &Value) -> Option<HashMap<String, Vec<u32>>> {
    v.get("abstract_inverted_index")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(token, positions)| {
                    let values = positions
                        .as_array()?
                        .iter()
                        .filter_map(Value::as_u64)
                        .filter_map(|n| u32::try_from(n).ok())
                        .collect::<Vec<_>>();
                    if values.is_empty() {
                        None
                    } else {
                        Some((token.clone(), values))
                    }
                })
                .collect()
        })
}

fn hit_from_work(v: &Value) -> Option<SourceHit> {
    let work_id = v.get("id").and_then(Value::as_str)?;

    let title = v
        .get("title")
        .or_else(|| v.get("display_name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let authors = v
        .get("authorships")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|a| {
                    a.get("author")
                        .and_then(|author| author.get("display_name"))
                        .and_then(Value::as_str)
                })
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let year = v
        .get("publication_year")
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok());

    let mut fields = SourceFields {
        citation_count: v.get("cited_by_count").and_then(Value::as_u64),
        abstract_text: parse_inverted_index(v)
            .as_ref()
            .and_then(reconstruct_abstract),
        ..SourceFields::default()
    };

    fields.identifiers.push(IdentifierObservation::new(
        "openalex",
        work_id.trim_start_matches(WORK_URL_PREFIX),
    ));
    if let Some(doi) = v.get("doi").and_then(Value::as_str) {
        fields
            .identifiers
            .push(IdentifierObservation::new("doi", normalize_doi(doi)));
    }

    if let Some(url) = v
        .get("open_access")
        .and_then(|oa| oa.get("oa_url"))
        .and_then(Value::as_str)
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

fn work_doi(v: &Value) -> Option<String> {
    v.get("doi").and_then(Value::as_str).map(normalize_doi)
}

#[async_trait]
impl SourceClient for OpenAlexClient {
    fn name(&self) -> &'static str {
        "openalex"
    }

    fn batch_size(&self) -> usize {
        BATCH_SIZE
    }

    fn key_for(&self, paper: &Paper) -> Option<String> {
        paper.ids.doi.as_deref().map(normalize_doi)
    }

    async fn lookup_batch(&self, keys: &[String]) -> Result<Vec<Option<SourceHit>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut url = self.works_endpoint()?;
        url.query_pairs_mut()
            .append_pair("filter", &format!("doi:{}", keys.join("|")))
            .append_pair("per-page", &keys.len().to_string());

        let response: Value = self.client.get_json(url.as_str()).await?;
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Parse("unexpected OpenAlex response".to_string()))?;

        // The filter endpoint returns matches in arbitrary order; realign by
        // DOI.
        let mut by_doi: HashMap<String, SourceHit> = HashMap::new();
        for work in results {
            if let (Some(doi), Some(hit)) = (work_doi(work), hit_from_work(work)) {
                by_doi.insert(doi, hit);
            }
        }
        Ok(keys.iter().map(|key| by_doi.remove(key)).collect())
    }

    async fn search_title(&self, title: &str) -> Result<Vec<SourceHit>> {
        let mut url = self.works_endpoint()?;
        url.query_pairs_mut()
            .append_pair("search", title)
            .append_pair("per-page", &SEARCH_LIMIT.to_string());

        let response: Value = self.client.get_json(url.as_str()).await?;
        Ok(response
            .get("results")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(hit_from_work).collect())
            .unwrap_or_default())
    }
}
