use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::debug;

use crate::error::{EngineError, Result};

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Per-provider HTTP client enforcing a minimum inter-request interval and a
/// cap on concurrent in-flight requests. 429 and 5xx responses are retried
/// with backoff up to `max_retries`; other 4xx responses surface immediately
/// as non-retryable API errors.
pub struct RateLimitedClient {
    client: reqwest::Client,
    provider: String,
    min_interval: Duration,
    last_request: Arc<Mutex<Option<Instant>>>,
    in_flight: Arc<Semaphore>,
    max_retries: u32,
}

impl RateLimitedClient {
    pub fn new(
        provider: impl Into<String>,
        min_interval: Duration,
        max_in_flight: usize,
        max_retries: u32,
        user_agent: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            provider: provider.into(),
            min_interval,
            last_request: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
            max_retries,
        })
    }

    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(t) = *last {
            let elapsed = t.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let text = self.get_with_headers(url, HeaderMap::new()).await?;
        serde_json::from_str(&text).map_err(|e| EngineError::Parse(e.to_string()))
    }

    pub async fn get_with_headers(&self, url: &str, headers: HeaderMap) -> Result<String> {
        self.execute(|| self.client.get(url).headers(headers.clone()).send())
            .await
    }

    pub async fn post_json_with_headers<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        headers: HeaderMap,
    ) -> Result<R> {
        let text = self
            .execute(|| {
                self.client
                    .post(url)
                    .headers(headers.clone())
                    .json(body)
                    .send()
            })
            .await?;
        serde_json::from_str(&text).map_err(|e| EngineError::Parse(e.to_string()))
    }

    async fn execute<F, Fut>(&self, send: F) -> Result<String>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        // Holding a permit for the whole attempt loop keeps retries from
        // multiplying the in-flight count.
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| EngineError::RetriesExhausted {
                provider: self.provider.clone(),
                attempts: 0,
            })?;

        let mut attempt = 0u32;
        loop {
            self.wait_for_rate_limit().await;
            match send().await {
                Ok(r) if r.status() == 429 => {
                    if attempt >= self.max_retries {
                        return Err(EngineError::RateLimited {
                            provider: self.provider.clone(),
                            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
                        });
                    }
                    let wait = r
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                    debug!(provider = %self.provider, wait_secs = wait, "rate limited, backing off");
                    sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Ok(r) if r.status().is_server_error() => {
                    if attempt >= self.max_retries {
                        return Err(EngineError::RetriesExhausted {
                            provider: self.provider.clone(),
                            attempts: attempt + 1,
                        });
                    }
                    sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    attempt += 1;
                }
                Ok(r) if !r.status().is_success() => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    return Err(EngineError::Api {
                        provider: self.provider.clone(),
                        status,
                        body,
                    });
                }
                Ok(r) => return r.text().await.map_err(EngineError::Http),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(EngineError::Http(e));
                    }
                    sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }
}
