use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_CHECKPOINT_SECS: u64 = 300;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Run configuration handed to the orchestrator. Plain data; no global
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Directory holding sessions, checkpoints, and the final output.
    pub session_root: PathBuf,
    /// Resume the most recent session matching the input fingerprint instead
    /// of starting fresh.
    pub resume: bool,
    /// Wall-clock interval between periodic checkpoints.
    #[serde(with = "duration_secs")]
    pub checkpoint_interval: Duration,
    /// Restrict the run to a single named source.
    pub single_source: Option<String>,
    /// Contact address forwarded to providers with a polite pool.
    pub polite_email: Option<String>,
    pub semantic_scholar_api_key: Option<String>,
    /// Bound of the fragment fan-in channel.
    pub channel_capacity: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            session_root: PathBuf::from("paperfuse-sessions"),
            resume: false,
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_SECS),
            single_source: None,
            polite_email: None,
            semantic_scholar_api_key: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ConsolidationConfig {
    /// Defaults overridden by environment variables where set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("PAPERFUSE_SESSION_ROOT") {
            config.session_root = PathBuf::from(root);
        }
        if let Ok(resume) = std::env::var("PAPERFUSE_RESUME") {
            config.resume = matches!(resume.trim(), "1" | "true" | "yes");
        }
        if let Some(secs) = std::env::var("PAPERFUSE_CHECKPOINT_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            config.checkpoint_interval = Duration::from_secs(secs);
        }
        config.single_source = non_empty(std::env::var("PAPERFUSE_SINGLE_SOURCE").ok());
        config.polite_email = non_empty(std::env::var("PAPERFUSE_POLITE_EMAIL").ok());
        config.semantic_scholar_api_key =
            non_empty(std::env::var("SEMANTIC_SCHOLAR_API_KEY").ok());
        config
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
