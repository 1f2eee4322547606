//! Model identity parsing and the model-metadata cache interface.
//!
//! Model names encode a family variant, a version and sometimes a release date, in two
//! different orders depending on the generation. [`ModelIdentity::parse`] tries a fixed list
//! of patterns, most specific first, and takes the first match.

use crate::llm::models::Provider;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};
use tracing::{debug, warn};

/// Where each capture lands in a pattern.
#[derive(Debug, Clone, Copy)]
struct Layout {
    variant: usize,
    major: usize,
    minor: Option<usize>,
    date: Option<usize>,
}

static MODEL_PATTERNS: LazyLock<Vec<(Regex, Layout)>> = LazyLock::new(|| {
    let table: [(&str, Layout); 5] = [
        // claude-3-5-haiku-20241022
        (
            r"^claude-(\d+)-(\d+)-([a-z]+)-(\d{8})$",
            Layout { variant: 3, major: 1, minor: Some(2), date: Some(4) },
        ),
        // claude-3-haiku-20240307
        (
            r"^claude-(\d+)-([a-z]+)-(\d{8})$",
            Layout { variant: 2, major: 1, minor: None, date: Some(3) },
        ),
        // claude-haiku-4-5-20251001
        (
            r"^claude-([a-z]+)-(\d+)-(\d+)-(\d{8})$",
            Layout { variant: 1, major: 2, minor: Some(3), date: Some(4) },
        ),
        // claude-opus-4-20250514
        (
            r"^claude-([a-z]+)-(\d+)-(\d{8})$",
            Layout { variant: 1, major: 2, minor: None, date: Some(3) },
        ),
        // claude-opus-4-6
        (
            r"^claude-([a-z]+)-(\d+)-(\d+)$",
            Layout { variant: 1, major: 2, minor: Some(3), date: None },
        ),
    ];

    table
        .into_iter()
        .filter_map(|(pattern, layout)| match Regex::new(pattern) {
            Ok(regex) => Some((regex, layout)),
            Err(e) => {
                warn!(pattern = pattern, error = %e, "Invalid model pattern");
                None
            }
        })
        .collect()
});

/// `{variant, version, date}` extracted from a model name. Unmatched names are all empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub variant: String,
    /// Dotted version, e.g. `3.5` or `4`.
    pub version: String,
    /// `YYYYMMDD`, empty for undated aliases.
    pub date: String,
}

impl ModelIdentity {
    pub fn parse(model_id: &str) -> Self {
        for (regex, layout) in MODEL_PATTERNS.iter() {
            let Some(captures) = regex.captures(model_id) else {
                continue;
            };
            let group = |index: usize| captures.get(index).map(|m| m.as_str()).unwrap_or_default();

            let version = match layout.minor {
                Some(minor) => format!("{}.{}", group(layout.major), group(minor)),
                None => group(layout.major).to_string(),
            };
            return Self {
                variant: group(layout.variant).to_string(),
                version,
                date: layout.date.map(group).unwrap_or_default().to_string(),
            };
        }
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.variant.is_empty() && self.version.is_empty() && self.date.is_empty()
    }
}

/// Guess the vendor from a model name prefix. Anything unrecognized is assumed local.
pub fn infer_provider(model_id: &str) -> Provider {
    let id = model_id.to_ascii_lowercase();
    if id.starts_with("claude-") {
        Provider::Anthropic
    } else if id.starts_with("gemini-") {
        Provider::Gemini
    } else if ["gpt-", "chatgpt-", "o1", "o3", "o4"]
        .iter()
        .any(|prefix| id.starts_with(prefix))
    {
        Provider::OpenAI
    } else {
        Provider::Ollama
    }
}

/// Cached metadata about one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub provider: Provider,
    pub identity: ModelIdentity,
    pub context_window: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub fetched_at: DateTime<Utc>,
}

impl ModelInfo {
    /// Metadata derivable from the name alone.
    pub fn from_id(model_id: &str, fetched_at: DateTime<Utc>) -> Self {
        Self {
            model_id: model_id.to_string(),
            provider: infer_provider(model_id),
            identity: ModelIdentity::parse(model_id),
            context_window: None,
            max_output_tokens: None,
            fetched_at,
        }
    }

    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) < ttl
    }
}

/// Store of model metadata keyed by model id. Expiry is decided by the reader.
pub trait ModelMetadataCache: Send + Sync {
    fn get(&self, model_id: &str) -> Option<ModelInfo>;
    fn put(&self, info: ModelInfo);
}

#[derive(Debug, Default)]
pub struct InMemoryModelCache {
    entries: RwLock<HashMap<String, ModelInfo>>,
}

impl InMemoryModelCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelMetadataCache for InMemoryModelCache {
    fn get(&self, model_id: &str) -> Option<ModelInfo> {
        self.entries.read().ok()?.get(model_id).cloned()
    }

    fn put(&self, info: ModelInfo) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(info.model_id.clone(), info);
            }
            Err(_) => warn!("Model cache lock poisoned; entry not stored"),
        }
    }
}

/// Look a model up, refreshing it from its name when missing or older than `ttl`.
pub fn resolve_model(cache: &dyn ModelMetadataCache, model_id: &str, ttl: Duration) -> ModelInfo {
    resolve_model_at(cache, model_id, ttl, Utc::now())
}

pub fn resolve_model_at(
    cache: &dyn ModelMetadataCache,
    model_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> ModelInfo {
    if let Some(info) = cache.get(model_id) {
        if info.is_fresh(ttl, now) {
            return info;
        }
        debug!(model = model_id, fetched_at = %info.fetched_at, "Cached model metadata expired");
    }

    let info = ModelInfo::from_id(model_id, now);
    cache.put(info.clone());
    info
}
