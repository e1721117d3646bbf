use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::{TokenSourceConfig, DEFAULT_TOKEN_FETCH_TIMEOUT, DEFAULT_TOKEN_TTL};
use crate::pool::{Endpoint, ModelPools, DEFAULT_REGION};
use crate::retry::RetryPolicy;
use crate::transform::{TransformKind, TransformRegistry, MAX_INLINE_IMAGE_BYTES};

pub const DEFAULT_PROJECT_ID: &str = "vertex-ai-project";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub project_id: String,
    pub model_pools_file: Option<PathBuf>,
    pub max_request_bytes: usize,
    pub upstream_connect_timeout: Duration,
    pub upstream_timeout: Duration,
    pub upstream_first_byte_timeout: Duration,
    pub token_ttl: Duration,
    pub token_fetch_timeout: Duration,
    pub token_source: TokenSourceConfig,
    pub retry: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            project_id: DEFAULT_PROJECT_ID.to_string(),
            model_pools_file: None,
            max_request_bytes: 64 * 1024 * 1024,
            upstream_connect_timeout: Duration::from_millis(10_000),
            upstream_timeout: Duration::from_secs(600),
            upstream_first_byte_timeout: Duration::from_secs(600),
            token_ttl: DEFAULT_TOKEN_TTL,
            token_fetch_timeout: DEFAULT_TOKEN_FETCH_TIMEOUT,
            token_source: TokenSourceConfig::MetadataServer,
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        if (self.max_request_bytes as u64) <= MAX_INLINE_IMAGE_BYTES {
            return Err(ConfigError::RequestLimitTooSmall(self.max_request_bytes));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read model pool file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model pool table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("model {model}: endpoint weight must be positive")]
    ZeroWeight { model: String },

    #[error("model {model}: endpoint needs either a url or a region")]
    MissingUrl { model: String },

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("max request size {0} bytes cannot carry a maximum-size inline image")]
    RequestLimitTooSmall(usize),
}

/// Loaded routing configuration: endpoint pools plus per-model transforms.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    pub pools: ModelPools,
    pub transforms: TransformRegistry,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelEntry {
    Detailed {
        endpoints: OneOrMany,
        #[serde(default)]
        transform: TransformKind,
    },
    Endpoints(OneOrMany),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(EndpointEntry),
    Many(Vec<EndpointEntry>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<EndpointEntry> {
        match self {
            Self::One(entry) => vec![entry],
            Self::Many(entries) => entries,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    #[serde(alias = "upstream_model_id")]
    model: String,
    region: Option<String>,
    url: Option<String>,
    weight: Option<u32>,
}

impl RoutingTable {
    pub fn load(config: &AppConfig) -> Result<Self, ConfigError> {
        match &config.model_pools_file {
            Some(path) => Self::from_file(path, &config.project_id),
            None => Ok(Self::builtin(&config.project_id)),
        }
    }

    pub fn from_file(path: &Path, project_id: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw, project_id)
    }

    pub fn from_json(raw: &str, project_id: &str) -> Result<Self, ConfigError> {
        let entries: HashMap<String, ModelEntry> = serde_json::from_str(raw)?;

        let mut table = Self::default();
        for (model, entry) in entries {
            let (endpoints, transform) = match entry {
                ModelEntry::Detailed {
                    endpoints,
                    transform,
                } => (endpoints.into_vec(), transform),
                ModelEntry::Endpoints(endpoints) => (endpoints.into_vec(), TransformKind::Identity),
            };

            let endpoints = endpoints
                .into_iter()
                .map(|entry| build_endpoint(&model, entry, project_id))
                .collect::<Result<Vec<_>, _>>()?;
            if endpoints.is_empty() {
                tracing::warn!(%model, "model has an empty endpoint pool; requests will fail");
            }

            if transform != TransformKind::Identity {
                table.transforms.register(model.clone(), transform.build());
            }
            table.pools.insert(model, endpoints);
        }
        Ok(table)
    }

    /// The Model Garden MaaS models served when no pool file is configured.
    pub fn builtin(project_id: &str) -> Self {
        const MODELS: &[(&str, &str, &str)] = &[
            ("deepseek-r1", "us-central1", "deepseek-ai/deepseek-r1-0528-maas"),
            ("deepseek-v3", "us-west2", "deepseek-ai/deepseek-v3.1-maas"),
            ("minimax-m2", "global", "minimaxai/minimax-m2-maas"),
            ("qwen3-235b", "us-south1", "qwen/qwen3-235b-a22b-instruct-2507-maas"),
            ("llama-3.3-70b", "us-central1", "meta/llama-3.3-70b-instruct-maas"),
            ("qwen3-thinking", "global", "qwen/qwen3-next-80b-a3b-thinking-maas"),
            ("llama-4-maverick", "us-east5", "meta/llama-4-maverick-17b-128e-instruct-maas"),
            ("llama-4-scout", "us-east5", "meta/llama-4-scout-17b-16e-instruct-maas"),
        ];

        let mut table = Self::default();
        for (model, region, upstream) in MODELS {
            let endpoint = Endpoint::new(vertex_chat_completions_url(project_id, region), *upstream)
                .with_region(*region);
            table.pools.insert(*model, vec![endpoint]);
        }
        table
    }
}

fn build_endpoint(model: &str, entry: EndpointEntry, project_id: &str) -> Result<Endpoint, ConfigError> {
    let weight = entry.weight.unwrap_or(1);
    if weight == 0 {
        return Err(ConfigError::ZeroWeight {
            model: model.to_string(),
        });
    }

    let url = match (entry.url, entry.region.as_deref()) {
        (Some(url), _) => url,
        (None, Some(region)) => vertex_chat_completions_url(project_id, region),
        (None, None) => {
            return Err(ConfigError::MissingUrl {
                model: model.to_string(),
            });
        }
    };

    Ok(Endpoint::new(url, entry.model)
        .with_region(entry.region.unwrap_or_else(|| DEFAULT_REGION.to_string()))
        .with_weight(weight))
}

/// OpenAI-compatible chat endpoint for `region` in `project_id`.
pub fn vertex_chat_completions_url(project_id: &str, region: &str) -> String {
    let host = if region == "global" {
        "aiplatform.googleapis.com".to_string()
    } else {
        format!("{region}-aiplatform.googleapis.com")
    };
    format!(
        "https://{host}/v1/projects/{project_id}/locations/{region}/endpoints/openapi/chat/completions"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regional_and_global_urls() {
        assert_eq!(
            vertex_chat_completions_url("proj", "us-east5"),
            "https://us-east5-aiplatform.googleapis.com/v1/projects/proj/locations/us-east5/endpoints/openapi/chat/completions"
        );
        assert_eq!(
            vertex_chat_completions_url("proj", "global"),
            "https://aiplatform.googleapis.com/v1/projects/proj/locations/global/endpoints/openapi/chat/completions"
        );
    }

    #[test]
    fn builtin_table_serves_one_endpoint_per_model() {
        let table = RoutingTable::builtin("proj");
        assert_eq!(table.pools.len(), 8);

        let pool = table.pools.resolve("llama-4-scout").unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].region, "us-east5");
        assert_eq!(pool[0].upstream_model_id, "meta/llama-4-scout-17b-16e-instruct-maas");
        assert_eq!(pool[0].weight, 1);
        assert!(pool[0].url.contains("/projects/proj/"));
    }

    #[test]
    fn single_endpoint_is_normalized_to_a_pool() {
        let table = RoutingTable::from_json(
            r#"{"deepseek-r1": {"model": "deepseek-ai/deepseek-r1-0528-maas", "region": "us-central1"}}"#,
            "proj",
        )
        .unwrap();

        let pool = table.pools.resolve("deepseek-r1").unwrap();
        assert_eq!(
            pool,
            &[Endpoint::new(
                vertex_chat_completions_url("proj", "us-central1"),
                "deepseek-ai/deepseek-r1-0528-maas"
            )
            .with_region("us-central1")]
        );
        assert_eq!(table.transforms.for_model("deepseek-r1").name(), "identity");
    }

    #[test]
    fn weighted_pool_with_explicit_urls() {
        let table = RoutingTable::from_json(
            r#"{
                "qwen3-235b": [
                    {"model": "qwen/a", "region": "us-south1", "weight": 70},
                    {"model": "qwen/a", "url": "https://mirror.example/chat/completions", "weight": 30}
                ]
            }"#,
            "proj",
        )
        .unwrap();

        let pool = table.pools.resolve("qwen3-235b").unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].weight, 70);
        assert_eq!(pool[1].url, "https://mirror.example/chat/completions");
        assert_eq!(pool[1].region, DEFAULT_REGION);
    }

    #[test]
    fn detailed_entry_registers_transform() {
        let table = RoutingTable::from_json(
            r#"{
                "vision": {
                    "endpoints": {"upstream_model_id": "vendor/vision-maas", "region": "global"},
                    "transform": "image-only"
                },
                "empty": []
            }"#,
            "proj",
        )
        .unwrap();

        assert_eq!(table.transforms.for_model("vision").name(), "image-only");
        assert_eq!(table.pools.resolve("vision").unwrap().len(), 1);
        assert!(table.pools.resolve("empty").unwrap().is_empty());
    }

    #[test]
    fn zero_weight_and_missing_location_are_rejected() {
        let err = RoutingTable::from_json(r#"{"m": {"model": "x", "region": "r", "weight": 0}}"#, "p")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroWeight { model } if model == "m"));

        let err = RoutingTable::from_json(r#"{"m": {"model": "x"}}"#, "p").unwrap_err();
        assert!(matches!(err, ConfigError::MissingUrl { model } if model == "m"));

        let err = RoutingTable::from_json(r#"{"m": 5}"#, "p").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().unwrap();

        let mut cfg = AppConfig::default();
        cfg.max_request_bytes = 1024;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::RequestLimitTooSmall(1024))
        ));
    }
}
