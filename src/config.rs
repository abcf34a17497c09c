// src/config.rs
// File-based configuration from ~/.agenr/config.json (spec.md §6).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Per-role model overrides (spec.md §6 `models`).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ModelOverrides {
    pub extraction: Option<String>,
    #[serde(rename = "claimExtraction")]
    pub claim_extraction: Option<String>,
    #[serde(rename = "contradictionJudge")]
    pub contradiction_judge: Option<String>,
    #[serde(rename = "handoffSummary")]
    pub handoff_summary: Option<String>,
}

/// Embedding provider configuration (spec.md §6 `embedding`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: u32,
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1024,
            api_key: None,
        }
    }
}

/// Database location (spec.md §6 `db`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub path: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

/// Consolidation/forgetting thresholds (spec.md §6 `forgetting`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForgettingConfig {
    #[serde(default)]
    pub protect: Vec<String>,
    #[serde(rename = "scoreThreshold", default = "ForgettingConfig::default_score_threshold")]
    pub score_threshold: f32,
    #[serde(rename = "maxAgeDays", default = "ForgettingConfig::default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default = "ForgettingConfig::default_enabled")]
    pub enabled: bool,
}

impl ForgettingConfig {
    fn default_score_threshold() -> f32 {
        0.2
    }
    fn default_max_age_days() -> u32 {
        180
    }
    fn default_enabled() -> bool {
        true
    }
}

impl Default for ForgettingConfig {
    fn default() -> Self {
        Self {
            protect: Vec::new(),
            score_threshold: Self::default_score_threshold(),
            max_age_days: Self::default_max_age_days(),
            enabled: Self::default_enabled(),
        }
    }
}

/// Consolidator phase-2 clustering thresholds (spec.md §4.H). Not named as
/// a top-level object in spec.md §6, but it is the same shape of "tunable
/// threshold bag" as `ForgettingConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsolidationConfig {
    #[serde(rename = "clusterSimilarityThreshold", default = "ConsolidationConfig::default_cluster_similarity_threshold")]
    pub cluster_similarity_threshold: f32,
    #[serde(rename = "minClusterSize", default = "ConsolidationConfig::default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(rename = "maxClusterSize", default = "ConsolidationConfig::default_max_cluster_size")]
    pub max_cluster_size: usize,
    #[serde(rename = "idempotencyDays", default = "ConsolidationConfig::default_idempotency_days")]
    pub idempotency_days: i64,
    #[serde(rename = "nearDuplicateThreshold", default = "ConsolidationConfig::default_near_duplicate_threshold")]
    pub near_duplicate_threshold: f64,
}

impl ConsolidationConfig {
    fn default_cluster_similarity_threshold() -> f32 {
        0.85
    }
    fn default_min_cluster_size() -> usize {
        3
    }
    fn default_max_cluster_size() -> usize {
        12
    }
    fn default_idempotency_days() -> i64 {
        7
    }
    fn default_near_duplicate_threshold() -> f64 {
        0.95
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            cluster_similarity_threshold: Self::default_cluster_similarity_threshold(),
            min_cluster_size: Self::default_min_cluster_size(),
            max_cluster_size: Self::default_max_cluster_size(),
            idempotency_days: Self::default_idempotency_days(),
            near_duplicate_threshold: Self::default_near_duplicate_threshold(),
        }
    }
}

/// Top-level config structure (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    pub auth: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub models: ModelOverrides,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub forgetting: ForgettingConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(rename = "labelProjectMap", default)]
    pub label_project_map: HashMap<String, String>,
    #[serde(default)]
    pub projects: Vec<String>,
}

impl Config {
    /// Load config from `~/.agenr/config.json`. Never panics: a missing file
    /// yields defaults, a malformed one logs and falls back to defaults
    /// (spec.md §7 `CorruptState` is logged, not raised, for this path).
    pub fn load() -> Self {
        let path = Self::config_path();

        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse config file, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Persist this config to `~/.agenr/config.json` with mode 0600.
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        Self::state_dir().join("config.json")
    }

    /// `~/.agenr` — the root of all agenr state (db, logs, config, env).
    pub fn state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| {
                warn!("HOME directory not set — using current directory for agenr state. Consider setting $HOME.");
                PathBuf::from(".")
            })
            .join(".agenr")
    }

    /// Resolved database path: `db.path` if set, else `~/.agenr/agenr.db`.
    pub fn db_path(&self) -> PathBuf {
        match &self.db.path {
            Some(p) => PathBuf::from(p),
            None => Self::state_dir().join("agenr.db"),
        }
    }

    /// Project name for a given label, via `labelProjectMap`, falling back to
    /// the label itself when unmapped.
    pub fn project_for_label<'a>(&'a self, label: &'a str) -> &'a str {
        self.label_project_map
            .get(label)
            .map(|s| s.as_str())
            .unwrap_or(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_parses_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.forgetting.max_age_days, 180);
        assert!(config.forgetting.enabled);
    }

    #[test]
    fn parses_full_shape() {
        let json = r#"{
            "auth": "api-key",
            "provider": "openai",
            "model": "gpt-4o",
            "models": { "extraction": "gpt-4o-mini" },
            "credentials": { "openai": "sk-test" },
            "embedding": { "provider": "openai", "model": "text-embedding-3-small", "dimensions": 1536 },
            "db": { "path": "/tmp/agenr.db" },
            "forgetting": { "protect": ["core"], "scoreThreshold": 0.3, "maxAgeDays": 90, "enabled": false },
            "labelProjectMap": { "work": "acme-corp" },
            "projects": ["acme-corp"]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.models.extraction.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.embedding.dimensions, 1536);
        assert_eq!(config.db.path.as_deref(), Some("/tmp/agenr.db"));
        assert!(!config.forgetting.enabled);
        assert_eq!(config.project_for_label("work"), "acme-corp");
        assert_eq!(config.project_for_label("personal"), "personal");
    }

    #[test]
    fn malformed_json_does_not_panic() {
        let result: Result<Config, _> = serde_json::from_str("{ broken");
        assert!(result.is_err());
        let config = result.unwrap_or_default();
        assert_eq!(config.embedding.dimensions, 1024);
    }

    #[test]
    fn db_path_falls_back_to_state_dir() {
        let config = Config::default();
        assert!(config.db_path().ends_with("agenr.db"));
    }
}
