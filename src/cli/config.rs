// src/cli/config.rs
// `agenr config show` / `agenr config set` (spec.md §6): read/write
// ~/.agenr/config.json. Only a fixed set of dotted keys are settable,
// the same small surface the teacher's config subcommand exposes.

use crate::config::Config;
use crate::error::{AgenrError, Result};

pub fn show(config: &Config) -> Result<String> {
    Ok(serde_json::to_string_pretty(config)?)
}

/// Set one dotted key (`provider`, `model`, `db.path`,
/// `embedding.provider`, `embedding.model`, `forgetting.maxAgeDays`,
/// `forgetting.scoreThreshold`, `forgetting.enabled`) and persist.
pub fn set(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "provider" => config.provider = Some(value.to_string()),
        "model" => config.model = Some(value.to_string()),
        "auth" => config.auth = Some(value.to_string()),
        "db.path" => config.db.path = Some(value.to_string()),
        "embedding.provider" => config.embedding.provider = value.to_string(),
        "embedding.model" => config.embedding.model = value.to_string(),
        "forgetting.maxAgeDays" => {
            config.forgetting.max_age_days = value
                .parse()
                .map_err(|_| invalid(key, value))?;
        }
        "forgetting.scoreThreshold" => {
            config.forgetting.score_threshold = value
                .parse()
                .map_err(|_| invalid(key, value))?;
        }
        "forgetting.enabled" => {
            config.forgetting.enabled = value
                .parse()
                .map_err(|_| invalid(key, value))?;
        }
        other => return Err(AgenrError::Validation {
            file: "config".to_string(),
            reason: format!("unknown config key '{other}'"),
        }),
    }
    config.save()?;
    Ok(())
}

fn invalid(key: &str, value: &str) -> AgenrError {
    AgenrError::Validation {
        file: "config".to_string(),
        reason: format!("invalid value '{value}' for key '{key}'"),
    }
}
