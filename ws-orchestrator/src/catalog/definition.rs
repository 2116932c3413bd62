//! On-disk shape of catalog documents.

use crate::condition::Condition;
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

/// One YAML file of the catalog directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogDocument {
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub templates: Vec<TemplateDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    #[default]
    System,
    Database,
    Environment,
    Repository,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Exponential,
    Fixed,
}

/// A reusable action and its defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDefinition {
    pub id: String,
    #[serde(default)]
    pub category: ActionCategory,
    /// Registry key of the handler.
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Total attempts, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

fn default_max_retries() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateDefinition {
    pub name: String,
    #[serde(deserialize_with = "version_string")]
    pub version: String,
    /// `name` (latest version) or `name@version` of the base template.
    #[serde(default)]
    pub extends: Option<String>,
    /// Inherited from the base when unset; defaults to true.
    #[serde(default)]
    pub rollback_on_failure: Option<bool>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl TemplateDefinition {
    pub fn id(&self) -> String {
        template_id(&self.name, &self.version)
    }
}

pub fn template_id(name: &str, version: &str) -> String {
    format!("{name}@{version}")
}

/// Binds an action into a template.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub action: String,
    pub sequence_order: i64,
    /// Deep-merged over the action's config.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    /// Replaces the action's condition.
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub skip_on_error: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

// Versions are written as `1`, `1.2` or `"1.2.3"`
fn version_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVersion {
        Text(String),
        Integer(u64),
        Float(f64),
    }

    let version = match RawVersion::deserialize(deserializer)? {
        RawVersion::Text(s) => s.trim().to_string(),
        RawVersion::Integer(n) => n.to_string(),
        RawVersion::Float(f) => f.to_string(),
    };
    if version.is_empty() || version.contains('@') {
        return Err(serde::de::Error::custom(format!(
            "invalid template version '{version}'"
        )));
    }
    Ok(version)
}

/// Deep merge where objects merge key by key and anything else in
/// `overlay` replaces the base value.
pub fn merge_config(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let next = match merged.get(key) {
                    Some(existing) => merge_config(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

/// Orders versions numerically segment by segment (`1.10` > `1.9`),
/// falling back to text for non-numeric segments.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let key = |v: &str| -> Vec<(u8, u64, String)> {
        v.split('.')
            .map(|part| match part.parse::<u64>() {
                Ok(n) => (0, n, String::new()),
                Err(_) => (1, 0, part.to_string()),
            })
            .collect()
    };
    key(a).cmp(&key(b))
}
