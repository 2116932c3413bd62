//! Typed predicates deciding whether a step runs.
//!
//! Template documents may spell a condition as a typed map
//! (`{ has_attribute: ssh_key }`), a boolean, or a compact string:
//!
//! | string               | condition                |
//! |----------------------|--------------------------|
//! | `has:NAME`           | `HasAttribute(NAME)`     |
//! | `!has:NAME`          | `LacksAttribute(NAME)`   |
//! | `exists:REL/PATH`    | `PathExists(REL/PATH)`   |
//! | `!exists:REL/PATH`   | `PathMissing(REL/PATH)`  |
//! | `true` / `false`     | `Always` / `Never`       |
//!
//! Anything else parses to `Unrecognized`, which evaluates to `false`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use tracing::warn;
use ws_core::file_system::resolve_within;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    HasAttribute(String),
    LacksAttribute(String),
    PathExists(String),
    PathMissing(String),
    Always,
    Never,
    Unrecognized(String),
}

/// Read-only view of a workspace a condition is evaluated against.
pub trait ConditionContext {
    fn has_attribute(&self, name: &str) -> bool;
    fn home_dir(&self) -> &Path;
}

impl Condition {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let non_empty = |value: &str, build: fn(String) -> Condition| {
            let value = value.trim();
            if value.is_empty() {
                Condition::Unrecognized(raw.to_string())
            } else {
                build(value.to_string())
            }
        };

        if let Some(name) = raw.strip_prefix("!has:") {
            non_empty(name, Condition::LacksAttribute)
        } else if let Some(name) = raw.strip_prefix("has:") {
            non_empty(name, Condition::HasAttribute)
        } else if let Some(path) = raw.strip_prefix("!exists:") {
            non_empty(path, Condition::PathMissing)
        } else if let Some(path) = raw.strip_prefix("exists:") {
            non_empty(path, Condition::PathExists)
        } else {
            match raw {
                "true" | "always" => Condition::Always,
                "false" | "never" => Condition::Never,
                _ => Condition::Unrecognized(raw.to_string()),
            }
        }
    }

    fn from_value(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Bool(true) => Condition::Always,
            Value::Bool(false) => Condition::Never,
            Value::String(raw) => Condition::parse(raw),
            Value::Object(map) if map.len() == 1 => {
                let Some((key, arg)) = map.iter().next() else {
                    return Condition::Unrecognized(value.to_string());
                };
                match (key.as_str(), arg.as_str().map(str::trim)) {
                    ("has_attribute", Some(name)) if !name.is_empty() => {
                        Condition::HasAttribute(name.to_string())
                    }
                    ("lacks_attribute", Some(name)) if !name.is_empty() => {
                        Condition::LacksAttribute(name.to_string())
                    }
                    ("path_exists", Some(path)) if !path.is_empty() => {
                        Condition::PathExists(path.to_string())
                    }
                    ("path_missing", Some(path)) if !path.is_empty() => {
                        Condition::PathMissing(path.to_string())
                    }
                    _ => Condition::Unrecognized(value.to_string()),
                }
            }
            other => Condition::Unrecognized(other.to_string()),
        }
    }

    pub fn evaluate(&self, ctx: &dyn ConditionContext) -> bool {
        match self {
            Condition::HasAttribute(name) => ctx.has_attribute(name),
            Condition::LacksAttribute(name) => !ctx.has_attribute(name),
            Condition::PathExists(rel) => {
                path_in_home(ctx, rel).is_some_and(|path| path.exists())
            }
            Condition::PathMissing(rel) => {
                path_in_home(ctx, rel).is_some_and(|path| !path.exists())
            }
            Condition::Always => true,
            Condition::Never => false,
            Condition::Unrecognized(raw) => {
                warn!(condition = %raw, "unrecognized condition evaluates to false");
                false
            }
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Condition::Unrecognized(_))
    }
}

fn path_in_home(ctx: &dyn ConditionContext, rel: &str) -> Option<std::path::PathBuf> {
    let resolved = resolve_within(ctx.home_dir(), rel);
    if resolved.is_none() {
        warn!(path = %rel, "condition path escapes the workspace home, evaluating to false");
    }
    resolved
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::HasAttribute(name) => write!(f, "has:{name}"),
            Condition::LacksAttribute(name) => write!(f, "!has:{name}"),
            Condition::PathExists(path) => write!(f, "exists:{path}"),
            Condition::PathMissing(path) => write!(f, "!exists:{path}"),
            Condition::Always => f.write_str("true"),
            Condition::Never => f.write_str("false"),
            Condition::Unrecognized(raw) => f.write_str(raw),
        }
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Condition::from_value(&value))
    }
}
