//! Template catalog: YAML documents resolved once into a validated arena.
//!
//! Inheritance, config merging and all validation happen at load time, so
//! the executor only ever sees flat, ordered step lists.

mod definition;

pub use definition::{
    compare_versions, merge_config, template_id, ActionCategory, ActionDefinition, Backoff,
    CatalogDocument, StepDefinition, TemplateDefinition,
};

use crate::condition::Condition;
use crate::error::{OrchestratorError, Result};
use crate::handlers::ActionRegistry;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;

/// A step with action defaults and template overrides applied.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ResolvedStep {
    pub action_id: String,
    pub kind: String,
    pub category: ActionCategory,
    pub sequence_order: i64,
    #[schema(value_type = Object)]
    pub config: serde_json::Value,
    #[schema(value_type = Option<String>)]
    pub condition: Option<Condition>,
    pub skip_on_error: bool,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    pub prerequisites: Vec<String>,
}

impl ResolvedStep {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.retry_delay_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                base.saturating_mul(factor)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ResolvedTemplate {
    /// `name@version`
    pub id: String,
    pub name: String,
    pub version: String,
    /// Resolved id of the base template.
    pub extends: Option<String>,
    pub rollback_on_failure: bool,
    /// Base steps first, then own steps ordered by `sequence_order`.
    pub steps: Vec<ResolvedStep>,
}

#[derive(Debug, Default)]
pub struct TemplateCatalog {
    actions: BTreeMap<String, ActionDefinition>,
    templates: Vec<ResolvedTemplate>,
    by_id: HashMap<String, usize>,
    latest: HashMap<String, usize>,
}

impl TemplateCatalog {
    /// Reads every `*.yml`/`*.yaml` file of `dir` in name order.
    pub fn load_dir(dir: &Path, registry: &ActionRegistry) -> Result<Self> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| OrchestratorError::Template(format!("{}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && matches!(
                        path.extension().and_then(|ext| ext.to_str()),
                        Some("yml" | "yaml")
                    )
            })
            .collect();
        files.sort();

        let mut documents = Vec::with_capacity(files.len());
        for path in &files {
            let content = std::fs::read_to_string(path)?;
            let document: CatalogDocument = serde_yaml_ng::from_str(&content).map_err(|e| {
                OrchestratorError::Template(format!("{}: {e}", path.display()))
            })?;
            debug!(file = %path.display(), "loaded catalog document");
            documents.push(document);
        }

        let catalog = Self::from_documents(documents, registry)?;
        info!(
            dir = %dir.display(),
            actions = catalog.actions.len(),
            templates = catalog.templates.len(),
            "template catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_yaml_str(yaml: &str, registry: &ActionRegistry) -> Result<Self> {
        let document: CatalogDocument =
            serde_yaml_ng::from_str(yaml).map_err(|e| OrchestratorError::Template(e.to_string()))?;
        Self::from_documents(vec![document], registry)
    }

    pub fn from_documents(documents: Vec<CatalogDocument>, registry: &ActionRegistry) -> Result<Self> {
        let mut actions = BTreeMap::new();
        let mut definitions: BTreeMap<String, TemplateDefinition> = BTreeMap::new();

        for document in documents {
            for action in document.actions {
                validate_action(&action, registry)?;
                if actions.contains_key(&action.id) {
                    return Err(OrchestratorError::Template(format!(
                        "action '{}' is defined twice",
                        action.id
                    )));
                }
                actions.insert(action.id.clone(), action);
            }
            for template in document.templates {
                let id = template.id();
                if template.name.trim().is_empty() || template.name.contains('@') {
                    return Err(OrchestratorError::Template(format!(
                        "invalid template name '{}'",
                        template.name
                    )));
                }
                if definitions.insert(id.clone(), template).is_some() {
                    return Err(OrchestratorError::Template(format!(
                        "template '{id}' is defined twice"
                    )));
                }
            }
        }

        let mut catalog = Self {
            actions,
            ..Default::default()
        };

        let ids: Vec<String> = definitions.keys().cloned().collect();
        let mut resolving = Vec::new();
        for id in ids {
            catalog.resolve_definition(&id, &definitions, registry, &mut resolving)?;
        }

        for (index, template) in catalog.templates.iter().enumerate() {
            let newer = match catalog.latest.get(&template.name) {
                Some(&current) => {
                    compare_versions(&template.version, &catalog.templates[current].version)
                        == std::cmp::Ordering::Greater
                }
                None => true,
            };
            if newer {
                catalog.latest.insert(template.name.clone(), index);
            }
        }

        Ok(catalog)
    }

    /// Resolves `id` and its bases into the arena, returning its index.
    fn resolve_definition(
        &mut self,
        id: &str,
        definitions: &BTreeMap<String, TemplateDefinition>,
        registry: &ActionRegistry,
        resolving: &mut Vec<String>,
    ) -> Result<usize> {
        if let Some(&index) = self.by_id.get(id) {
            return Ok(index);
        }
        if resolving.iter().any(|r| r == id) {
            resolving.push(id.to_string());
            return Err(OrchestratorError::Template(format!(
                "template inheritance cycle: {}",
                resolving.join(" -> ")
            )));
        }
        let definition = definitions
            .get(id)
            .ok_or_else(|| OrchestratorError::Template(format!("unknown template '{id}'")))?;

        resolving.push(id.to_string());
        let base = match &definition.extends {
            Some(reference) => {
                let base_id = reference_in(reference, definitions).ok_or_else(|| {
                    OrchestratorError::Template(format!(
                        "template '{id}' extends unknown template '{reference}'"
                    ))
                })?;
                let index = self.resolve_definition(&base_id, definitions, registry, resolving)?;
                Some(index)
            }
            None => None,
        };
        resolving.pop();

        let (mut steps, inherited_rollback, extends) = match base {
            Some(index) => {
                let base = &self.templates[index];
                (
                    base.steps.clone(),
                    Some(base.rollback_on_failure),
                    Some(base.id.clone()),
                )
            }
            None => (Vec::new(), None, None),
        };

        let mut own: Vec<&StepDefinition> = definition.steps.iter().collect();
        own.sort_by_key(|step| step.sequence_order);
        // Own steps follow the inherited ones whatever their order numbers
        for step in own {
            steps.push(self.resolve_step(id, step, registry)?);
        }

        validate_steps(id, &steps)?;

        let template = ResolvedTemplate {
            id: id.to_string(),
            name: definition.name.clone(),
            version: definition.version.clone(),
            extends,
            rollback_on_failure: definition
                .rollback_on_failure
                .or(inherited_rollback)
                .unwrap_or(true),
            steps,
        };

        let index = self.templates.len();
        self.templates.push(template);
        self.by_id.insert(id.to_string(), index);
        Ok(index)
    }

    fn resolve_step(
        &self,
        template_id: &str,
        step: &StepDefinition,
        registry: &ActionRegistry,
    ) -> Result<ResolvedStep> {
        let action = self.actions.get(&step.action).ok_or_else(|| {
            OrchestratorError::Template(format!(
                "template '{template_id}' uses unknown action '{}'",
                step.action
            ))
        })?;

        let config = match &step.config {
            Some(overlay) => merge_config(&action.config, overlay),
            None => action.config.clone(),
        };
        registry.resolve(&action.kind)?.check_config(&action.id, &config)?;

        let max_retries = step.max_retries.unwrap_or(action.max_retries);
        if max_retries == 0 {
            return Err(OrchestratorError::Template(format!(
                "template '{template_id}' step '{}' needs max_retries >= 1",
                step.action
            )));
        }

        Ok(ResolvedStep {
            action_id: action.id.clone(),
            kind: action.kind.clone(),
            category: action.category,
            sequence_order: step.sequence_order,
            config,
            condition: step.condition.clone().or_else(|| action.condition.clone()),
            skip_on_error: step.skip_on_error,
            max_retries,
            timeout_secs: step.timeout_secs.unwrap_or(action.timeout_secs),
            retry_delay_ms: action.retry_delay_ms,
            backoff: action.backoff,
            prerequisites: action.prerequisites.clone(),
        })
    }

    /// Looks up `name` (latest version) or `name@version`.
    pub fn resolve(&self, reference: &str) -> Result<&ResolvedTemplate> {
        let index = match reference.split_once('@') {
            Some(_) => self.by_id.get(reference),
            None => self.latest.get(reference),
        };
        index
            .map(|&i| &self.templates[i])
            .ok_or_else(|| OrchestratorError::InvalidInput(format!("unknown template '{reference}'")))
    }

    pub fn get(&self, id: &str) -> Option<&ResolvedTemplate> {
        self.by_id.get(id).map(|&i| &self.templates[i])
    }

    pub fn templates(&self) -> &[ResolvedTemplate] {
        &self.templates
    }

    pub fn action(&self, id: &str) -> Option<&ActionDefinition> {
        self.actions.get(id)
    }

    /// Records every resolved template version in `workspace_templates`.
    #[instrument(skip_all, fields(templates = self.templates.len()))]
    pub async fn register(&self, pool: &SqlitePool) -> Result<()> {
        let now = Utc::now().timestamp();
        for template in &self.templates {
            let definition = serde_json::to_string(template)?;
            sqlx::query(
                "INSERT INTO workspace_templates (id, name, version, extends, rollback_on_failure, definition, registered_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    extends = excluded.extends,
                    rollback_on_failure = excluded.rollback_on_failure,
                    definition = excluded.definition,
                    registered_at = excluded.registered_at",
            )
            .bind(&template.id)
            .bind(&template.name)
            .bind(&template.version)
            .bind(&template.extends)
            .bind(template.rollback_on_failure)
            .bind(definition)
            .bind(now)
            .execute(pool)
            .await?;
        }
        Ok(())
    }
}

fn reference_in(reference: &str, definitions: &BTreeMap<String, TemplateDefinition>) -> Option<String> {
    if reference.contains('@') {
        return definitions.contains_key(reference).then(|| reference.to_string());
    }
    definitions
        .values()
        .filter(|d| d.name == reference)
        .max_by(|a, b| compare_versions(&a.version, &b.version))
        .map(TemplateDefinition::id)
}

fn validate_action(action: &ActionDefinition, registry: &ActionRegistry) -> Result<()> {
    if action.id.trim().is_empty() {
        return Err(OrchestratorError::Template("action with an empty id".to_string()));
    }
    if !registry.contains(&action.kind) {
        return Err(OrchestratorError::UnknownActionKind(format!(
            "{} (action '{}')",
            action.kind, action.id
        )));
    }
    if action.max_retries == 0 {
        return Err(OrchestratorError::Template(format!(
            "action '{}' needs max_retries >= 1",
            action.id
        )));
    }
    if action.prerequisites.iter().any(|p| p == &action.id) {
        return Err(OrchestratorError::Template(format!(
            "action '{}' lists itself as a prerequisite",
            action.id
        )));
    }
    Ok(())
}

fn validate_steps(template_id: &str, steps: &[ResolvedStep]) -> Result<()> {
    let mut orders = HashSet::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for step in steps {
        if !orders.insert(step.sequence_order) {
            return Err(OrchestratorError::Template(format!(
                "template '{template_id}' has two steps at sequence_order {}",
                step.sequence_order
            )));
        }
        if let Some(missing) = step
            .prerequisites
            .iter()
            .find(|p| !seen.contains(p.as_str()))
        {
            return Err(OrchestratorError::Template(format!(
                "template '{template_id}': step '{}' requires '{missing}', which does not run before it",
                step.action_id
            )));
        }
        if !seen.insert(step.action_id.as_str()) {
            return Err(OrchestratorError::Template(format!(
                "template '{template_id}' includes action '{}' twice",
                step.action_id
            )));
        }
    }
    Ok(())
}
