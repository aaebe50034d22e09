//! Template registry: stores and retrieves workflow template versions
//!
//! Templates are validated before they are stored and frozen once
//! published. To change a published workflow, register a new version.

use procflow_types::{
    EngineError, EngineResult, TemplateStatus, WorkflowId, WorkflowTemplate,
};
use std::collections::HashMap;

/// Registry of workflow templates, keyed by (workflow id, version)
#[derive(Clone, Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<(WorkflowId, u32), WorkflowTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template version.
    ///
    /// Validates the graph first; a structurally broken template is
    /// rejected here rather than failing runs later.
    pub fn register(&mut self, template: WorkflowTemplate) -> EngineResult<()> {
        template.validate()?;

        let key = (template.id.clone(), template.version);
        if self.templates.contains_key(&key) {
            return Err(EngineError::DuplicateTemplate {
                workflow: key.0,
                version: key.1,
            });
        }

        tracing::info!(
            workflow_id = %template.id,
            version = template.version,
            "workflow template registered"
        );
        self.templates.insert(key, template);
        Ok(())
    }

    /// Get a specific version
    pub fn get(&self, id: &WorkflowId, version: u32) -> EngineResult<&WorkflowTemplate> {
        self.templates
            .get(&(id.clone(), version))
            .ok_or_else(|| EngineError::TemplateNotFound(id.clone()))
    }

    /// The highest-versioned Active template of a workflow
    pub fn latest_active(&self, id: &WorkflowId) -> EngineResult<&WorkflowTemplate> {
        self.templates
            .values()
            .filter(|t| &t.id == id && t.status == TemplateStatus::Active)
            .max_by_key(|t| t.version)
            .ok_or_else(|| EngineError::NoActiveVersion(id.clone()))
    }

    /// Publish a draft: Draft → Active. The graph is frozen from here.
    pub fn publish(&mut self, id: &WorkflowId, version: u32) -> EngineResult<()> {
        let template = self
            .templates
            .get_mut(&(id.clone(), version))
            .ok_or_else(|| EngineError::TemplateNotFound(id.clone()))?;
        if template.status != TemplateStatus::Draft {
            return Err(EngineError::InvalidTransition(format!(
                "template {} v{} is not a draft",
                id, version
            )));
        }
        template.status = TemplateStatus::Active;
        tracing::info!(workflow_id = %id, version, "workflow template published");
        Ok(())
    }

    /// Retire an active version: Active → Inactive. No new runs.
    pub fn retire(&mut self, id: &WorkflowId, version: u32) -> EngineResult<()> {
        let template = self
            .templates
            .get_mut(&(id.clone(), version))
            .ok_or_else(|| EngineError::TemplateNotFound(id.clone()))?;
        if template.status != TemplateStatus::Active {
            return Err(EngineError::InvalidTransition(format!(
                "template {} v{} is not active",
                id, version
            )));
        }
        template.status = TemplateStatus::Inactive;
        tracing::info!(workflow_id = %id, version, "workflow template retired");
        Ok(())
    }

    /// All registered versions of one workflow
    pub fn versions(&self, id: &WorkflowId) -> Vec<&WorkflowTemplate> {
        let mut versions: Vec<_> = self
            .templates
            .values()
            .filter(|t| &t.id == id)
            .collect();
        versions.sort_by_key(|t| t.version);
        versions
    }

    pub fn count(&self) -> usize {
        self.templates.len()
    }
}
