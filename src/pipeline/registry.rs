use crate::error::PipelineError;

use super::context::PipelineDiagnostic;
use super::graph::{DependencyGraph, GraphNode};
use super::helper::{Helper, HelperKind};

/// Helpers of a single kind, kept in registration order.
#[derive(Debug, Clone)]
pub struct HelperRegistry {
    kind: HelperKind,
    helpers: Vec<Helper>,
}

impl HelperRegistry {
    pub fn new(kind: HelperKind) -> Self {
        Self {
            kind,
            helpers: Vec::new(),
        }
    }

    pub fn kind(&self) -> HelperKind {
        self.kind
    }

    pub fn register(&mut self, helper: Helper) -> Result<(), PipelineError> {
        if helper.kind() != self.kind {
            return Err(PipelineError::HelperKindMismatch {
                key: helper.key().to_string(),
                expected: self.kind,
                actual: helper.kind(),
            });
        }
        if self.get(helper.key()).is_some() {
            return Err(PipelineError::DuplicateHelperKey {
                kind: self.kind,
                key: helper.key().to_string(),
            });
        }
        tracing::debug!(kind = %self.kind, key = helper.key(), "Registered helper");
        self.helpers.push(helper);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Helper> {
        self.helpers.iter().find(|helper| helper.key() == key)
    }

    pub fn helpers(&self) -> &[Helper] {
        &self.helpers
    }

    pub fn known_helpers(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .helpers
            .iter()
            .map(|helper| helper.key().to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    pub fn build_graph(&self) -> Result<DependencyGraph, PipelineError> {
        DependencyGraph::build(self.helpers.iter().map(|helper| GraphNode {
            key: helper.key(),
            priority: helper.priority(),
            dependencies: helper.dependencies(),
        }))
        .map_err(|cycle| PipelineError::CyclicDependency {
            kind: self.kind,
            members: cycle.members,
        })
    }

    /// Helpers in execution order paired with their registration index.
    /// Unknown dependencies are appended to `diagnostics`.
    pub fn ordered(
        &self,
        diagnostics: &mut Vec<PipelineDiagnostic>,
    ) -> Result<Vec<(usize, Helper)>, PipelineError> {
        let graph = self.build_graph()?;
        diagnostics.extend(graph.missing().iter().map(|edge| {
            PipelineDiagnostic::MissingDependency {
                kind: self.kind,
                key: edge.key.clone(),
                dependency: edge.dependency.clone(),
                message: format!(
                    "{} helper '{}' depends on unknown helper '{}'. Available helpers: {}",
                    self.kind,
                    edge.key,
                    edge.dependency,
                    self.known_helpers().join(", ")
                ),
            }
        }));
        Ok(graph
            .order()
            .iter()
            .map(|&idx| (idx, self.helpers[idx].clone()))
            .collect())
    }
}
