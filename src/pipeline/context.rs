use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::helper::HelperKind;
use crate::reporter::Reporter;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationPhase {
    #[default]
    Generate,
    Apply,
}

/// Shared, read-only state handed to every helper and hook.
#[derive(Clone)]
pub struct PipelineContext {
    pub workspace: Arc<Workspace>,
    pub reporter: Arc<dyn Reporter>,
    pub phase: GenerationPhase,
}

/// Caller-provided options describing what is being built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    pub namespace: String,
    pub origin: Option<String>,
    pub source_path: Option<PathBuf>,
    pub config: Value,
}

#[derive(Clone)]
pub struct RunOptions {
    pub phase: GenerationPhase,
    pub workspace: Arc<Workspace>,
    pub reporter: Arc<dyn Reporter>,
    pub build: BuildOptions,
}

impl RunOptions {
    pub fn new(workspace: Arc<Workspace>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            phase: GenerationPhase::default(),
            workspace,
            reporter,
            build: BuildOptions::default(),
        }
    }

    pub fn with_phase(mut self, phase: GenerationPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_build(mut self, build: BuildOptions) -> Self {
        self.build = build;
        self
    }
}

/// Mutable intermediate representation assembled by fragment helpers.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    fragments: Map<String, Value>,
}

impl Draft {
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.fragments.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fragments.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fragments.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fragments.contains_key(key)
    }

    /// Append to an array fragment, creating it when absent. A non-array
    /// value under `key` is wrapped into a one-element array first.
    pub fn push(&mut self, key: impl Into<String>, value: Value) {
        let slot = self
            .fragments
            .entry(key.into())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            let previous = slot.take();
            *slot = Value::Array(vec![previous]);
        }
        if let Value::Array(items) = slot {
            items.push(value);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fragments.keys().map(String::as_str)
    }

    pub fn finalize(self, build: &BuildOptions) -> Artifact {
        Artifact {
            ir: self.fragments,
            build: build.clone(),
        }
    }
}

/// Finalized IR handed to extension hooks and builder helpers.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    ir: Map<String, Value>,
    build: BuildOptions,
}

impl Artifact {
    pub fn new(ir: Map<String, Value>, build: BuildOptions) -> Self {
        Self { ir, build }
    }

    pub fn ir(&self) -> &Map<String, Value> {
        &self.ir
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.ir.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.ir.insert(key.into(), value)
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.ir.insert(key.into(), value);
        self
    }

    pub fn build_options(&self) -> &BuildOptions {
        &self.build
    }

    /// sha256 over the canonical JSON of the IR. Keys are sorted, so equal
    /// IRs always share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Value::Object(self.ir.clone()).to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum OutputAction {
    Write {
        file: String,
        contents: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Delete {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl OutputAction {
    pub fn file(&self) -> &str {
        match self {
            OutputAction::Write { file, .. } | OutputAction::Delete { file, .. } => file,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            OutputAction::Write { description, .. } | OutputAction::Delete { description, .. } => {
                description.as_deref()
            }
        }
    }
}

/// Queue of file actions produced by builder helpers, in queue order.
#[derive(Debug, Clone, Default)]
pub struct BuilderOutput {
    actions: Vec<OutputAction>,
}

impl BuilderOutput {
    pub fn queue_write(&mut self, file: impl Into<String>, contents: impl Into<String>) {
        self.push(OutputAction::Write {
            file: file.into(),
            contents: contents.into(),
            description: None,
        });
    }

    pub fn queue_delete(&mut self, file: impl Into<String>) {
        self.push(OutputAction::Delete {
            file: file.into(),
            description: None,
        });
    }

    pub fn push(&mut self, action: OutputAction) {
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[OutputAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn into_actions(self) -> Vec<OutputAction> {
        self.actions
    }
}

/// One executed (or attempted) helper, recorded before it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub id: String,
    pub index: usize,
    pub key: String,
    pub kind: HelperKind,
    pub priority: i32,
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PipelineDiagnostic {
    MissingDependency {
        kind: HelperKind,
        key: String,
        dependency: String,
        message: String,
    },
}

impl PipelineDiagnostic {
    pub fn message(&self) -> &str {
        match self {
            PipelineDiagnostic::MissingDependency { message, .. } => message,
        }
    }
}

/// Per-run mutable state. Owned by a single run, never shared.
pub struct PipelineRunContext {
    pub context: PipelineContext,
    pub build: BuildOptions,
    pub draft: Draft,
    pub steps: Vec<PipelineStep>,
    pub diagnostics: Vec<PipelineDiagnostic>,
}

impl PipelineRunContext {
    pub fn new(options: RunOptions) -> Self {
        Self {
            context: PipelineContext {
                workspace: options.workspace,
                reporter: options.reporter,
                phase: options.phase,
            },
            build: options.build,
            draft: Draft::default(),
            steps: Vec::new(),
            diagnostics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRunResult {
    pub artifact: Artifact,
    pub diagnostics: Vec<PipelineDiagnostic>,
    pub steps: Vec<PipelineStep>,
    pub actions: Vec<OutputAction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_creates_and_wraps_arrays() {
        let mut draft = Draft::default();
        draft.push("classes", json!("A"));
        draft.push("classes", json!("B"));
        draft.insert("meta", json!({"name": "demo"}));
        draft.push("meta", json!("extra"));

        assert_eq!(draft.get("classes"), Some(&json!(["A", "B"])));
        assert_eq!(draft.get("meta"), Some(&json!([{"name": "demo"}, "extra"])));
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let mut first = Draft::default();
        first.insert("b", json!(2));
        first.insert("a", json!(1));
        let mut second = Draft::default();
        second.insert("a", json!(1));
        second.insert("b", json!(2));

        let build = BuildOptions::default();
        let left = first.finalize(&build);
        let right = second.finalize(&build);
        assert_eq!(left.fingerprint(), right.fingerprint());
        assert_ne!(left.fingerprint(), right.with("c", json!(3)).fingerprint());
    }

    #[test]
    fn output_actions_serialize_with_tag() {
        let mut output = BuilderOutput::default();
        output.queue_write("src/Foo.php", "<?php");
        output.queue_delete("src/Old.php");
        let value = serde_json::to_value(output.actions()).unwrap();
        assert_eq!(value[0]["action"], "write");
        assert_eq!(value[1]["action"], "delete");
        assert_eq!(output.actions()[1].file(), "src/Old.php");
    }
}
