use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::workspace::Workspace;

/// One target file to reconcile. `incoming: None` requests deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyInstruction {
    pub file: String,
    /// Staged base snapshot; defaults to the layout's base root + `file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// sha256 of the incoming copy at staging time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ApplyInstruction {
    pub fn is_delete(&self) -> bool {
        self.incoming.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub instructions: Vec<ApplyInstruction>,
}

impl Plan {
    /// `None` when no plan file exists.
    pub fn load(workspace: &Workspace, path: &str) -> Result<Option<Self>> {
        let Some(content) = workspace.read_text(path)? else {
            return Ok(None);
        };
        let plan: Plan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse apply plan: {path}"))?;
        Ok(Some(plan))
    }

    pub fn save(&self, workspace: &Workspace, path: &str) -> Result<()> {
        workspace.write_json(path, self)
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }
}
