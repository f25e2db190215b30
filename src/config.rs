use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "kernelgen.yaml";

/// Where the apply engine finds its plan and staged copies, relative to
/// the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApplyLayout {
    pub plan: String,
    pub base_root: String,
    pub incoming_root: String,
    pub log: String,
    pub backup_suffix: String,
}

impl Default for ApplyLayout {
    fn default() -> Self {
        Self {
            plan: ".kernelgen/apply/plan.json".to_string(),
            base_root: ".kernelgen/apply/base".to_string(),
            incoming_root: ".kernelgen/apply/incoming".to_string(),
            log: ".kernelgen-apply.log".to_string(),
            backup_suffix: ".bak".to_string(),
        }
    }
}

impl ApplyLayout {
    /// Staged base snapshot for a target file.
    pub fn base_path(&self, file: &str) -> String {
        format!("{}/{}", self.base_root.trim_end_matches('/'), file)
    }

    /// Staged incoming copy for a target file.
    pub fn incoming_path(&self, file: &str) -> String {
        format!("{}/{}", self.incoming_root.trim_end_matches('/'), file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolchainConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub apply: ApplyLayout,
}

fn default_version() -> u32 {
    1
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            apply: ApplyLayout::default(),
        }
    }
}

impl ToolchainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ToolchainConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        if config.version != 1 {
            bail!(
                "Unsupported config version {} in {}",
                config.version,
                path.display()
            );
        }
        Ok(config)
    }

    /// Load `kernelgen.yaml` from the workspace root, or defaults when absent.
    pub fn discover(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}
