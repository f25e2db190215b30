//! Append-only JSONL log: one entry per apply invocation.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const APPLY_LOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyLogStatus {
    Success,
    Conflict,
    Cancelled,
    Skipped,
    Failed,
}

impl ApplyLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyLogStatus::Success => "success",
            ApplyLogStatus::Conflict => "conflict",
            ApplyLogStatus::Cancelled => "cancelled",
            ApplyLogStatus::Skipped => "skipped",
            ApplyLogStatus::Failed => "failed",
        }
    }
}

/// Outcome for a single planned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    Applied,
    Conflict,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRecord {
    pub file: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub details: RecordDetails,
}

impl ApplyRecord {
    pub fn applied(file: impl Into<String>, action: &str) -> Self {
        Self::new(file, RecordStatus::Applied).with_action(action)
    }

    pub fn skipped(file: impl Into<String>, reason: &str) -> Self {
        Self::new(file, RecordStatus::Skipped).with_reason(reason)
    }

    pub fn conflict(file: impl Into<String>, reason: &str) -> Self {
        Self::new(file, RecordStatus::Conflict).with_reason(reason)
    }

    fn new(file: impl Into<String>, status: RecordStatus) -> Self {
        Self {
            file: file.into(),
            status,
            description: None,
            details: RecordDetails::default(),
        }
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.details.action = Some(action.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.details.reason = Some(reason.to_string());
        self
    }

    pub fn with_backup(mut self, backup: Option<String>) -> Self {
        self.details.backup = backup;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.details.reason.as_deref()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub applied: usize,
    pub conflicts: usize,
    pub skipped: usize,
}

impl ApplySummary {
    pub fn from_records(records: &[ApplyRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            match record.status {
                RecordStatus::Applied => summary.applied += 1,
                RecordStatus::Conflict => summary.conflicts += 1,
                RecordStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFlags {
    pub yes: bool,
    pub backup: bool,
    pub force: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl From<&anyhow::Error> for SerializedError {
    fn from(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            chain: err.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyLogEntry {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub status: ApplyLogStatus,
    pub exit_code: i32,
    pub flags: ApplyFlags,
    pub summary: ApplySummary,
    #[serde(default)]
    pub records: Vec<ApplyRecord>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl ApplyLogEntry {
    pub fn new(status: ApplyLogStatus, exit_code: i32, flags: ApplyFlags) -> Self {
        Self {
            version: APPLY_LOG_VERSION,
            timestamp: Utc::now(),
            status,
            exit_code,
            flags,
            summary: ApplySummary::default(),
            records: Vec::new(),
            actions: Vec::new(),
            error: None,
        }
    }

    pub fn with_records(mut self, records: Vec<ApplyRecord>) -> Self {
        self.summary = ApplySummary::from_records(&records);
        self.records = records;
        self
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_error(mut self, err: &anyhow::Error) -> Self {
        self.error = Some(SerializedError::from(err));
        self
    }
}

/// Append one JSON line, creating the file and its parent directory.
pub fn append_entry(path: &Path, entry: &ApplyLogEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let json = serde_json::to_string(entry).context("Failed to serialize apply log entry")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open apply log {}", path.display()))?;
    writeln!(file, "{json}")
        .with_context(|| format!("Failed to append to apply log {}", path.display()))?;
    Ok(())
}

/// Read every entry; blank lines are ignored. A missing log is empty.
pub fn read_entries(path: &Path) -> Result<Vec<ApplyLogEntry>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open apply log {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read apply log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line)
            .with_context(|| format!("Malformed apply log entry on line {}", idx + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}
