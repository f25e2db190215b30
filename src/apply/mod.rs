//! Apply engine: reconciles a staged plan with the workspace through a
//! three-way merge, inside one transaction, and appends one log entry per
//! invocation.

pub mod log;
pub mod plan;
pub mod staging;
pub mod validation;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::config::ApplyLayout;
use crate::error::WorkspaceError;
use crate::reporter::Reporter;
use crate::workspace::{MergeOptions, MergeStatus, Resolution, Workspace};

pub use log::{
    ApplyFlags, ApplyLogEntry, ApplyLogStatus, ApplyRecord, ApplySummary, RecordStatus,
    append_entry, read_entries,
};
pub use plan::{ApplyInstruction, Plan};
pub use staging::{content_hash, create_plan_builder, stage_actions};
pub use validation::{ValidationReport, validate_plan};

pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const VALIDATION_ERROR: i32 = 1;
    pub const TRANSACTION_FAILURE: i32 = 2;
    pub const UNEXPECTED_ERROR: i32 = 4;
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("apply plan is invalid: {}", errors.join("; "))]
    InvalidPlan { errors: Vec<String> },

    #[error("apply plan '{path}' could not be read")]
    UnreadablePlan { path: String },
}

/// Map a failure onto the documented exit codes.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ApplyError>().is_some() {
        return exit_codes::VALIDATION_ERROR;
    }
    match err.downcast_ref::<WorkspaceError>() {
        Some(WorkspaceError::Transaction { .. }) => exit_codes::TRANSACTION_FAILURE,
        _ => exit_codes::UNEXPECTED_ERROR,
    }
}

/// Asks the user whether to proceed.
pub trait Confirm {
    fn confirm(&self, message: &str) -> Result<bool>;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> Result<bool>,
{
    fn confirm(&self, message: &str) -> Result<bool> {
        self(message)
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub entry: ApplyLogEntry,
    pub log_path: Option<PathBuf>,
}

impl ApplyOutcome {
    pub fn exit_code(&self) -> i32 {
        self.entry.exit_code
    }

    pub fn status(&self) -> ApplyLogStatus {
        self.entry.status
    }
}

pub struct ApplyEngine<'a> {
    workspace: &'a Workspace,
    layout: &'a ApplyLayout,
    reporter: Arc<dyn Reporter>,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(workspace: &'a Workspace, layout: &'a ApplyLayout, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            workspace,
            layout,
            reporter,
        }
    }

    /// Run one apply invocation. Never fails: every outcome, including
    /// errors, becomes a log entry carrying its exit code.
    pub fn run(&self, flags: ApplyFlags, confirm: Option<&dyn Confirm>) -> ApplyOutcome {
        let span = tracing::info_span!(
            "apply",
            yes = flags.yes,
            force = flags.force,
            backup = flags.backup,
            dry_run = flags.dry_run
        );
        let _guard = span.enter();

        let entry = match self.execute(flags, confirm) {
            Ok(entry) => entry,
            Err(err) => {
                let exit_code = exit_code_for(&err);
                self.reporter.error(
                    &format!("Apply failed: {err:#}"),
                    Some(&json!({ "exitCode": exit_code })),
                );
                ApplyLogEntry::new(ApplyLogStatus::Failed, exit_code, flags).with_error(&err)
            }
        };

        let log_path = self
            .workspace
            .resolve(&self.layout.log)
            .and_then(|path| append_entry(&path, &entry).map(|()| path));
        let log_path = match log_path {
            Ok(path) => Some(path),
            Err(err) => {
                self.reporter
                    .warn(&format!("Failed to append apply log: {err:#}"), None);
                None
            }
        };

        info!(
            status = entry.status.as_str(),
            exit_code = entry.exit_code,
            applied = entry.summary.applied,
            conflicts = entry.summary.conflicts,
            skipped = entry.summary.skipped,
            "Apply finished"
        );
        ApplyOutcome { entry, log_path }
    }

    fn execute(&self, flags: ApplyFlags, confirm: Option<&dyn Confirm>) -> Result<ApplyLogEntry> {
        let plan = Plan::load(self.workspace, &self.layout.plan).context(
            ApplyError::UnreadablePlan {
                path: self.layout.plan.clone(),
            },
        )?;
        let Some(plan) = plan else {
            self.reporter.info("No apply plan found; nothing to do", None);
            return Ok(ApplyLogEntry::new(
                ApplyLogStatus::Skipped,
                exit_codes::SUCCESS,
                flags,
            ));
        };

        let report = validate_plan(&plan, self.layout);
        for warning in &report.warnings {
            self.reporter.warn(warning, None);
        }
        if !report.is_ok() {
            return Err(ApplyError::InvalidPlan {
                errors: report.errors,
            }
            .into());
        }
        if plan.is_empty() {
            return Ok(ApplyLogEntry::new(
                ApplyLogStatus::Skipped,
                exit_codes::SUCCESS,
                flags,
            ));
        }

        let preview = self
            .workspace
            .dry_run(|workspace| self.process(workspace, &plan, flags, flags.dry_run))?;
        let expected = ApplySummary::from_records(&preview.result);

        if flags.dry_run {
            let (status, exit_code) = outcome_status(&expected);
            self.reporter.info(
                &format!(
                    "Dry run: {} file(s) would change, {} conflict(s)",
                    preview.manifest.len(),
                    expected.conflicts
                ),
                None,
            );
            return Ok(ApplyLogEntry::new(status, exit_code, flags)
                .with_records(preview.result)
                .with_actions(preview.manifest.files()));
        }

        if !flags.yes {
            let message = format!(
                "Apply {} change(s) to the workspace ({} potential conflict(s))?",
                plan.len(),
                expected.conflicts
            );
            match confirm {
                Some(prompt) => {
                    if !prompt.confirm(&message)? {
                        self.reporter.info("Apply declined", None);
                        return Ok(ApplyLogEntry::new(
                            ApplyLogStatus::Cancelled,
                            exit_codes::SUCCESS,
                            flags,
                        )
                        .with_records(skip_all(&plan, "declined")));
                    }
                }
                None => {
                    self.reporter.warn(
                        "Confirmation required: re-run with --yes to apply without a prompt",
                        None,
                    );
                    return Ok(ApplyLogEntry::new(
                        ApplyLogStatus::Skipped,
                        exit_codes::VALIDATION_ERROR,
                        flags,
                    )
                    .with_records(skip_all(&plan, "confirmation-required")));
                }
            }
        }

        self.workspace.begin()?;
        let records = match self.process(self.workspace, &plan, flags, true) {
            Ok(records) => records,
            Err(err) => {
                if let Err(rollback_err) = self.workspace.rollback() {
                    self.reporter
                        .warn(&format!("Rollback failed: {rollback_err}"), None);
                }
                return Err(err);
            }
        };
        let manifest = self.workspace.commit()?;

        let summary = ApplySummary::from_records(&records);
        let (status, exit_code) = outcome_status(&summary);
        Ok(ApplyLogEntry::new(status, exit_code, flags)
            .with_records(records)
            .with_actions(manifest.files()))
    }

    /// Merge every instruction into `workspace`. Conflicts are warned only
    /// when `warn_conflicts` is set, so a preview followed by the real pass
    /// reports each one once.
    fn process(
        &self,
        workspace: &Workspace,
        plan: &Plan,
        flags: ApplyFlags,
        warn_conflicts: bool,
    ) -> Result<Vec<ApplyRecord>> {
        let options = MergeOptions {
            force: flags.force,
            backup: flags.backup,
            backup_suffix: self.layout.backup_suffix.clone(),
        };
        plan.instructions
            .iter()
            .map(|instruction| -> Result<ApplyRecord> {
                let record = self
                    .process_instruction(workspace, instruction, &options, warn_conflicts)
                    .with_context(|| format!("Failed to apply {}", instruction.file))?;
                Ok(record.with_description(instruction.description.clone()))
            })
            .collect()
    }

    fn process_instruction(
        &self,
        workspace: &Workspace,
        instruction: &ApplyInstruction,
        options: &MergeOptions,
        warn_conflicts: bool,
    ) -> Result<ApplyRecord> {
        let file = workspace.key(&instruction.file)?;
        let base_path = instruction
            .base
            .clone()
            .unwrap_or_else(|| self.layout.base_path(&file));
        let base = workspace.read_text(&base_path)?;
        let current = workspace.read_text(&file)?;

        let Some(incoming_path) = &instruction.incoming else {
            return self.delete(workspace, &file, &base_path, base, current, options);
        };
        let Some(incoming) = workspace.read_text(incoming_path)? else {
            return Ok(ApplyRecord::skipped(file, "missing-incoming"));
        };
        if let Some(expected) = &instruction.hash
            && content_hash(incoming.as_bytes()) != *expected
        {
            return Ok(ApplyRecord::skipped(file, "stale-incoming"));
        }

        let merge = workspace.three_way_merge(
            &file,
            base.as_deref().unwrap_or_default(),
            current.as_deref(),
            &incoming,
            options,
        )?;
        if merge.status == MergeStatus::Conflict {
            if warn_conflicts {
                self.reporter.warn(
                    &format!("Conflict in {file}; the file was left untouched"),
                    Some(&json!({ "file": file, "regions": merge.conflicts })),
                );
            }
            return Ok(ApplyRecord::conflict(file, "overlapping-edits"));
        }

        if base.as_deref() != Some(incoming.as_str()) {
            workspace.write(&base_path, &incoming)?;
        }
        if merge.resolution == Resolution::AlreadyApplied {
            return Ok(ApplyRecord::skipped(file, "up-to-date"));
        }
        Ok(ApplyRecord::applied(file, merge.resolution.as_str()).with_backup(merge.backup))
    }

    fn delete(
        &self,
        workspace: &Workspace,
        file: &str,
        base_path: &str,
        base: Option<String>,
        current: Option<String>,
        options: &MergeOptions,
    ) -> Result<ApplyRecord> {
        let Some(current) = current else {
            return Ok(ApplyRecord::skipped(file, "missing-target"));
        };
        if !options.force {
            match base.as_deref() {
                None => return Ok(ApplyRecord::skipped(file, "missing-base")),
                Some(base) if base != current => {
                    return Ok(ApplyRecord::skipped(file, "modified-target"));
                }
                Some(_) => {}
            }
        }

        let backup = workspace.backup(file, &current, options)?;
        workspace.rm(file)?;
        if base.is_some() {
            workspace.rm(base_path)?;
        }
        Ok(ApplyRecord::applied(file, "deleted").with_backup(backup))
    }
}

fn outcome_status(summary: &ApplySummary) -> (ApplyLogStatus, i32) {
    if summary.conflicts > 0 {
        (ApplyLogStatus::Conflict, exit_codes::VALIDATION_ERROR)
    } else {
        (ApplyLogStatus::Success, exit_codes::SUCCESS)
    }
}

fn skip_all(plan: &Plan, reason: &str) -> Vec<ApplyRecord> {
    plan.instructions
        .iter()
        .map(|instruction| {
            ApplyRecord::skipped(instruction.file.clone(), reason)
                .with_description(instruction.description.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let invalid: anyhow::Error = ApplyError::InvalidPlan {
            errors: vec!["bad".into()],
        }
        .into();
        assert_eq!(exit_code_for(&invalid), exit_codes::VALIDATION_ERROR);

        let commit = anyhow::anyhow!("disk full").context(WorkspaceError::Transaction {
            message: "could not commit 'a'".into(),
        });
        assert_eq!(exit_code_for(&commit), exit_codes::TRANSACTION_FAILURE);

        let wrapped = commit.context("outer");
        assert_eq!(exit_code_for(&wrapped), exit_codes::TRANSACTION_FAILURE);

        assert_eq!(
            exit_code_for(&anyhow::anyhow!("boom")),
            exit_codes::UNEXPECTED_ERROR
        );
    }
}
