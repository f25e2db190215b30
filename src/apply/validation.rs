use std::collections::HashSet;

use serde::Serialize;

use super::plan::Plan;
use crate::config::ApplyLayout;
use crate::workspace::normalize_path;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_plan(plan: &Plan, layout: &ApplyLayout) -> ValidationReport {
    let mut report = ValidationReport::default();

    if plan.is_empty() {
        report
            .warnings
            .push("Apply plan contains no instructions".into());
    }

    let mut seen = HashSet::new();
    for (idx, instruction) in plan.instructions.iter().enumerate() {
        let label = format!("Instruction {} ('{}')", idx + 1, instruction.file);

        let file = match check_path(&label, "file", &instruction.file) {
            Ok(file) => file,
            Err(err) => {
                report.errors.push(err);
                continue;
            }
        };
        if !seen.insert(file.clone()) {
            report
                .warnings
                .push(format!("{label}: target is planned more than once"));
        }

        let base = instruction
            .base
            .clone()
            .unwrap_or_else(|| layout.base_path(&file));
        report.merge(validate_source(&label, "base", &base, &file));
        if let Some(incoming) = &instruction.incoming {
            report.merge(validate_source(&label, "incoming", incoming, &file));
            if normalize_path(incoming).ok() == normalize_path(&base).ok() {
                report
                    .warnings
                    .push(format!("{label}: base and incoming point at the same file"));
            }
        }
        if let Some(hash) = &instruction.hash
            && (hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()))
        {
            report
                .errors
                .push(format!("{label}: hash is not a sha256 hex digest"));
        }
    }

    report
}

fn validate_source(label: &str, field: &str, path: &str, target: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    match check_path(label, field, path) {
        Ok(normalized) if normalized == target => report
            .errors
            .push(format!("{label}: {field} path must differ from the target")),
        Ok(_) => {}
        Err(err) => report.errors.push(err),
    }
    report
}

fn check_path(label: &str, field: &str, path: &str) -> Result<String, String> {
    if path.trim().is_empty() {
        return Err(format!("{label}: {field} path cannot be empty"));
    }
    match normalize_path(path) {
        Ok(normalized) if normalized.is_empty() => {
            Err(format!("{label}: {field} path '{path}' names no file"))
        }
        Ok(normalized) => Ok(normalized),
        Err(err) => Err(format!("{label}: {field} {err}")),
    }
}
