use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::plan::{ApplyInstruction, Plan};
use crate::config::ApplyLayout;
use crate::pipeline::{Helper, OutputAction, builder_helper};
use crate::workspace::{Workspace, normalize_path};

pub const PLAN_BUILDER_KEY: &str = "builder.apply.plan";

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stage incoming copies for `actions` and write the plan. When the same
/// file is queued twice the later action wins but keeps the first slot.
pub fn stage_actions(
    workspace: &Workspace,
    layout: &ApplyLayout,
    actions: &[OutputAction],
) -> Result<Plan> {
    let mut plan = Plan::default();
    for action in actions {
        let file = normalize_path(action.file())?;
        let instruction = match action {
            OutputAction::Write {
                contents,
                description,
                ..
            } => {
                let incoming = layout.incoming_path(&file);
                workspace.write(&incoming, contents)?;
                ApplyInstruction {
                    file: file.clone(),
                    base: None,
                    incoming: Some(incoming),
                    description: description.clone(),
                    hash: Some(content_hash(contents.as_bytes())),
                }
            }
            OutputAction::Delete { description, .. } => ApplyInstruction {
                file: file.clone(),
                base: None,
                incoming: None,
                description: description.clone(),
                hash: None,
            },
        };
        match plan
            .instructions
            .iter_mut()
            .find(|existing| existing.file == file)
        {
            Some(existing) => *existing = instruction,
            None => plan.instructions.push(instruction),
        }
    }
    plan.save(workspace, &layout.plan)?;
    debug!(
        instructions = plan.len(),
        plan = layout.plan.as_str(),
        "Staged apply plan"
    );
    Ok(plan)
}

/// Builder helper that stages every action queued by earlier builders.
/// Runs last: lowest possible priority and no dependants expected.
pub fn create_plan_builder(layout: ApplyLayout) -> Helper {
    builder_helper(PLAN_BUILDER_KEY)
        .priority(i32::MIN)
        .origin("kernelgen")
        .apply_sync(move |mut args| {
            let context = args.context;
            let (_, output) = args.builder()?;
            let plan = stage_actions(&context.workspace, &layout, output.actions())?;
            context.reporter.info(
                &format!("Staged {} apply instruction(s)", plan.len()),
                None,
            );
            Ok(())
        })
}
