mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use kernelgen::pipeline::{
    ExtensionBuilder, ExtensionHook, ExtensionRegistration, HookResult, Pipeline,
    builder_helper, create_pipeline_extension, fragment_helper,
};
use serde_json::json;
use tempfile::tempdir;

use common::{RecordingReporter, open_workspace, run_options};

type Events = Arc<Mutex<Vec<String>>>;

fn recording_hook(events: &Events, label: &'static str) -> ExtensionHook {
    let events = events.clone();
    ExtensionHook::sync(move |args| {
        events.lock().unwrap().push(format!(
            "{label}@{}:{}",
            args.lifecycle.position, args.lifecycle.extension
        ));
        Ok(HookResult::unchanged())
    })
}

#[test]
fn immediate_registration_adds_helpers_right_away() {
    let pipeline = Pipeline::new();
    pipeline
        .extensions()
        .register(create_pipeline_extension("ext.meta", |handle| {
            handle
                .fragments()
                .register(fragment_helper("ir.meta").apply_sync(|_| Ok(())))?;
            Ok(ExtensionRegistration::Done)
        }))
        .unwrap();

    assert_eq!(pipeline.fragments().known_helpers(), vec!["ir.meta"]);
    assert_eq!(pipeline.extensions().keys(), vec!["ext.meta"]);
}

#[test]
fn failing_register_function_is_not_recorded() {
    let pipeline = Pipeline::new();
    let err = pipeline
        .extensions()
        .register(create_pipeline_extension("ext.broken", |_| {
            bail!("cannot register")
        }))
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot register");
    assert!(pipeline.extensions().keys().is_empty());
}

#[tokio::test]
async fn pending_hooks_run_in_registration_order() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let events: Events = Arc::default();
    let pipeline = Pipeline::new();

    let slow_hook = recording_hook(&events, "slow");
    pipeline
        .extensions()
        .register(create_pipeline_extension("ext.slow", move |_| {
            Ok(ExtensionRegistration::pending(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                anyhow::Ok(Some(slow_hook))
            }))
        }))
        .unwrap();
    let fast_hook = recording_hook(&events, "fast");
    pipeline
        .extensions()
        .register(create_pipeline_extension("ext.fast", move |_| {
            Ok(ExtensionRegistration::pending(async move {
                anyhow::Ok(Some(fast_hook))
            }))
        }))
        .unwrap();

    pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec!["slow@0:ext.slow".to_string(), "fast@1:ext.fast".to_string()]
    );
}

#[tokio::test]
async fn rejected_registration_surfaces_its_own_error() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let workspace = open_workspace(temp.path());
    let pipeline = Pipeline::new();
    pipeline
        .extensions()
        .register(create_pipeline_extension("ext.remote", |_| {
            Ok(ExtensionRegistration::pending(async {
                Err::<Option<ExtensionHook>, _>(anyhow!("schema download failed"))
            }))
        }))
        .unwrap();

    let err = pipeline
        .run(run_options(workspace.clone(), &reporter))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "schema download failed");

    // The failed registration is settled; later runs proceed without it.
    pipeline
        .run(run_options(workspace, &reporter))
        .await
        .unwrap();
}

#[tokio::test]
async fn setup_step_registers_builders_before_the_run() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let pipeline = Pipeline::new();
    pipeline
        .extensions()
        .register(
            ExtensionBuilder::new("ext.php")
                .setup(|handle| async move {
                    handle.builders().register(
                        builder_helper("builder.php.index").apply_sync(|mut args| {
                            args.output()?.queue_write("index.php", "<?php\n");
                            Ok(())
                        }),
                    )?;
                    anyhow::Ok(())
                })
                .build(),
        )
        .unwrap();
    assert!(pipeline.builders().is_empty());

    let result = pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap();

    assert_eq!(pipeline.builders().known_helpers(), vec!["builder.php.index"]);
    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.actions[0].file(), "index.php");
}

#[tokio::test]
async fn hooks_can_replace_the_artifact_seen_by_builders() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let pipeline = Pipeline::new();
    pipeline
        .fragments()
        .register(fragment_helper("ir.meta").apply_sync(|mut args| {
            args.draft()?.insert("name", json!("demo"));
            Ok(())
        }))
        .unwrap();
    pipeline
        .extensions()
        .register(
            ExtensionBuilder::new("ext.rest")
                .hook(ExtensionHook::sync(|args| {
                    let replaced = args.artifact.clone().with("routes", json!(["/items"]));
                    Ok(HookResult::replace(replaced))
                }))
                .build(),
        )
        .unwrap();
    pipeline
        .builders()
        .register(builder_helper("builder.routes").apply_sync(|mut args| {
            let (artifact, output) = args.builder()?;
            let count = artifact
                .get("routes")
                .and_then(|routes| routes.as_array())
                .map_or(0, Vec::len);
            output.queue_write("routes.txt", count.to_string());
            Ok(())
        }))
        .unwrap();

    let result = pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap();

    assert_eq!(result.artifact.get("name"), Some(&json!("demo")));
    assert_eq!(result.artifact.get("routes"), Some(&json!(["/items"])));
    assert_eq!(result.actions.len(), 1);
    assert_eq!(
        result.actions[0],
        kernelgen::pipeline::OutputAction::Write {
            file: "routes.txt".into(),
            contents: "1".into(),
            description: None,
        }
    );
}

fn transactional_hook(events: &Events, label: &'static str) -> ExtensionHook {
    let events = events.clone();
    ExtensionHook::sync(move |_| {
        let on_commit = events.clone();
        let on_rollback = events.clone();
        Ok(HookResult::unchanged()
            .on_commit(move || async move {
                on_commit.lock().unwrap().push(format!("commit:{label}"));
                anyhow::Ok(())
            })
            .on_rollback(move || async move {
                on_rollback.lock().unwrap().push(format!("rollback:{label}"));
                anyhow::Ok(())
            }))
    })
}

#[tokio::test]
async fn builder_failure_rolls_back_hooks_in_reverse() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let events: Events = Arc::default();
    let pipeline = Pipeline::new();
    for (key, label) in [("ext.first", "first"), ("ext.second", "second")] {
        pipeline
            .extensions()
            .register(
                ExtensionBuilder::new(key)
                    .hook(transactional_hook(&events, label))
                    .build(),
            )
            .unwrap();
    }
    pipeline
        .builders()
        .register(builder_helper("builder.broken").apply_sync(|_| bail!("disk full")))
        .unwrap();

    let err = pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap_err();

    assert_eq!(err.root_cause().to_string(), "disk full");
    assert_eq!(
        *events.lock().unwrap(),
        vec!["rollback:second".to_string(), "rollback:first".to_string()]
    );
}

#[tokio::test]
async fn failing_hook_rolls_back_earlier_hooks_only() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let events: Events = Arc::default();
    let pipeline = Pipeline::new();
    pipeline
        .extensions()
        .register(
            ExtensionBuilder::new("ext.first")
                .hook(transactional_hook(&events, "first"))
                .build(),
        )
        .unwrap();
    pipeline
        .extensions()
        .register(
            ExtensionBuilder::new("ext.failing")
                .hook(ExtensionHook::sync(|_| bail!("hook exploded")))
                .build(),
        )
        .unwrap();

    let err = pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "hook exploded");
    assert_eq!(*events.lock().unwrap(), vec!["rollback:first".to_string()]);
}

#[tokio::test]
async fn successful_run_commits_hooks_in_order() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let events: Events = Arc::default();
    let pipeline = Pipeline::new();
    for (key, label) in [("ext.first", "first"), ("ext.second", "second")] {
        pipeline
            .extensions()
            .register(
                ExtensionBuilder::new(key)
                    .hook(transactional_hook(&events, label))
                    .build(),
            )
            .unwrap();
    }

    pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec!["commit:first".to_string(), "commit:second".to_string()]
    );
}

#[tokio::test]
async fn failed_rollback_is_reported_not_raised() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let pipeline = Pipeline::new();
    pipeline
        .extensions()
        .register(
            ExtensionBuilder::new("ext.sticky")
                .hook(ExtensionHook::sync(|_| {
                    Ok(HookResult::unchanged()
                        .on_rollback(|| async { Err::<(), _>(anyhow!("cannot undo")) }))
                }))
                .build(),
        )
        .unwrap();
    pipeline
        .builders()
        .register(builder_helper("builder.broken").apply_sync(|_| bail!("disk full")))
        .unwrap();

    let err = pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap_err();

    assert_eq!(err.root_cause().to_string(), "disk full");
    assert!(
        reporter
            .at("warn")
            .iter()
            .any(|message| message.contains("ext.sticky") && message.contains("cannot undo"))
    );
}

#[tokio::test]
async fn failed_commit_rolls_back_every_hook_in_reverse() {
    let temp = tempdir().unwrap();
    let reporter = RecordingReporter::new();
    let events: Events = Arc::default();
    let pipeline = Pipeline::new();

    let first_events = events.clone();
    pipeline
        .extensions()
        .register(
            ExtensionBuilder::new("ext.first")
                .hook(ExtensionHook::sync(move |_| {
                    let on_rollback = first_events.clone();
                    Ok(HookResult::unchanged()
                        .on_commit(|| async { Err::<(), _>(anyhow!("commit failed")) })
                        .on_rollback(move || async move {
                            on_rollback.lock().unwrap().push("rollback:first".into());
                            anyhow::Ok(())
                        }))
                }))
                .build(),
        )
        .unwrap();
    pipeline
        .extensions()
        .register(
            ExtensionBuilder::new("ext.second")
                .hook(transactional_hook(&events, "second"))
                .build(),
        )
        .unwrap();

    let err = pipeline
        .run(run_options(open_workspace(temp.path()), &reporter))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "commit failed");
    assert_eq!(
        *events.lock().unwrap(),
        vec!["rollback:second".to_string(), "rollback:first".to_string()]
    );
}
