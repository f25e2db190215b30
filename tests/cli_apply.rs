mod common;

use assert_cmd::Command;
use kernelgen::apply::stage_actions;
use kernelgen::config::ApplyLayout;
use kernelgen::pipeline::OutputAction;
use kernelgen::workspace::Workspace;
use tempfile::tempdir;

use common::{read_file, write_file};

fn stage_foo(root: &std::path::Path) {
    let workspace = Workspace::open(root).unwrap();
    let actions = vec![OutputAction::Write {
        file: "app/Foo.php".into(),
        contents: "<?php // v2\n".into(),
        description: None,
    }];
    stage_actions(&workspace, &ApplyLayout::default(), &actions).unwrap();
}

fn kernelgen() -> Command {
    Command::cargo_bin("kernelgen").expect("binary present")
}

fn stdout_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

#[test]
fn apply_with_yes_writes_the_staged_files() {
    let temp = tempdir().unwrap();
    stage_foo(temp.path());

    let assert = kernelgen()
        .args(["apply", "--yes", "--root"])
        .arg(temp.path())
        .assert()
        .success();

    assert!(stdout_of(&assert).contains("success: 1 applied, 0 conflict(s), 0 skipped"));
    assert_eq!(read_file(temp.path(), "app/Foo.php").as_deref(), Some("<?php // v2\n"));
    assert!(temp.path().join(".kernelgen-apply.log").is_file());
}

#[test]
fn apply_conflict_exits_with_one() {
    let temp = tempdir().unwrap();
    write_file(temp.path(), "app/Foo.php", "<?php // local\n");
    write_file(temp.path(), ".kernelgen/apply/base/app/Foo.php", "<?php // v1\n");
    stage_foo(temp.path());

    let assert = kernelgen()
        .args(["apply", "-y", "--root"])
        .arg(temp.path())
        .assert()
        .code(1);

    assert!(stdout_of(&assert).contains("conflict: 0 applied, 1 conflict(s)"));
    assert_eq!(read_file(temp.path(), "app/Foo.php").as_deref(), Some("<?php // local\n"));
}

#[test]
fn apply_without_yes_outside_a_terminal_refuses() {
    let temp = tempdir().unwrap();
    stage_foo(temp.path());

    kernelgen()
        .args(["apply", "--root"])
        .arg(temp.path())
        .write_stdin("")
        .assert()
        .code(1);

    assert!(!temp.path().join("app/Foo.php").exists());
}

#[test]
fn custom_config_moves_the_log() {
    let temp = tempdir().unwrap();
    stage_foo(temp.path());
    write_file(
        temp.path(),
        "kernelgen.yaml",
        "version: 1\napply:\n  log: logs/apply.jsonl\n",
    );

    kernelgen()
        .args(["apply", "--yes", "--root"])
        .arg(temp.path())
        .assert()
        .success();

    assert!(temp.path().join("logs/apply.jsonl").is_file());
    assert!(!temp.path().join(".kernelgen-apply.log").exists());
}

#[test]
fn log_prints_recent_entries_as_json_lines() {
    let temp = tempdir().unwrap();
    stage_foo(temp.path());
    for _ in 0..2 {
        kernelgen()
            .args(["apply", "--yes", "--root"])
            .arg(temp.path())
            .assert()
            .success();
    }

    let assert = kernelgen()
        .args(["log", "--limit", "1", "--root"])
        .arg(temp.path())
        .assert()
        .success();

    let stdout = stdout_of(&assert);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(entry["summary"]["skipped"], 1);
}

#[test]
fn plan_validate_reports_invalid_plans() {
    let temp = tempdir().unwrap();
    stage_foo(temp.path());
    kernelgen()
        .args(["plan", "validate", "--root"])
        .arg(temp.path())
        .assert()
        .success();

    write_file(
        temp.path(),
        ".kernelgen/apply/plan.json",
        r#"{"instructions":[{"file":"../escape.php"}]}"#,
    );
    kernelgen()
        .args(["plan", "validate", "--root"])
        .arg(temp.path())
        .assert()
        .failure();
}

#[test]
fn help_describes_every_subcommand() {
    let assert = kernelgen().arg("--help").assert().success();
    let stdout = stdout_of(&assert);
    assert!(stdout.contains("Apply the staged plan to the workspace"));
    assert!(stdout.contains("Inspect the staged apply plan"));
    assert!(stdout.contains("Print apply log entries as JSON lines"));
}
