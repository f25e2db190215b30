use kernelgen::apply::{ApplyInstruction, Plan, content_hash, validate_plan};
use kernelgen::config::ApplyLayout;

fn write(file: &str) -> ApplyInstruction {
    ApplyInstruction {
        file: file.into(),
        base: None,
        incoming: Some(format!(".kernelgen/apply/incoming/{file}")),
        description: None,
        hash: Some(content_hash(file.as_bytes())),
    }
}

#[test]
fn staged_plan_passes() {
    let plan = Plan {
        instructions: vec![write("app/Foo.php"), write("app/Bar.php")],
    };
    let report = validate_plan(&plan, &ApplyLayout::default());
    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    assert!(report.warnings.is_empty());
}

#[test]
fn empty_plan_only_warns() {
    let report = validate_plan(&Plan::default(), &ApplyLayout::default());
    assert!(report.is_ok());
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn escaping_and_empty_paths_are_errors() {
    let mut escaping = write("app/Foo.php");
    escaping.file = "../Foo.php".into();
    let mut blank = write("app/Bar.php");
    blank.file = "  ".into();
    let mut bad_incoming = write("app/Baz.php");
    bad_incoming.incoming = Some("/tmp/Baz.php".into());

    let plan = Plan {
        instructions: vec![escaping, blank, bad_incoming],
    };
    let report = validate_plan(&plan, &ApplyLayout::default());

    assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
    assert!(report.errors[0].contains("outside the workspace root"));
    assert!(report.errors[1].contains("cannot be empty"));
    assert!(report.errors[2].contains("incoming"));
}

#[test]
fn sources_must_differ_from_the_target() {
    let mut instruction = write("app/Foo.php");
    instruction.incoming = Some("./app/Foo.php".into());
    let plan = Plan {
        instructions: vec![instruction],
    };
    let report = validate_plan(&plan, &ApplyLayout::default());
    assert!(!report.is_ok());
    assert!(report.errors[0].contains("must differ from the target"));
}

#[test]
fn malformed_hash_is_an_error() {
    let mut instruction = write("app/Foo.php");
    instruction.hash = Some("not-a-digest".into());
    let plan = Plan {
        instructions: vec![instruction],
    };
    let report = validate_plan(&plan, &ApplyLayout::default());
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("sha256"));
}

#[test]
fn duplicate_targets_and_shared_sources_warn() {
    let mut shared = write("app/Bar.php");
    shared.base = shared.incoming.clone();
    let plan = Plan {
        instructions: vec![write("app/Foo.php"), write("app/./Foo.php"), shared],
    };
    let report = validate_plan(&plan, &ApplyLayout::default());

    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
    assert!(report.warnings[0].contains("more than once"));
    assert!(report.warnings[1].contains("same file"));
}

#[test]
fn deletions_need_no_incoming_copy() {
    let plan = Plan {
        instructions: vec![ApplyInstruction {
            file: "app/Old.php".into(),
            base: None,
            incoming: None,
            description: Some("remove legacy".into()),
            hash: None,
        }],
    };
    assert!(validate_plan(&plan, &ApplyLayout::default()).is_ok());
}
