#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn applytrack_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_applytrack"))
}

fn applytrack_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(applytrack_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run applytrack command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(applytrack_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["job", "stage", "message"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn create_transition_and_show_round_trip() {
    let db_path = std::env::temp_dir().join(format!("applytrack-smoke-{}.sqlite3", Ulid::new()));

    let created = applytrack_output(
        &db_path,
        &["job", "create", "--company", "Acme", "--role", "Engineer"],
    );
    assert!(created.status.success());
    let job = stdout_json(&created);
    let job_id = match job["job_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("expected job_id in create output, got {job}"),
    };
    assert_eq!(job["status"], "discovered");

    let applied = applytrack_output(
        &db_path,
        &[
            "stage",
            "transition",
            "--job-id",
            &job_id,
            "--to",
            "applied",
            "--occurred-at",
            "100",
        ],
    );
    assert!(applied.status.success());
    let event = stdout_json(&applied);
    assert_eq!(event["to_stage"], "applied");
    assert_eq!(event["from_stage"], Value::Null);

    let offer = applytrack_output(
        &db_path,
        &[
            "stage",
            "transition",
            "--job-id",
            &job_id,
            "--to",
            "offer",
            "--occurred-at",
            "200",
        ],
    );
    assert!(offer.status.success());

    let shown = applytrack_output(&db_path, &["job", "show", "--job-id", &job_id]);
    assert!(shown.status.success());
    let record = stdout_json(&shown);
    assert_eq!(record["status"], "in_progress");
    assert_eq!(record["outcome"], "offer_accepted");
    assert_eq!(record["closed_at"], Value::Null);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn message_upsert_signals_auto_link_once() {
    let db_path =
        std::env::temp_dir().join(format!("applytrack-smoke-msg-{}.sqlite3", Ulid::new()));

    let upsert_args = [
        "message",
        "upsert",
        "--provider",
        "gmail",
        "--account-key",
        "primary",
        "--external-message-id",
        "m-1",
        "--subject",
        "Interview invite",
        "--message-type",
        "interview",
        "--status",
        "auto-linked",
    ];

    let first = applytrack_output(&db_path, &upsert_args);
    assert!(first.status.success());
    let result = stdout_json(&first);
    assert_eq!(result["was_created"], true);
    assert_eq!(result["auto_link_transitioned"], true);

    let second = applytrack_output(&db_path, &upsert_args);
    assert!(second.status.success());
    let result = stdout_json(&second);
    assert_eq!(result["was_created"], false);
    assert_eq!(result["auto_link_transitioned"], false);

    let _ = std::fs::remove_file(&db_path);
}
