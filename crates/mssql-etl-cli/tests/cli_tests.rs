//! CLI integration tests for mssql-etl.
//!
//! These tests verify argument parsing, offline commands (validate, list,
//! status) and exit codes for error conditions. None of them connect to a
//! database.

use assert_cmd::Command;
use mssql_etl::progress::snapshot_path;
use mssql_etl::{ProgressSnapshot, RunStatus};
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the mssql-etl binary.
fn cmd() -> Command {
    Command::cargo_bin("mssql-etl").unwrap()
}

fn plan_file(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "source: {{host: src-host, database: staging, user: etl}}\n\
         target: {{host: dw-host, database: warehouse, user: etl}}\n\
         {}",
        body
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_global_flags_in_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--progress-dir"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("--verbosity"));
}

#[test]
fn test_resume_requires_migration_id() {
    cmd()
        .arg("resume")
        .assert()
        .failure()
        .stderr(predicate::str::contains("MIGRATION_ID"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-etl"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

// =============================================================================
// Config Error Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_2() {
    cmd()
        .args(["-c", "/nonexistent/plan.yaml", "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot read plan file"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source: [unclosed").unwrap();

    cmd()
        .args(["-c", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2);
}

#[test]
fn test_duplicate_query_ids_exit_with_code_2() {
    let file = plan_file(
        "queries:\n\
         \x20 - {id: q1, source_query: SELECT 1 AS a, target_table: dbo.A}\n\
         \x20 - {id: q1, source_query: SELECT 2 AS a, target_table: dbo.B}\n",
    );

    cmd()
        .args(["-c", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("q1"));
}

// =============================================================================
// Validate Tests
// =============================================================================

#[test]
fn test_validate_accepts_select_queries() {
    let file = plan_file(
        "name: nightly\n\
         variables: {region: EU}\n\
         queries:\n\
         \x20 - id: customers\n\
         \x20   source_query: SELECT id, name FROM customers WHERE region = ${region}\n\
         \x20   target_table: dbo.Customers\n",
    );

    cmd()
        .args(["-c", file.path().to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly"))
        .stdout(predicate::str::contains("customers"))
        .stdout(predicate::str::contains("Validation completed successfully"));
}

#[test]
fn test_validate_rejects_non_select_with_code_4() {
    let file = plan_file(
        "queries:\n\
         \x20 - id: purge\n\
         \x20   source_query: DELETE FROM customers\n\
         \x20   target_table: dbo.Customers\n",
    );

    cmd()
        .args(["-c", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(4)
        .stdout(predicate::str::contains("INVALID"))
        .stdout(predicate::str::contains("SELECT or WITH"));
}

#[test]
fn test_validate_output_json() {
    let file = plan_file(
        "queries:\n\
         \x20 - {id: q1, source_query: SELECT 1 AS a, target_table: dbo.A}\n",
    );

    let output = cmd()
        .args(["-c", file.path().to_str().unwrap(), "--output-json", "validate"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["queries"][0]["query_id"], "q1");
    assert_eq!(report["queries"][0]["valid"], true);
}

// =============================================================================
// Progress Inspection Tests
// =============================================================================

#[test]
fn test_list_empty_progress_dir() {
    let dir = tempfile::tempdir().unwrap();

    cmd()
        .args(["--progress-dir", dir.path().to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded"));
}

#[test]
fn test_list_and_status_show_recorded_run() {
    let dir = tempfile::tempdir().unwrap();
    let id = "migration_20240101_120000_000";
    let mut snapshot = ProgressSnapshot::new(id.to_string(), "abc123".to_string());
    snapshot.register_queries([("q1", "Load customers", "dbo.Customers")]);
    snapshot.status = RunStatus::Failed;
    snapshot.save(snapshot_path(dir.path(), id)).unwrap();

    cmd()
        .args(["--progress-dir", dir.path().to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id))
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("(resumable)"));

    cmd()
        .args(["--progress-dir", dir.path().to_str().unwrap(), "status", id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: FAILED"))
        .stdout(predicate::str::contains("q1"))
        .stdout(predicate::str::contains(format!("mssql-etl resume {}", id)));
}

#[test]
fn test_status_unknown_run_exits_with_code_7() {
    let dir = tempfile::tempdir().unwrap();

    cmd()
        .args([
            "--progress-dir",
            dir.path().to_str().unwrap(),
            "status",
            "migration_missing",
        ])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("no progress file"));
}

#[test]
fn test_status_rejects_tampered_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let id = "migration_20240101_120000_000";
    let path = snapshot_path(dir.path(), id);
    ProgressSnapshot::new(id.to_string(), "abc123".to_string())
        .save(&path)
        .unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("INITIALIZING", "COMPLETED")).unwrap();

    cmd()
        .args(["--progress-dir", dir.path().to_str().unwrap(), "status", id])
        .assert()
        .code(7);
}

#[test]
fn test_validate_demo_plan() {
    let plan = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/plan.yaml");

    cmd()
        .args(["-c", plan.to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly-warehouse-refresh"))
        .stdout(predicate::str::contains("2 dynamic variable(s)"));
}
