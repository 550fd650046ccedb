//! Bin-level smoke tests for commands that need no API key.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd(db: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("rag-arena").unwrap_or_else(|_| unreachable!());
    cmd.arg("--db-path").arg(db);
    cmd
}

#[test]
fn init_then_status() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let db = dir.path().join("arena.db");

    cmd(&db)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"));

    cmd(&db)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sessions: 0"));
}

#[test]
fn init_refuses_overwrite_without_force() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let db = dir.path().join("arena.db");

    cmd(&db).arg("init").assert().success();
    cmd(&db)
        .arg("init")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--force"));
    cmd(&db).args(["init", "--force"]).assert().success();
}

#[test]
fn session_new_and_list() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let db = dir.path().join("arena.db");

    cmd(&db).arg("init").assert().success();
    cmd(&db)
        .args(["session", "new", "--title", "experiments"])
        .assert()
        .success()
        .stdout(predicate::str::contains("experiments"));
    cmd(&db)
        .args(["session", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("experiments"));
}

#[test]
fn status_without_init_fails() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let db = dir.path().join("missing.db");

    cmd(&db)
        .arg("status")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("init"));
}

#[test]
fn run_with_unknown_technique_exits_2() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let db = dir.path().join("arena.db");

    cmd(&db).arg("init").assert().success();
    cmd(&db)
        .env("OPENAI_API_KEY", "test-key")
        .args(["run", "hello", "--techniques", "nonsense"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown technique"));
}
