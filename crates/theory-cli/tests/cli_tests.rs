// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI surface tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn theory() -> Command {
    Command::cargo_bin("theory").expect("binary builds")
}

#[test]
fn help_lists_subcommands() {
    theory()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("logs"));
}

#[test]
fn run_requires_a_ref() {
    theory().arg("run").assert().failure().code(2);
}

#[test]
fn run_rejects_bad_ref() {
    theory()
        .args(["run", "--ref", "not-a-ref"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad --ref"));
}

#[test]
fn run_unknown_ref_exits_one_with_json_envelope() {
    let tmp = tempfile::tempdir().unwrap();
    theory()
        .env("THEORY_REGISTRY_DIR", tmp.path())
        .env("THEORY_STATE_DIR", tmp.path())
        .args(["run", "--ref", "llm/nosuch@1", "--json"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("ERR_UNKNOWN_REF"));
}

#[test]
fn run_rejects_unknown_mode() {
    theory()
        .args(["run", "--ref", "llm/litellm@1", "--mode", "turbo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown mode"));
}

#[test]
fn url_without_record_fails_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    theory()
        .env("THEORY_STATE_DIR", tmp.path())
        .args(["url", "--ref", "llm/litellm@1"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("no port recorded"));
}

#[test]
fn stop_conflicts_ref_and_all() {
    theory()
        .args(["stop", "--ref", "llm/litellm@1", "--all"])
        .assert()
        .failure()
        .code(2);
}
