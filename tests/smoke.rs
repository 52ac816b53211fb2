//! Smoke tests -- verify the binary runs and every subcommand parses.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("cibench")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("benchmark two-stage CI pipelines"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("cibench")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("cibench"));
}

#[test]
fn test_trigger_subcommand_exists() {
    Command::cargo_bin("cibench")
        .unwrap()
        .args(["trigger", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--wait"));
}

#[test]
fn test_history_subcommands_exist() {
    for sub in ["list", "show", "delete"] {
        Command::cargo_bin("cibench")
            .unwrap()
            .args(["history", sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_bench_subcommands_exist() {
    for sub in ["run", "results", "purge"] {
        Command::cargo_bin("cibench")
            .unwrap()
            .args(["bench", sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_history_list_on_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("cibench.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = \"{}\"\n",
            dir.path().join("c.db").display()
        ),
    )
    .unwrap();

    Command::cargo_bin("cibench")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .args(["history", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No executions found."));
}

#[test]
fn test_trigger_without_credentials_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("cibench.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = \"{}\"\n",
            dir.path().join("c.db").display()
        ),
    )
    .unwrap();

    Command::cargo_bin("cibench")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .env_remove("CIBENCH_TRIGGER_TOKEN")
        .env_remove("CIBENCH_PROJECT_ID")
        .args(["trigger", "hello-world"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not configured"));
}
