//! Process-level checks of the `gpdeploy` binary: exit codes, output shape
//! and the state a dry run leaves behind.

use assert_cmd::assert::OutputAssertExt;
use predicates::prelude::*;
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn gpdeploy() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("gpdeploy"));
    cmd.stdin(Stdio::null());
    cmd
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("gpdeploy.conf"), config).unwrap();
        Self { dir }
    }

    fn cmd(&self) -> Command {
        let mut cmd = gpdeploy();
        cmd.current_dir(self.dir.path())
            .env("TEST_TEMP_DIR", self.dir.path())
            .env_remove("GPDEPLOY_CONFIG")
            .env_remove("GPDEPLOY_HOME")
            .env_remove("DRY_RUN")
            .env("RUST_LOG", "off");
        cmd
    }
}

const CLUSTER: &str = "\
GPDB_COORDINATOR_HOST=mdw
GPDB_SEGMENT_HOSTS=(sdw1 sdw2)
INSTALL_PXF=true
";

#[test]
fn help_lists_subcommands() {
    gpdeploy()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("install")
                .and(predicate::str::contains("status"))
                .and(predicate::str::contains("doctor"))
                .and(predicate::str::contains("config")),
        );
}

#[test]
fn missing_explicit_config_is_invalid_input() {
    let ws = Workspace::new(CLUSTER);
    ws.cmd()
        .args(["config", "--config", "does-not-exist.conf"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does-not-exist.conf"));
}

#[test]
fn config_shows_where_values_come_from() {
    let ws = Workspace::new(CLUSTER);
    ws.cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(
            predicate::str::is_match(r"GPDB_COORDINATOR_HOST\s+mdw\s+\[config\]")
                .unwrap()
                .and(predicate::str::is_match(r"GPDB_INSTALL_DIR\s+/usr/local/greenplum-db\s+\[default\]").unwrap()),
        );
}

#[test]
fn dry_run_install_completes_and_is_recorded() {
    let ws = Workspace::new(CLUSTER);
    ws.cmd().args(["install", "--dry-run"]).assert().success();

    ws.cmd()
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"COMPLETE\"")
                .and(predicate::str::contains("\"dry_run\": true"))
                .and(predicate::str::contains("sdw2")),
        );
}

#[test]
fn status_before_any_run_is_empty() {
    let ws = Workspace::new(CLUSTER);
    ws.cmd()
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("{}\n"));
}

#[test]
fn inventory_without_coordinator_is_rejected() {
    let ws = Workspace::new("GPDB_SEGMENT_HOSTS=(sdw1 sdw2)\n");
    ws.cmd()
        .args(["install", "--dry-run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("install failed"));
}

#[test]
fn out_of_range_parallelism_is_rejected() {
    let ws = Workspace::new(CLUSTER);
    ws.cmd()
        .args(["install", "--dry-run", "--parallel", "0"])
        .assert()
        .code(2);
}
