//! End-to-end runs against in-memory hosts.

mod common;

use std::time::Duration;

use common::{Rig, entries, seq_of, started_steps, state};
use gpdeploy_engine::RunMode;
use gpdeploy_engine::state::StepEvent;
use gpdeploy_engine::test_support::FakeReply;
use gpdeploy_engine::transport::ChannelKind;
use gpdeploy_runner::{AuthRejection, SshFailure};
use gpdeploy_utils::{ErrorKind, ExitCode, HostStatus, PhaseId, RunState};

#[tokio::test]
async fn single_node_install_uses_loopback_and_appends_key_locally() {
    let rig = Rig::new();
    let report = rig.install(rig.config(&["localhost"])).await;

    assert_eq!(report.exit_code(), ExitCode::SUCCESS, "{:?}", report.result);
    let state = state(&report);
    assert_eq!(state.state, RunState::Complete);
    assert!(state.single_node);

    let kinds = rig.fake.channel_kinds("localhost");
    assert!(!kinds.is_empty());
    assert!(kinds.iter().all(|k| *k == ChannelKind::Loopback));

    let host_setup = started_steps(state, PhaseId::HostSetup);
    assert!(host_setup.iter().any(|s| s == "authorize_local_key"));
    assert!(!host_setup.iter().any(|s| s == "distribute_key"));
    assert_eq!(rig.fake.contacted_hosts(), vec!["localhost".to_string()]);
}

#[tokio::test]
async fn segments_initialize_after_the_coordinator() {
    let rig = Rig::new();
    let report = rig.install(rig.config(&["mdw", "sdw-a", "sdw-b"])).await;

    assert!(report.result.is_ok(), "{:?}", report.result);
    let state = state(&report);
    let coordinator_done = seq_of(state, "mdw", "init_coordinator", StepEvent::Finished).unwrap();
    for segment in ["sdw-a", "sdw-b"] {
        let started = seq_of(state, segment, "init_segment", StepEvent::Started).unwrap();
        assert!(started > coordinator_done, "{segment} started before the coordinator finished");
    }
    assert!(
        state
            .hosts
            .iter()
            .all(|h| h.phase_status(PhaseId::ClusterInit) == HostStatus::Done)
    );
    assert_eq!(rig.fake.live_count(), 0);
}

#[tokio::test]
async fn every_phase_waits_for_the_slowest_host() {
    let rig = Rig::new();
    rig.fake.on_exec(
        Some("sdw2"),
        "df -Pk",
        FakeReply::ok("").after(Duration::from_millis(200)),
    );
    rig.fake.on_exec(
        Some("sdw1"),
        "90-gpdeploy",
        FakeReply::ok("").after(Duration::from_millis(100)),
    );
    let report = rig.install(rig.config(&["mdw", "sdw1", "sdw2"])).await;
    assert!(report.result.is_ok(), "{:?}", report.result);
    let state = state(&report);

    let order = [
        PhaseId::Preflight,
        PhaseId::HostSetup,
        PhaseId::BinaryInstall,
        PhaseId::ClusterInit,
    ];
    for pair in order.windows(2) {
        let last_before = entries(state, pair[0]).map(|e| e.seq).max().unwrap();
        let first_after = entries(state, pair[1]).map(|e| e.seq).min().unwrap();
        assert!(
            first_after > last_before,
            "{} started before {} finished everywhere",
            pair[1],
            pair[0]
        );
    }
}

#[tokio::test]
async fn running_pxf_is_left_alone() {
    let rig = Rig::new();
    rig.fake.on_exec(
        None,
        "pxf cluster status",
        FakeReply::ok("running=yes cluster_dir=yes installed=yes\n"),
    );
    let config = rig.with_pxf(rig.config(&["mdw", "sdw1"]));
    let report = rig.install(config).await;

    assert!(report.result.is_ok(), "{:?}", report.result);
    let state = state(&report);
    assert_eq!(started_steps(state, PhaseId::ExtensionInit), vec!["pxf_inspect"]);
    assert_eq!(rig.fake.exec_count("mdw", "pxf cluster reset"), 0);
    assert_eq!(rig.fake.exec_count("mdw", "pxf cluster prepare"), 0);

    let pxf = &state.extensions["pxf"];
    assert_eq!(pxf.assumed, "STARTED");
    assert!(!pxf.recovered);
}

#[tokio::test]
async fn stopped_pxf_is_reset_when_direct_start_fails() {
    let rig = Rig::new();
    rig.fake.on_exec(
        None,
        "pxf cluster status",
        FakeReply::ok("running=no cluster_dir=yes installed=yes\n"),
    );
    rig.fake.on_exec(None, "pxf cluster start", FakeReply::exit(1, "pxf failed to start"));
    rig.fake.on_exec(None, "pxf cluster start", FakeReply::ok(""));
    let config = rig.with_pxf(rig.config(&["mdw", "sdw1"]));
    let report = rig.install(config).await;

    assert!(report.result.is_ok(), "{:?}", report.result);
    let state = state(&report);
    assert_eq!(
        started_steps(state, PhaseId::ExtensionInit),
        vec![
            "pxf_inspect",
            "pxf_start",
            "pxf_reset",
            "pxf_prepare",
            "pxf_init",
            "pxf_register",
            "pxf_sync",
            "pxf_start",
        ]
    );
    let pxf = &state.extensions["pxf"];
    assert_eq!(pxf.assumed, "REGISTERED");
    assert!(pxf.recovered);
}

#[tokio::test]
async fn stopped_pxf_starts_directly_when_it_can() {
    let rig = Rig::new();
    rig.fake.on_exec(
        None,
        "pxf cluster status",
        FakeReply::ok("running=no cluster_dir=yes installed=yes\n"),
    );
    let config = rig.with_pxf(rig.config(&["mdw", "sdw1"]));
    let report = rig.install(config).await;

    assert!(report.result.is_ok(), "{:?}", report.result);
    let state = state(&report);
    assert_eq!(
        started_steps(state, PhaseId::ExtensionInit),
        vec!["pxf_inspect", "pxf_start"]
    );
    assert!(state.extensions["pxf"].recovered);
}

#[tokio::test]
async fn rejected_login_mid_setup_rolls_back_and_skips_the_rest() {
    let rig = Rig::new();
    rig.fake.on_exec(
        Some("sdw1"),
        "useradd",
        FakeReply::Fail(SshFailure::AuthRejected(AuthRejection::PasswordRejected)),
    );
    rig.fake.on_exec(None, "if [ -e", FakeReply::ok("existed\n"));
    let mut config = rig.config(&["mdw", "sdw1", "sdw2"]);
    // One host at a time: mdw finishes, sdw1 fails, sdw2 is never started.
    config.max_parallel_hosts = 1;
    let report = rig.install(config).await;

    assert_eq!(report.exit_code(), ExitCode::AUTHENTICATION);
    let state = state(&report);
    assert_eq!(state.state, RunState::Failed);
    let error = state.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Authentication);
    assert_eq!(error.host.as_deref(), Some("sdw1"));
    assert_eq!(error.phase, Some(PhaseId::HostSetup));
    assert_eq!(error.step.as_deref(), Some("create_admin_user"));

    // Kernel settings, limits and the coordinator directory were backed up
    // on mdw; each backup is moved back. sdw1 failed before any backup.
    assert_eq!(count_on(&rig, "mdw", "cp -a "), 3);
    assert_eq!(count_on(&rig, "mdw", "&& mv "), 3);
    assert_eq!(count_on(&rig, "sdw1", "cp -a "), 0);

    assert!(entries(state, PhaseId::HostSetup).all(|e| e.host != "sdw2"));
    let sdw2 = state.hosts.iter().find(|h| h.address == "sdw2").unwrap();
    assert_eq!(sdw2.phase_status(PhaseId::HostSetup), HostStatus::Skipped);

    assert_eq!(rig.fake.live_count(), 0);
    assert_eq!(report.credentials.as_ref().unwrap().zero_count(), 1);
}

#[tokio::test]
async fn rejected_login_mid_setup_rolls_back_at_the_default_width() {
    let rig = Rig::new();
    rig.fake.on_exec(
        Some("sdw1"),
        "useradd",
        FakeReply::Fail(SshFailure::AuthRejected(AuthRejection::PasswordRejected)),
    );
    rig.fake.on_exec(None, "if [ -e", FakeReply::ok("existed\n"));
    let report = rig.install(rig.config(&["mdw", "sdw1", "sdw2"])).await;

    assert_eq!(report.exit_code(), ExitCode::AUTHENTICATION);
    let state = state(&report);
    assert_eq!(state.state, RunState::Failed);
    let error = state.error.as_ref().unwrap();
    assert_eq!(error.host.as_deref(), Some("sdw1"));
    assert_eq!(error.step.as_deref(), Some("create_admin_user"));

    // Hosts run side by side, so sdw2 may or may not have started before the
    // failure. Whatever was backed up anywhere is restored.
    let sdw2 = state.hosts.iter().find(|h| h.address == "sdw2").unwrap();
    assert!(matches!(
        sdw2.phase_status(PhaseId::HostSetup),
        HostStatus::Done | HostStatus::Skipped
    ));
    for host in ["mdw", "sdw1", "sdw2"] {
        assert_eq!(
            count_on(&rig, host, "cp -a "),
            count_on(&rig, host, "&& mv "),
            "{host}"
        );
    }
    assert_eq!(count_on(&rig, "mdw", "&& mv "), 3);
    assert_eq!(rig.fake.live_count(), 0);
    assert_eq!(report.credentials.as_ref().unwrap().zero_count(), 1);
}

fn count_on(rig: &Rig, host: &str, needle: &str) -> usize {
    rig.fake
        .commands_for(host)
        .iter()
        .filter(|c| c.contains(needle))
        .count()
}

#[tokio::test]
async fn rejected_login_at_connect_is_not_retried() {
    let rig = Rig::new();
    rig.fake.fail_open(
        "sdw1",
        SshFailure::AuthRejected(AuthRejection::PasswordRejected),
    );
    let mut config = rig.config(&["mdw", "sdw1", "sdw2"]);
    config.max_parallel_hosts = 1;
    config.command_max_retries = 3;
    let report = rig.install(config).await;

    assert_eq!(report.exit_code(), ExitCode::AUTHENTICATION);
    assert_eq!(rig.fake.opens("sdw1"), 1);
    assert_eq!(rig.fake.opens("sdw2"), 0);
    assert!(rig.fake.commands_for("sdw2").is_empty());
    let state = state(&report);
    assert_eq!(state.error.as_ref().unwrap().phase, Some(PhaseId::Preflight));
    assert_eq!(report.credentials.as_ref().unwrap().zero_count(), 1);
}

#[tokio::test]
async fn enabled_madlib_without_a_package_is_refused_up_front() {
    let rig = Rig::new();
    let mut config = rig.config(&["mdw", "sdw1"]);
    config.install_madlib = true;
    let report = rig.install(config).await;

    assert_eq!(report.exit_code(), ExitCode::VALIDATION);
    assert!(report.state.is_none());
    assert!(rig.fake.contacted_hosts().is_empty());
    assert!(rig.prompt.questions().is_empty());
}

#[tokio::test]
async fn dry_run_never_touches_a_host() {
    let rig = Rig::new();
    let mut config = rig.config(&["mdw", "sdw1", "sdw2"]);
    config.dry_run = true;
    config.install_pxf = true;
    let report = rig.install(config).await;

    assert!(report.result.is_ok(), "{:?}", report.result);
    let state = state(&report);
    assert!(state.dry_run);
    assert_eq!(state.state, RunState::Complete);
    assert!(rig.fake.contacted_hosts().is_empty());
    assert!(rig.fake.exec_commands().is_empty());
    assert!(rig.prompt.questions().is_empty());
    for host in &state.hosts {
        assert_eq!(host.phase_status(PhaseId::ClusterInit), HostStatus::Done);
    }
    assert_eq!(report.credentials.as_ref().unwrap().zero_count(), 1);
}

#[tokio::test]
async fn teardown_stops_the_cluster_and_removes_the_install() {
    let rig = Rig::new();
    let report = rig
        .run(
            rig.config(&["mdw", "sdw1"]),
            RunMode::Teardown {
                remove_install: true,
            },
        )
        .await;

    assert!(report.result.is_ok(), "{:?}", report.result);
    let state = state(&report);
    assert_eq!(state.mode, "teardown");
    assert_eq!(rig.fake.exec_count("mdw", "gpstop"), 1);
    for host in ["mdw", "sdw1"] {
        assert_eq!(
            rig.fake.exec_count(host, "rm -rf /usr/local/greenplum-db"),
            1,
            "{host}"
        );
    }
    assert_eq!(entries(state, PhaseId::HostSetup).count(), 0);
}
