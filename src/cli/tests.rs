use clap::Parser;

use super::args::{Cli, Commands, build_cli};

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("gpdeploy").chain(args.iter().copied())).unwrap()
}

#[test]
fn cli_definition_is_consistent() {
    build_cli().debug_assert();
}

#[test]
fn install_flags_parse() {
    let cli = parse(&[
        "install",
        "--dry-run",
        "--host",
        "localhost",
        "--parallel",
        "4",
        "--accept-host-keys",
    ]);
    let Commands::Install(args) = cli.command else {
        panic!("expected install");
    };
    assert!(args.dry_run);
    assert!(args.accept_host_keys);
    assert_eq!(args.host.as_deref(), Some("localhost"));
    assert_eq!(args.parallel, Some(4));
    assert!(!args.is_teardown());
}

#[test]
fn every_teardown_flag_selects_teardown() {
    for flag in ["--clean", "--remove", "--force"] {
        let Commands::Install(args) = parse(&["install", flag]).command else {
            panic!("expected install");
        };
        assert!(args.is_teardown(), "{flag}");
    }
}

#[test]
fn only_force_and_yes_skip_confirmation() {
    let Commands::Install(args) = parse(&["install", "--remove"]).command else {
        panic!("expected install");
    };
    assert!(!args.skip_confirmation());

    let Commands::Install(args) = parse(&["install", "--remove", "-y"]).command else {
        panic!("expected install");
    };
    assert!(args.skip_confirmation());

    let Commands::Install(args) = parse(&["install", "--force"]).command else {
        panic!("expected install");
    };
    assert!(args.skip_confirmation());
}

#[test]
fn global_flags_follow_the_subcommand() {
    let cli = parse(&["status", "--json", "--config", "/etc/gpdeploy.conf", "-v"]);
    assert!(cli.verbose);
    assert_eq!(
        cli.config.as_deref(),
        Some(std::path::Path::new("/etc/gpdeploy.conf"))
    );
    assert!(matches!(cli.command, Commands::Status { json: true }));
}

#[test]
fn non_numeric_parallel_is_rejected() {
    assert!(Cli::try_parse_from(["gpdeploy", "install", "--parallel", "many"]).is_err());
}
