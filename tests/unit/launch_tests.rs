//! Unit tests for server launch arguments and exit classification.

use term_supervisor::supervisor::{
    AuthMode, ExitClass, ExitCodeTable, ExitOutcome, LaunchConfig, TunnelIntegration,
};

fn position(args: &[String], needle: &str) -> Option<usize> {
    args.iter().position(|a| a == needle)
}

/// Port and bind address are always passed.
#[test]
fn default_args_carry_port_and_bind() {
    let config = LaunchConfig::new("/opt/term/server", 4020);
    assert_eq!(
        config.build_args(),
        vec!["--port", "4020", "--bind", "127.0.0.1"]
    );
}

/// Each auth mode maps to its flags.
#[test]
fn auth_mode_flags() {
    let mut config = LaunchConfig::new("/opt/term/server", 4020);

    config.auth_mode = AuthMode::None;
    assert!(config.build_args().contains(&"--no-auth".to_owned()));

    config.auth_mode = AuthMode::SshKeys;
    let args = config.build_args();
    assert!(args.contains(&"--enable-ssh-keys".to_owned()));
    assert!(args.contains(&"--disallow-user-password".to_owned()));

    config.auth_mode = AuthMode::Both;
    let args = config.build_args();
    assert!(args.contains(&"--enable-ssh-keys".to_owned()));
    assert!(!args.contains(&"--disallow-user-password".to_owned()));
}

/// The bypass token follows its flag.
#[test]
fn local_bypass_token_follows_flag() {
    let mut config = LaunchConfig::new("/opt/term/server", 4020);
    config.local_auth_token = Some("secret".into());
    let args = config.build_args();

    let flag = position(&args, "--allow-local-bypass").expect("bypass flag");
    assert_eq!(args[flag + 1], "--local-auth-token");
    assert_eq!(args[flag + 2], "secret");
}

/// Leading args come first, extra args last, tunnels in between.
#[test]
fn argument_ordering() {
    let mut config = LaunchConfig::new("/bin/sh", 5000);
    config.leading_args = vec!["-c".into(), "exec server \"$@\"".into(), "server".into()];
    config.tunnels = vec![
        TunnelIntegration::TailscaleServe,
        TunnelIntegration::Flag("--enable-custom-tunnel".into()),
    ];
    config.extra_args = vec!["--verbose".into()];
    let args = config.build_args();

    assert_eq!(args[0], "-c");
    assert_eq!(args.last().map(String::as_str), Some("--verbose"));
    let tailscale = position(&args, "--enable-tailscale-serve").expect("tailscale flag");
    let custom = position(&args, "--enable-custom-tunnel").expect("custom flag");
    assert!(position(&args, "--port").expect("port") < tailscale);
    assert!(tailscale < custom);
}

/// Default table maps the known exit codes.
#[test]
fn default_exit_table() {
    let table = ExitCodeTable::default();
    let exit = |code| ExitOutcome {
        code: Some(code),
        signal: None,
    };

    assert_eq!(table.classify(&exit(9)), ExitClass::PortInUse);
    assert_eq!(table.classify(&exit(126)), ExitClass::NotExecutable);
    assert_eq!(table.classify(&exit(127)), ExitClass::BinaryMissing);
    assert_eq!(table.classify(&exit(1)), ExitClass::Other);
}

/// Signal deaths are never classified by code.
#[test]
fn signal_exit_is_other() {
    let table = ExitCodeTable::default();
    let outcome = ExitOutcome {
        code: None,
        signal: Some(9),
    };
    assert_eq!(table.classify(&outcome), ExitClass::Other);
    assert_eq!(outcome.to_string(), "signal 9");
}

/// A custom table replaces the defaults entirely.
#[test]
fn custom_exit_table() {
    let table = ExitCodeTable::new([(98, ExitClass::PortInUse)]);
    let code = |code| ExitOutcome {
        code: Some(code),
        signal: None,
    };
    assert_eq!(table.classify(&code(98)), ExitClass::PortInUse);
    assert_eq!(table.classify(&code(9)), ExitClass::Other);
}
