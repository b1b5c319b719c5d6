//! Unit tests for configuration parsing and conversion.

use std::io::Write;
use std::time::Duration;

use serial_test::serial;

use term_supervisor::config::{SupervisorConfig, LOCAL_TOKEN_ENV};
use term_supervisor::supervisor::{AuthMode, ExitClass, ExitOutcome, TunnelIntegration};
use term_supervisor::AppError;

const MINIMAL: &str = r#"
[server]
binary = "/usr/local/bin/term-server"
"#;

/// A config with only the binary gets every default.
#[test]
fn minimal_config_uses_defaults() {
    let config = SupervisorConfig::from_toml_str(MINIMAL).expect("valid config");

    assert_eq!(config.server.port, 4020);
    assert_eq!(config.server.bind_address, "127.0.0.1");
    assert_eq!(config.server.auth_mode, AuthMode::System);
    assert_eq!(config.recovery.max_consecutive_crashes, 3);
    assert_eq!(config.output.max_line_bytes, 4096);
    assert_eq!(config.control.outbound_buffer, 64);

    let table = config.exit_code_table().expect("table");
    let nine = ExitOutcome {
        code: Some(9),
        signal: None,
    };
    assert_eq!(table.classify(&nine), ExitClass::PortInUse);
}

/// Every section converts into the runtime types.
#[test]
fn full_config_converts() {
    let raw = r#"
[server]
binary = "/usr/local/bin/term-server"
port = 7681
bind_address = "0.0.0.0"
auth_mode = "ssh_keys"
allow_local_bypass = true
local_auth_token = "tok-123"
tailscale_serve = true
tunnel_flags = ["--enable-funnel"]
extra_args = ["--verbose"]
startup_grace_ms = 250
stop_timeout_ms = 1500

[server.env]
TERM_THEME = "dark"

[server.exit_codes]
"98" = "port_in_use"

[recovery]
crash_window_seconds = 30
max_consecutive_crashes = 5
crash_base_delay_ms = 100
health_interval_seconds = 2

[control]
socket_path = "/tmp/control.sock"
reconnect_delay_ms = 300

[output]
max_line_bytes = 1024
noise_prefixes = ["DEBUG"]
"#;
    let config = SupervisorConfig::from_toml_str(raw).expect("valid config");
    let launch = config.launch_config().expect("launch config");

    assert_eq!(launch.port, 7681);
    assert_eq!(launch.auth_mode, AuthMode::SshKeys);
    assert_eq!(launch.local_auth_token.as_deref(), Some("tok-123"));
    assert_eq!(
        launch.tunnels,
        vec![
            TunnelIntegration::TailscaleServe,
            TunnelIntegration::Flag("--enable-funnel".into())
        ]
    );
    assert_eq!(launch.startup_grace, Duration::from_millis(250));
    assert_eq!(launch.stop_timeout, Duration::from_millis(1500));
    assert_eq!(launch.extra_env.get("TERM_THEME").map(String::as_str), Some("dark"));
    assert_eq!(launch.output.max_line_bytes, 1024);
    assert_eq!(launch.output.noise_prefixes, vec!["DEBUG".to_owned()]);

    let code = |code| ExitOutcome {
        code: Some(code),
        signal: None,
    };
    assert_eq!(launch.exit_codes.classify(&code(98)), ExitClass::PortInUse);
    assert_eq!(launch.exit_codes.classify(&code(9)), ExitClass::Other);

    let policy = config.recovery_policy();
    assert_eq!(policy.crash_window, Duration::from_secs(30));
    assert_eq!(policy.max_consecutive_crashes, 5);
    assert_eq!(policy.crash_base_delay, Duration::from_millis(100));
    assert_eq!(policy.health_interval, Duration::from_secs(2));
    assert_eq!(policy.port_poll_attempts, 5);

    let router = config.router_config();
    assert_eq!(router.socket_path, std::path::PathBuf::from("/tmp/control.sock"));
    assert_eq!(router.reconnect_delay, Duration::from_millis(300));
}

/// The bypass token is ignored unless bypass is enabled.
#[test]
fn token_without_bypass_is_not_passed() {
    let raw = r#"
[server]
binary = "/usr/local/bin/term-server"
local_auth_token = "tok"
"#;
    let config = SupervisorConfig::from_toml_str(raw).expect("valid config");
    assert!(config.launch_config().expect("launch").local_auth_token.is_none());
}

/// Port zero is rejected.
#[test]
fn zero_port_is_rejected() {
    let raw = r#"
[server]
binary = "/usr/local/bin/term-server"
port = 0
"#;
    let err = SupervisorConfig::from_toml_str(raw).expect_err("invalid port");
    assert!(matches!(err, AppError::Config(_)));
}

/// Exit code keys must be integers.
#[test]
fn non_numeric_exit_code_is_rejected() {
    let raw = r#"
[server]
binary = "/usr/local/bin/term-server"

[server.exit_codes]
nine = "port_in_use"
"#;
    let err = SupervisorConfig::from_toml_str(raw).expect_err("bad key");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("nine")));
}

/// A crash ceiling of zero is rejected.
#[test]
fn zero_crash_ceiling_is_rejected() {
    let raw = r#"
[server]
binary = "/usr/local/bin/term-server"

[recovery]
max_consecutive_crashes = 0
"#;
    assert!(SupervisorConfig::from_toml_str(raw).is_err());
}

/// A missing `[server]` section is a parse error.
#[test]
fn missing_server_section_is_rejected() {
    let err = SupervisorConfig::from_toml_str("[recovery]\n").expect_err("no server");
    assert!(matches!(err, AppError::Config(_)));
}

/// Configuration loads from a file.
#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(MINIMAL.as_bytes()).expect("write");

    let config = SupervisorConfig::load_from_path(file.path()).expect("load");
    assert_eq!(config.server.port, 4020);

    let missing = SupervisorConfig::load_from_path(file.path().with_extension("absent"));
    assert!(matches!(missing, Err(AppError::Config(_))));
}

/// With bypass on and no token in the file, the environment supplies it.
#[test]
#[serial]
fn bypass_token_falls_back_to_env() {
    let raw = r#"
[server]
binary = "/usr/local/bin/term-server"
allow_local_bypass = true
"#;
    let mut config = SupervisorConfig::from_toml_str(raw).expect("valid config");

    std::env::set_var(LOCAL_TOKEN_ENV, "from-env");
    let loaded = config.load_local_auth_token();
    std::env::remove_var(LOCAL_TOKEN_ENV);

    loaded.expect("token from env");
    assert_eq!(config.server.local_auth_token.as_deref(), Some("from-env"));
}

/// With bypass on and no token anywhere, loading fails.
#[test]
#[serial]
fn bypass_without_token_fails() {
    let raw = r#"
[server]
binary = "/usr/local/bin/term-server"
allow_local_bypass = true
"#;
    let mut config = SupervisorConfig::from_toml_str(raw).expect("valid config");
    std::env::remove_var(LOCAL_TOKEN_ENV);
    assert!(matches!(
        config.load_local_auth_token(),
        Err(AppError::Config(_))
    ));
}
