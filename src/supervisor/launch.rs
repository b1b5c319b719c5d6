//! Launch parameters for the terminal-server subprocess.
//!
//! Builds the argument vector and a minimal environment. Every variable from
//! the supervisor's own environment is stripped via `env_clear()` except the
//! entries in [`ALLOWED_ENV_VARS`], so credentials held by the host process
//! never reach the child.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::output::OutputSettings;
use super::{ExitClass, ExitOutcome};

/// Environment variables inherited by the server process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "LC_ALL", "TMPDIR", "TERM",
];

/// Authentication mode passed to the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// OS account password (server default, no flags).
    #[default]
    System,
    /// SSH keys only.
    SshKeys,
    /// OS password or SSH keys.
    Both,
    /// Authentication disabled.
    None,
}

impl AuthMode {
    fn flags(self) -> &'static [&'static str] {
        match self {
            Self::System => &[],
            Self::SshKeys => &["--enable-ssh-keys", "--disallow-user-password"],
            Self::Both => &["--enable-ssh-keys"],
            Self::None => &["--no-auth"],
        }
    }
}

/// Optional tunnel integration the server should enable itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelIntegration {
    /// Tailscale Serve fronting the server.
    TailscaleServe,
    /// Arbitrary integration flag, passed verbatim.
    Flag(String),
}

impl TunnelIntegration {
    fn flag(&self) -> &str {
        match self {
            Self::TailscaleServe => "--enable-tailscale-serve",
            Self::Flag(flag) => flag,
        }
    }
}

/// Exit-code classification table.
///
/// The mapping of codes to meanings is a property of the server binary, not
/// of the platform, so it is configurable rather than hard-coded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCodeTable(BTreeMap<i32, ExitClass>);

impl Default for ExitCodeTable {
    fn default() -> Self {
        Self(BTreeMap::from([
            (9, ExitClass::PortInUse),
            (126, ExitClass::NotExecutable),
            (127, ExitClass::BinaryMissing),
        ]))
    }
}

impl ExitCodeTable {
    /// Build a table from explicit entries.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = (i32, ExitClass)>) -> Self {
        Self(entries.into_iter().collect())
    }

    /// Classify an exit. Signal deaths and unknown codes are `Other`.
    #[must_use]
    pub fn classify(&self, outcome: &ExitOutcome) -> ExitClass {
        outcome
            .code
            .and_then(|code| self.0.get(&code).copied())
            .unwrap_or(ExitClass::Other)
    }
}

/// Everything needed to launch one server instance.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Server binary path.
    pub binary: PathBuf,
    /// Arguments placed before the generated ones (e.g. a script path).
    pub leading_args: Vec<String>,
    /// Service port.
    pub port: u16,
    /// Bind address.
    pub bind_address: String,
    /// Authentication mode.
    pub auth_mode: AuthMode,
    /// Token allowing local clients to bypass authentication.
    pub local_auth_token: Option<String>,
    /// Tunnel integrations to enable.
    pub tunnels: Vec<TunnelIntegration>,
    /// Arguments appended after the generated ones.
    pub extra_args: Vec<String>,
    /// Variables injected on top of the allowlist.
    pub extra_env: BTreeMap<String, String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Delay between spawn and the liveness probe.
    pub startup_grace: Duration,
    /// Ceiling for graceful shutdown before force-kill.
    pub stop_timeout: Duration,
    /// Exit-code meanings.
    pub exit_codes: ExitCodeTable,
    /// Output draining behavior.
    pub output: OutputSettings,
}

impl LaunchConfig {
    /// Launch configuration with defaults for everything but binary and port.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            binary: binary.into(),
            leading_args: Vec::new(),
            port,
            bind_address: "127.0.0.1".into(),
            auth_mode: AuthMode::default(),
            local_auth_token: None,
            tunnels: Vec::new(),
            extra_args: Vec::new(),
            extra_env: BTreeMap::new(),
            working_dir: None,
            startup_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            exit_codes: ExitCodeTable::default(),
            output: OutputSettings::default(),
        }
    }

    /// Argument vector passed to the server binary.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push("--port".into());
        args.push(self.port.to_string());
        args.push("--bind".into());
        args.push(self.bind_address.clone());
        args.extend(self.auth_mode.flags().iter().map(|&flag| flag.to_owned()));

        if let Some(ref token) = self.local_auth_token {
            args.push("--allow-local-bypass".into());
            args.push("--local-auth-token".into());
            args.push(token.clone());
        }

        args.extend(self.tunnels.iter().map(|t| t.flag().to_owned()));
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Fully configured command with piped output and a minimal environment.
    #[must_use]
    pub fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.build_args());

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(&self.extra_env);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
