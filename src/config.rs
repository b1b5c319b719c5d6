//! Supervisor configuration parsing and validation.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::control::RouterConfig;
use crate::lifecycle::RecoveryPolicy;
use crate::supervisor::output::{default_noise_prefixes, OutputSettings};
use crate::supervisor::{AuthMode, ExitClass, ExitCodeTable, LaunchConfig, TunnelIntegration};
use crate::{AppError, Result};

/// Environment variable consulted for the local bypass token when the config
/// file does not carry one.
pub const LOCAL_TOKEN_ENV: &str = "TERM_SUPERVISOR_LOCAL_TOKEN";

/// `[server]`: how to launch the terminal server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Path to the terminal-server binary.
    pub binary: PathBuf,
    /// Arguments placed before the generated ones.
    #[serde(default)]
    pub leading_args: Vec<String>,
    /// Service port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Authentication mode.
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Let local clients skip authentication with a token.
    #[serde(default)]
    pub allow_local_bypass: bool,
    /// Bypass token; falls back to [`LOCAL_TOKEN_ENV`].
    #[serde(default)]
    pub local_auth_token: Option<String>,
    /// Enable Tailscale Serve in the server.
    #[serde(default)]
    pub tailscale_serve: bool,
    /// Further tunnel flags passed verbatim.
    #[serde(default)]
    pub tunnel_flags: Vec<String>,
    /// Arguments appended after the generated ones.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Variables added to the server environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the server.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Startup grace interval.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Graceful stop ceiling.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Exit-code meanings, keyed by code.
    #[serde(default = "default_exit_codes")]
    pub exit_codes: BTreeMap<String, ExitClass>,
}

fn default_port() -> u16 {
    4020
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_startup_grace_ms() -> u64 {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_exit_codes() -> BTreeMap<String, ExitClass> {
    BTreeMap::from([
        ("9".to_owned(), ExitClass::PortInUse),
        ("126".to_owned(), ExitClass::NotExecutable),
        ("127".to_owned(), ExitClass::BinaryMissing),
    ])
}

/// `[recovery]`: crash recovery and port polling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct RecoveryConfig {
    /// Crashes closer together than this are consecutive.
    pub crash_window_seconds: u64,
    /// Consecutive crashes tolerated before giving up.
    pub max_consecutive_crashes: u32,
    /// Crash backoff base.
    pub crash_base_delay_ms: u64,
    /// Port-in-use backoff base.
    pub port_in_use_base_delay_ms: u64,
    /// Port polls before giving up.
    pub port_poll_attempts: u32,
    /// First port poll delay.
    pub port_poll_base_delay_ms: u64,
    /// Port poll delay ceiling.
    pub port_poll_max_delay_ms: u64,
    /// Bind probes after terminating a stale instance.
    pub conflict_retry_attempts: u32,
    /// First stale-instance probe delay.
    pub conflict_retry_base_delay_ms: u64,
    /// Health polling interval.
    pub health_interval_seconds: u64,
    /// Alternative ports proposed on a foreign conflict.
    pub alternative_port_count: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            crash_window_seconds: 60,
            max_consecutive_crashes: 3,
            crash_base_delay_ms: 2000,
            port_in_use_base_delay_ms: 5000,
            port_poll_attempts: 5,
            port_poll_base_delay_ms: 500,
            port_poll_max_delay_ms: 4000,
            conflict_retry_attempts: 4,
            conflict_retry_base_delay_ms: 200,
            health_interval_seconds: 10,
            alternative_port_count: 3,
        }
    }
}

/// `[control]`: the control socket and the terminal launcher behind it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ControlConfig {
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Delay between connection attempts.
    pub reconnect_delay_ms: u64,
    /// Outbound queue depth.
    pub outbound_buffer: usize,
    /// Program used to open terminals for `terminal/spawn`.
    pub terminal_program: Option<PathBuf>,
    /// Arguments for `terminal_program`.
    pub terminal_args: Vec<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: env::temp_dir().join("term-supervisor.sock"),
            reconnect_delay_ms: 2000,
            outbound_buffer: 64,
            terminal_program: None,
            terminal_args: Vec::new(),
        }
    }
}

/// `[output]`: server output draining.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct OutputConfig {
    /// Chunking threshold in bytes.
    pub max_line_bytes: usize,
    /// Prefixes of lines that are dropped.
    pub noise_prefixes: Vec<String>,
    /// Read size.
    pub read_buffer_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 4096,
            noise_prefixes: default_noise_prefixes(),
            read_buffer_bytes: 8192,
        }
    }
}

/// Configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Server launch settings.
    pub server: ServerConfig,
    /// Recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Control socket settings.
    #[serde(default)]
    pub control: ControlConfig,
    /// Output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

impl SupervisorConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill the local bypass token from [`LOCAL_TOKEN_ENV`] when bypass is
    /// enabled and the file carries no token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if bypass is enabled and no token is
    /// available from either source.
    pub fn load_local_auth_token(&mut self) -> Result<()> {
        if !self.server.allow_local_bypass || self.server.local_auth_token.is_some() {
            return Ok(());
        }

        match env::var(LOCAL_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => {
                self.server.local_auth_token = Some(token);
                Ok(())
            }
            Ok(_) => {
                warn!(var = LOCAL_TOKEN_ENV, "local bypass token variable is empty");
                Err(AppError::Config(format!(
                    "allow_local_bypass requires a token; {LOCAL_TOKEN_ENV} is empty"
                )))
            }
            Err(_) => Err(AppError::Config(format!(
                "allow_local_bypass requires local_auth_token or {LOCAL_TOKEN_ENV}"
            ))),
        }
    }

    /// Parsed exit-code table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a key is not an integer.
    pub fn exit_code_table(&self) -> Result<ExitCodeTable> {
        let entries = self
            .server
            .exit_codes
            .iter()
            .map(|(code, class)| {
                code.trim()
                    .parse::<i32>()
                    .map(|code| (code, *class))
                    .map_err(|_| AppError::Config(format!("exit code key '{code}' is not an integer")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ExitCodeTable::new(entries))
    }

    /// Launch parameters for the supervisor.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the exit-code table is invalid.
    pub fn launch_config(&self) -> Result<LaunchConfig> {
        let server = &self.server;
        let mut launch = LaunchConfig::new(&server.binary, server.port);
        launch.leading_args.clone_from(&server.leading_args);
        launch.bind_address.clone_from(&server.bind_address);
        launch.auth_mode = server.auth_mode;
        launch.local_auth_token = if server.allow_local_bypass {
            server.local_auth_token.clone()
        } else {
            None
        };

        if server.tailscale_serve {
            launch.tunnels.push(TunnelIntegration::TailscaleServe);
        }
        launch.tunnels.extend(
            server
                .tunnel_flags
                .iter()
                .cloned()
                .map(TunnelIntegration::Flag),
        );

        launch.extra_args.clone_from(&server.extra_args);
        launch.extra_env.clone_from(&server.env);
        launch.working_dir.clone_from(&server.working_dir);
        launch.startup_grace = Duration::from_millis(server.startup_grace_ms);
        launch.stop_timeout = Duration::from_millis(server.stop_timeout_ms);
        launch.exit_codes = self.exit_code_table()?;
        launch.output = OutputSettings {
            max_line_bytes: self.output.max_line_bytes,
            noise_prefixes: self.output.noise_prefixes.clone(),
            read_buffer_bytes: self.output.read_buffer_bytes,
        };
        Ok(launch)
    }

    /// Recovery policy for the orchestrator.
    #[must_use]
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        let r = &self.recovery;
        RecoveryPolicy {
            crash_window: Duration::from_secs(r.crash_window_seconds),
            max_consecutive_crashes: r.max_consecutive_crashes,
            crash_base_delay: Duration::from_millis(r.crash_base_delay_ms),
            port_in_use_base_delay: Duration::from_millis(r.port_in_use_base_delay_ms),
            port_poll_attempts: r.port_poll_attempts,
            port_poll_base_delay: Duration::from_millis(r.port_poll_base_delay_ms),
            port_poll_max_delay: Duration::from_millis(r.port_poll_max_delay_ms),
            conflict_retry_attempts: r.conflict_retry_attempts,
            conflict_retry_base_delay: Duration::from_millis(r.conflict_retry_base_delay_ms),
            health_interval: Duration::from_secs(r.health_interval_seconds),
            alternative_port_count: r.alternative_port_count,
        }
    }

    /// Router settings for the control socket.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            socket_path: self.control.socket_path.clone(),
            reconnect_delay: Duration::from_millis(self.control.reconnect_delay_ms),
            outbound_buffer: self.control.outbound_buffer,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.binary.as_os_str().is_empty() {
            return Err(AppError::Config("server.binary must not be empty".into()));
        }

        if self.server.port == 0 {
            return Err(AppError::Config("server.port must be greater than zero".into()));
        }

        if self.server.bind_address.trim().is_empty() {
            return Err(AppError::Config("server.bind_address must not be empty".into()));
        }

        if self.recovery.max_consecutive_crashes == 0 {
            return Err(AppError::Config(
                "recovery.max_consecutive_crashes must be greater than zero".into(),
            ));
        }

        if self.recovery.port_poll_attempts == 0 || self.recovery.conflict_retry_attempts == 0 {
            return Err(AppError::Config(
                "recovery retry attempts must be greater than zero".into(),
            ));
        }

        if self.output.max_line_bytes == 0 || self.output.read_buffer_bytes == 0 {
            return Err(AppError::Config(
                "output buffer sizes must be greater than zero".into(),
            ));
        }

        if self.control.outbound_buffer == 0 {
            return Err(AppError::Config(
                "control.outbound_buffer must be greater than zero".into(),
            ));
        }

        self.exit_code_table()?;
        Ok(())
    }
}
