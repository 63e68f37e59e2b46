//! Configuration for the qmand worker.
//!
//! The configuration is stored in `/etc/qmand/config.toml`. Values may be
//! overridden by environment variables using the `QMAND_` prefix and by
//! command-line flags. Once a worker has been built from a [`Config`] it is
//! locked and every setter fails.

use clap::Parser;
use figment::providers::Env;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default server when none is configured.
const DEFAULT_SERVER: &str = "127.0.0.1:11300";
/// Resident memory, in bytes, above which the worker retires.
const DEFAULT_MAX_MEMORY_BYTES: u64 = 20_000_000;
/// Seconds a worker may live before it retires.
const DEFAULT_MAX_LIFETIME_SECS: u64 = 86_400;
const DEFAULT_MAX_TRIES: u32 = 3;
const DEFAULT_BASE_FAILURE_DELAY_SECS: u64 = 60;
/// Longest delay, in seconds, a queue server accepts for `release` and `put`.
pub const MAX_DELAY_SECS: u64 = 4_294_967_295;
const DEFAULT_RECONNECT_AFTER_SECS: u64 = 3;
const DEFAULT_RECONNECT_EVERY_SECS: u64 = 15;
const DEFAULT_BREAK_CHECK_INTERVAL_SECS: u64 = 10;
/// Seconds a queue server may take to accept a connection or answer a request.
const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
/// Priority used to bury jobs whose payload cannot be decoded.
const DEFAULT_PRIORITY: u32 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration has been locked by a running worker.
    #[error("configuration is locked")]
    Locked,
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Runtime configuration for the worker.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct Config {
    /// Queue servers as `host:port`.
    #[serde(default = "default_servers")]
    servers: Vec<String>,
    /// Queues to watch; empty means the server's default queue.
    #[serde(default)]
    watched_queues: Vec<String>,
    #[serde(default = "default_max_memory_bytes")]
    max_memory_bytes: u64,
    #[serde(default = "default_max_lifetime_secs")]
    max_lifetime_secs: u64,
    #[serde(default = "default_max_tries")]
    max_tries: u32,
    #[serde(default = "default_base_failure_delay_secs")]
    base_failure_delay_secs: u64,
    #[serde(default = "default_termination_signals", with = "signal_names")]
    termination_signals: Vec<Signal>,
    #[serde(default = "default_reconnect_after_secs")]
    reconnect_after_secs: u64,
    #[serde(default = "default_reconnect_every_secs")]
    reconnect_every_secs: u64,
    #[serde(default = "default_break_check_interval_secs")]
    break_check_interval_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    io_timeout_secs: u64,
    #[serde(default = "default_priority")]
    default_priority: u32,
    /// Emit logs as JSON lines.
    #[serde(default)]
    log_json: bool,
    #[serde(skip)]
    locked: bool,
}

/// Command-line overrides for configuration values.
#[derive(Debug, Default, Parser, Serialize)]
#[command(name = "qmand", about = "Run a qman queue worker")]
struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE", default_value = Config::DEFAULT_PATH)]
    config: PathBuf,
    /// Queue server to connect to; may be repeated.
    #[arg(long = "server", value_name = "HOST:PORT")]
    servers: Vec<String>,
    /// Queue to watch; may be repeated.
    #[arg(long = "tube", value_name = "NAME")]
    tubes: Vec<String>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn default_servers() -> Vec<String> {
    vec![DEFAULT_SERVER.to_owned()]
}

fn default_max_memory_bytes() -> u64 {
    DEFAULT_MAX_MEMORY_BYTES
}

fn default_max_lifetime_secs() -> u64 {
    DEFAULT_MAX_LIFETIME_SECS
}

fn default_max_tries() -> u32 {
    DEFAULT_MAX_TRIES
}

fn default_base_failure_delay_secs() -> u64 {
    DEFAULT_BASE_FAILURE_DELAY_SECS
}

fn default_termination_signals() -> Vec<Signal> {
    vec![Signal::SIGTERM]
}

fn default_reconnect_after_secs() -> u64 {
    DEFAULT_RECONNECT_AFTER_SECS
}

fn default_reconnect_every_secs() -> u64 {
    DEFAULT_RECONNECT_EVERY_SECS
}

fn default_break_check_interval_secs() -> u64 {
    DEFAULT_BREAK_CHECK_INTERVAL_SECS
}

fn default_io_timeout_secs() -> u64 {
    DEFAULT_IO_TIMEOUT_SECS
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn dedup_signals(signals: impl IntoIterator<Item = Signal>) -> Vec<Signal> {
    let mut unique = Vec::new();
    for signal in signals {
        if !unique.contains(&signal) {
            unique.push(signal);
        }
    }
    unique
}

/// Signals are written by name, e.g. `["SIGTERM", "SIGINT"]`.
mod signal_names {
    use nix::sys::signal::Signal;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(signals: &[Signal], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(signals.iter().map(|s| s.as_str()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Signal>, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let signals = names
            .iter()
            .map(|name| {
                Signal::from_str(name)
                    .map_err(|_| D::Error::custom(format!("unknown signal '{name}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(super::dedup_signals(signals))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            watched_queues: Vec::new(),
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            max_tries: DEFAULT_MAX_TRIES,
            base_failure_delay_secs: DEFAULT_BASE_FAILURE_DELAY_SECS,
            termination_signals: default_termination_signals(),
            reconnect_after_secs: DEFAULT_RECONNECT_AFTER_SECS,
            reconnect_every_secs: DEFAULT_RECONNECT_EVERY_SECS,
            break_check_interval_secs: DEFAULT_BREAK_CHECK_INTERVAL_SECS,
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            default_priority: DEFAULT_PRIORITY,
            log_json: false,
            locked: false,
        }
    }
}

impl Config {
    /// Default location of the worker configuration file.
    pub const DEFAULT_PATH: &'static str = "/etc/qmand/config.toml";

    /// Load the configuration using command-line overrides and environment
    /// variables.
    #[expect(clippy::result_large_err, reason = "propagate figment errors")]
    pub fn load() -> Result<Self, ortho_config::OrthoError> {
        let args = CliArgs::parse();
        Self::from_file_with_cli(&args.config, &args)
    }

    /// Load the configuration from `path`, merging `QMAND_*` environment
    /// variables over file values.
    #[expect(clippy::result_large_err, reason = "propagate figment errors")]
    pub fn from_file(path: &Path) -> Result<Self, ortho_config::OrthoError> {
        Self::from_file_with_cli(path, &CliArgs::default())
    }

    #[expect(clippy::result_large_err, reason = "propagate figment errors")]
    fn from_file_with_cli(path: &Path, cli: &CliArgs) -> Result<Self, ortho_config::OrthoError> {
        let mut fig = ortho_config::load_config_file(path)?.ok_or_else(|| {
            ortho_config::OrthoError::File {
                path: path.to_path_buf(),
                source: Box::new(io::Error::new(
                    io::ErrorKind::NotFound,
                    "Configuration file not found",
                )),
            }
        })?;

        fig = fig.merge(Env::prefixed("QMAND_").split("__"));
        let mut cfg: Self = fig.extract().map_err(ortho_config::OrthoError::from)?;

        if !cli.servers.is_empty() {
            cfg.servers.clone_from(&cli.servers);
        }
        if !cli.tubes.is_empty() {
            cfg.watched_queues.clone_from(&cli.tubes);
        }
        if cli.log_json {
            cfg.log_json = true;
        }
        if cfg.max_tries == 0 {
            tracing::warn!("max_tries of 0 is not usable; falling back to 1");
            cfg.max_tries = 1;
        }
        if cfg.io_timeout_secs == 0 {
            tracing::warn!("io_timeout_secs of 0 is not usable; using the default");
            cfg.io_timeout_secs = DEFAULT_IO_TIMEOUT_SECS;
        }
        if cfg.base_failure_delay_secs > MAX_DELAY_SECS {
            tracing::warn!(
                base_failure_delay_secs = cfg.base_failure_delay_secs,
                "base_failure_delay_secs exceeds the queue's delay range; clamping"
            );
            cfg.base_failure_delay_secs = MAX_DELAY_SECS;
        }
        Ok(cfg)
    }

    /// Freeze the configuration. Subsequent setters return
    /// [`ConfigError::Locked`].
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn check_lock(&self) -> Result<(), ConfigError> {
        if self.locked {
            Err(ConfigError::Locked)
        } else {
            Ok(())
        }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    pub fn watched_queues(&self) -> &[String] {
        &self.watched_queues
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn base_failure_delay(&self) -> Duration {
        Duration::from_secs(self.base_failure_delay_secs)
    }

    pub fn termination_signals(&self) -> &[Signal] {
        &self.termination_signals
    }

    pub fn reconnect_after(&self) -> Duration {
        Duration::from_secs(self.reconnect_after_secs)
    }

    pub fn reconnect_every(&self) -> Duration {
        Duration::from_secs(self.reconnect_every_secs)
    }

    pub fn break_check_interval(&self) -> Duration {
        Duration::from_secs(self.break_check_interval_secs)
    }

    /// Bound on connecting to a queue server and on each request to it.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn default_priority(&self) -> u32 {
        self.default_priority
    }

    pub fn log_json(&self) -> bool {
        self.log_json
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_servers(&mut self, servers: Vec<String>) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.servers = servers;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_watched_queues(&mut self, queues: Vec<String>) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.watched_queues = queues;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_max_memory_bytes(&mut self, bytes: u64) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.max_memory_bytes = bytes;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_max_lifetime(&mut self, lifetime: Duration) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.max_lifetime_secs = lifetime.as_secs();
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked and
    /// [`ConfigError::Invalid`] for zero tries.
    pub fn set_max_tries(&mut self, tries: u32) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        if tries == 0 {
            return Err(ConfigError::Invalid {
                field: "max_tries",
                reason: "must be at least 1",
            });
        }
        self.max_tries = tries;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked and
    /// [`ConfigError::Invalid`] for delays longer than [`MAX_DELAY_SECS`].
    pub fn set_base_failure_delay(&mut self, delay: Duration) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        if delay.as_secs() > MAX_DELAY_SECS {
            return Err(ConfigError::Invalid {
                field: "base_failure_delay",
                reason: "must fit the queue's 32-bit delay range",
            });
        }
        self.base_failure_delay_secs = delay.as_secs();
        Ok(self)
    }

    /// Replace the termination signals, dropping duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_termination_signals(
        &mut self,
        signals: impl IntoIterator<Item = Signal>,
    ) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.termination_signals = dedup_signals(signals);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_reconnect_schedule(
        &mut self,
        after: Duration,
        every: Duration,
    ) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.reconnect_after_secs = after.as_secs();
        self.reconnect_every_secs = every.as_secs();
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_break_check_interval(&mut self, interval: Duration) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.break_check_interval_secs = interval.as_secs();
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked and
    /// [`ConfigError::Invalid`] for a timeout shorter than one second.
    pub fn set_io_timeout(&mut self, timeout: Duration) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        if timeout.as_secs() == 0 {
            return Err(ConfigError::Invalid {
                field: "io_timeout",
                reason: "must be at least one second",
            });
        }
        self.io_timeout_secs = timeout.as_secs();
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] once the configuration is locked.
    pub fn set_default_priority(&mut self, priority: u32) -> Result<&mut Self, ConfigError> {
        self.check_lock()?;
        self.default_priority = priority;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::fs;
    use tempfile::tempdir;

    use test_support::env_guard::EnvVarGuard;

    #[rstest]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.servers(), ["127.0.0.1:11300".to_owned()]);
        assert!(cfg.watched_queues().is_empty());
        assert_eq!(cfg.max_memory_bytes(), 20_000_000);
        assert_eq!(cfg.max_lifetime(), Duration::from_secs(86_400));
        assert_eq!(cfg.max_tries(), 3);
        assert_eq!(cfg.base_failure_delay(), Duration::from_secs(60));
        assert_eq!(cfg.termination_signals(), [Signal::SIGTERM]);
        assert_eq!(cfg.reconnect_after(), Duration::from_secs(3));
        assert_eq!(cfg.reconnect_every(), Duration::from_secs(15));
        assert_eq!(cfg.break_check_interval(), Duration::from_secs(10));
        assert_eq!(cfg.io_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.default_priority(), 1024);
        assert!(!cfg.is_locked());
    }

    #[rstest]
    fn setters_chain_until_locked() {
        let mut cfg = Config::default();
        cfg.set_max_tries(5)
            .and_then(|c| c.set_max_memory_bytes(1_000))
            .expect("unlocked setters succeed");
        assert_eq!(cfg.max_tries(), 5);
        assert_eq!(cfg.max_memory_bytes(), 1_000);

        cfg.lock();
        assert_eq!(cfg.set_max_tries(7).err(), Some(ConfigError::Locked));
        assert_eq!(cfg.max_tries(), 5);
    }

    #[rstest]
    fn zero_tries_are_rejected() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set_max_tries(0),
            Err(ConfigError::Invalid { field: "max_tries", .. })
        ));
    }

    #[rstest]
    #[case(MAX_DELAY_SECS + 1)]
    #[case(1 << 63)]
    fn oversized_failure_delays_are_rejected(#[case] secs: u64) {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set_base_failure_delay(Duration::from_secs(secs)),
            Err(ConfigError::Invalid { field: "base_failure_delay", .. })
        ));
        assert_eq!(cfg.base_failure_delay(), Duration::from_secs(60));
        cfg.set_base_failure_delay(Duration::from_secs(MAX_DELAY_SECS))
            .expect("largest delay is accepted");
        assert_eq!(cfg.base_failure_delay(), Duration::from_secs(MAX_DELAY_SECS));
    }

    #[rstest]
    fn sub_second_io_timeouts_are_rejected() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set_io_timeout(Duration::from_millis(500)),
            Err(ConfigError::Invalid { field: "io_timeout", .. })
        ));
        cfg.set_io_timeout(Duration::from_secs(2)).expect("unlocked");
        assert_eq!(cfg.io_timeout(), Duration::from_secs(2));
    }

    #[rstest]
    fn termination_signals_are_deduplicated() {
        let mut cfg = Config::default();
        cfg.set_termination_signals([Signal::SIGTERM, Signal::SIGINT, Signal::SIGTERM])
            .expect("set signals");
        assert_eq!(cfg.termination_signals(), [Signal::SIGTERM, Signal::SIGINT]);
    }

    proptest! {
        #[test]
        fn every_setter_fails_once_locked(
            bytes in any::<u64>(),
            secs in 0u64..1_000_000,
            tries in 1u32..100,
            priority in any::<u32>(),
        ) {
            let mut cfg = Config::default();
            cfg.lock();
            let before = cfg.clone();
            let secs = Duration::from_secs(secs);
            prop_assert_eq!(cfg.set_max_memory_bytes(bytes).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_max_lifetime(secs).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_max_tries(tries).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_base_failure_delay(secs).err(), Some(ConfigError::Locked));
            prop_assert_eq!(
                cfg.set_termination_signals([Signal::SIGINT]).err(),
                Some(ConfigError::Locked)
            );
            prop_assert_eq!(cfg.set_reconnect_schedule(secs, secs).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_break_check_interval(secs).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_io_timeout(secs).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_default_priority(priority).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_servers(Vec::new()).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg.set_watched_queues(Vec::new()).err(), Some(ConfigError::Locked));
            prop_assert_eq!(cfg, before);
        }
    }

    #[rstest]
    #[serial_test::serial]
    fn loads_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "servers=['10.0.0.1:11300','10.0.0.2:11300']\nwatched_queues=['emails']\n\
             max_tries=5\ntermination_signals=['SIGTERM','SIGINT']",
        )
        .unwrap();
        let _guard = EnvVarGuard::remove("QMAND_MAX_TRIES");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.servers().len(), 2);
        assert_eq!(cfg.watched_queues(), ["emails".to_owned()]);
        assert_eq!(cfg.max_tries(), 5);
        assert_eq!(cfg.termination_signals(), [Signal::SIGTERM, Signal::SIGINT]);
        assert_eq!(cfg.max_memory_bytes(), DEFAULT_MAX_MEMORY_BYTES);
        assert!(!cfg.is_locked());
    }

    #[rstest]
    #[serial_test::serial]
    fn error_when_missing_file() {
        let path = PathBuf::from("/nonexistent/qmand.toml");
        assert!(Config::from_file(&path).is_err());
    }

    #[rstest]
    #[serial_test::serial]
    fn error_with_unknown_signal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "termination_signals=['SIGNOPE']").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[rstest]
    #[serial_test::serial]
    fn env_vars_override_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_tries=5").unwrap();
        let _guard = EnvVarGuard::set("QMAND_MAX_TRIES", "9");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.max_tries(), 9);
    }

    #[rstest]
    #[serial_test::serial]
    fn zero_tries_in_file_fall_back_to_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_tries=0").unwrap();
        let _guard = EnvVarGuard::remove("QMAND_MAX_TRIES");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.max_tries(), 1);
    }

    #[rstest]
    #[serial_test::serial]
    fn oversized_failure_delay_in_file_is_clamped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "base_failure_delay_secs=9223372036854775807").unwrap();
        let _guard = EnvVarGuard::remove("QMAND_BASE_FAILURE_DELAY_SECS");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.base_failure_delay(), Duration::from_secs(MAX_DELAY_SECS));
    }

    /// CLI arguments should take precedence over environment variables
    /// and configuration file values.
    #[rstest]
    #[serial_test::serial]
    fn cli_overrides_env_and_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "watched_queues=['file']").unwrap();
        let _guard = EnvVarGuard::set("QMAND_LOG_JSON", "false");
        let cli = CliArgs {
            config: path.clone(),
            servers: vec!["cli:11300".into()],
            tubes: vec!["cli".into()],
            log_json: true,
        };
        let cfg = Config::from_file_with_cli(&path, &cli).unwrap();
        assert_eq!(cfg.servers(), ["cli:11300".to_owned()]);
        assert_eq!(cfg.watched_queues(), ["cli".to_owned()]);
        assert!(cfg.log_json());
    }
}
