// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Configuration for the bus binaries (spec.md §6 "Configuration"): a
//! `toml` file read through `serde`, overlaid with `clap`-derived command
//! line flags. The file holds the one thing that can't reasonably live on
//! the command line — the per-token security level table used to derive a
//! client's `SecurityLevel` from whatever it authenticates with on the
//! sideband `AUTHENTICATION` code (spec.md §4.5 "Token levels").

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::global::{
    DEFAULT_HS_IPC_PATH, DEFAULT_NS_IPC_PATH, HB_INTERVAL_MS, HB_RETRIES, HOST_SERVER_TCP_PORT,
    NAME_SERVER_TCP_PORT,
};

/// Default search path for the bus config file, following the same
/// `/tmp/fdb-*` convention as the well-known ipc addresses.
pub const DEFAULT_CONFIG_PATH: &str = "/tmp/fdb-bus.toml";

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    tokens: Vec<TokenLevel>,
    #[serde(default)]
    host_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenLevel {
    pub token: String,
    pub level: i32,
}

/// Parsed contents of the bus config file, plus the fixed addresses every
/// binary needs to find the name server and (optionally) the host server.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    pub tokens: Vec<TokenLevel>,
    pub host_url: Option<String>,
}

impl BusConfig {
    /// Reads `path`, falling back to an empty (no-token, no-host) config if
    /// the file doesn't exist — a missing config is not an error, since the
    /// bus is fully usable with `SECURITY_LEVEL_NONE` everywhere.
    pub fn load(path: impl AsRef<Path>) -> io::Result<BusConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(BusConfig::default());
        }
        let contents = fs::read_to_string(path)?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(BusConfig { tokens: raw.tokens, host_url: raw.host_url })
    }

    /// Security level granted to whoever authenticates with `token`, or
    /// `SECURITY_LEVEL_NONE` if it isn't in the table.
    pub fn level_for_token(&self, token: &str) -> i32 {
        self.tokens
            .iter()
            .find(|t| t.token == token)
            .map(|t| t.level)
            .unwrap_or(crate::global::SECURITY_LEVEL_NONE)
    }
}

use std::io;

/// `fdb_name_server` CLI flags (spec.md §6 "CLI surface": `-n -u -i -m -d`).
#[derive(Debug, clap::Parser)]
#[command(name = "fdb_name_server", about = "fdbus name server")]
pub struct NameServerArgs {
    /// Path to the bus config file (token table).
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Unix-domain address the name server listens on.
    #[arg(long, default_value = DEFAULT_NS_IPC_PATH)]
    pub ipc_path: String,

    /// Also listen on the well-known name-server TCP port, for cross-host
    /// clients reached through a host server.
    #[arg(long)]
    pub tcp: bool,

    #[arg(long, default_value_t = NAME_SERVER_TCP_PORT)]
    pub tcp_port: u16,

    /// `-n <host-name>`: this host's name, advertised to the host server
    /// and to remote clients as the `host_name` of every service it
    /// registers. Defaults to `$HOSTNAME` if unset.
    #[arg(short = 'n', long = "host-name")]
    pub host_name: Option<String>,

    /// `-u <host-server-url>`: host server to register with, if any
    /// (spec.md §4.6 "Host server"). Implies `--tcp`.
    #[arg(short = 'u', long = "host-server")]
    pub host_server: Option<String>,

    /// `-i <ip-list>`: comma-separated IP addresses this host is reachable
    /// on, advertised to the host server as this host's `ip_address`
    /// (spec.md §3 "Host record"). First entry wins if more than one is
    /// given — the core doesn't pick a "best" interface for the caller.
    #[arg(short = 'i', long = "ip-list", value_delimiter = ',')]
    pub ip_list: Vec<String>,

    /// `-m <iface-list>`: network interfaces to bind the TCP listener to,
    /// comma-separated. Not consulted directly by this core (interface ->
    /// address resolution is a platform shim per spec.md §1 "Out of
    /// scope"); kept so a wrapping deployment script has somewhere to pass
    /// it through.
    #[arg(short = 'm', long = "iface-list", value_delimiter = ',')]
    pub iface_list: Vec<String>,

    /// `-d <interval:retries>`: watchdog parameters for the name server's
    /// own main object (spec.md §4.4 "Watchdog"), e.g. `1000:5`.
    #[arg(short = 'd', long = "watchdog")]
    pub watchdog: Option<String>,
}

/// `fdb_host_server` CLI flags.
#[derive(Debug, clap::Parser)]
#[command(name = "fdb_host_server", about = "fdbus host server")]
pub struct HostServerArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[arg(long, default_value = DEFAULT_HS_IPC_PATH)]
    pub ipc_path: String,

    #[arg(long, default_value_t = HOST_SERVER_TCP_PORT)]
    pub tcp_port: u16,

    #[arg(long, default_value_t = HB_INTERVAL_MS)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = HB_RETRIES)]
    pub heartbeat_retries: u32,
}

/// `fdb_log_server` CLI flags.
#[derive(Debug, clap::Parser)]
#[command(name = "fdb_log_server", about = "fdbus log server")]
pub struct LogServerArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Where to append collected log lines; stdout if omitted.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

/// `fdb_log_client` CLI flags: a tiny standalone tool to send one log line
/// through the bus, mostly useful for shell scripts and manual testing.
#[derive(Debug, clap::Parser)]
#[command(name = "fdb_log_client", about = "send a line to the fdbus log server")]
pub struct LogClientArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Tag identifying the source of the log line.
    #[arg(long, default_value = "fdb_log_client")]
    pub tag: String,

    /// The line to log.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let cfg = BusConfig::load("/nonexistent/path/fdb-bus.toml").unwrap();
        assert!(cfg.tokens.is_empty());
        assert_eq!(cfg.level_for_token("anything"), crate::global::SECURITY_LEVEL_NONE);
    }

    #[test]
    fn parses_token_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fdb-bus.toml");
        fs::write(&path, "host_url = \"tcp://127.0.0.1:60000\"\n\n[[tokens]]\ntoken = \"abc\"\nlevel = 2\n").unwrap();
        let cfg = BusConfig::load(&path).unwrap();
        assert_eq!(cfg.host_url.as_deref(), Some("tcp://127.0.0.1:60000"));
        assert_eq!(cfg.level_for_token("abc"), 2);
        assert_eq!(cfg.level_for_token("unknown"), crate::global::SECURITY_LEVEL_NONE);
    }
}
