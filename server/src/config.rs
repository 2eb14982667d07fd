//! Server configuration.
//!
//! Loaded from a TOML file; every section has sensible defaults so a config
//! file is only needed to override them.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub workers: WorkersConfig,
    pub connection: ConnectionConfig,
    pub poller: PollerConfig,
    pub logging: LoggingConfig,
    /// Static routes served from the filesystem.
    #[serde(rename = "route")]
    pub routes: Vec<RouteConfig>,
}

/// Listener socket configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ListenerConfig {
    /// Address to listen on.
    pub address: SocketAddr,

    /// Listen backlog.
    pub backlog: u32,

    /// Edge-triggered readiness for client sockets.
    pub edge_triggered: bool,

    /// Edge-triggered readiness for the listener itself.
    pub edge_triggered_listener: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            address: "0.0.0.0:8080".parse().unwrap(),
            backlog: 4096,
            edge_triggered: true,
            edge_triggered_listener: true,
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkersConfig {
    /// Number of worker threads (default: number of CPUs).
    pub threads: Option<usize>,
}

/// Per-connection tuning.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionConfig {
    /// Idle connections are closed after this many milliseconds.
    pub idle_timeout_ms: u64,

    /// Capacity of each outbound buffer segment (e.g. "4KB").
    #[serde(deserialize_with = "deserialize_size")]
    pub segment_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            idle_timeout_ms: 60_000,
            segment_size: 4 * 1024,
        }
    }
}

/// Readiness multiplexer tuning.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PollerConfig {
    /// Minimum capacity of the ready-event buffer.
    pub min_events: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig { min_events: 4096 }
    }
}

/// Logging configuration. The RUST_LOG environment variable takes precedence
/// over `level`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "server=debug".
    pub level: String,

    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// A static route: a URI pattern mapped to a file or a directory.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Exact pattern, or a prefix pattern when it ends with '/'.
    pub pattern: String,

    /// Serve this single file.
    pub file: Option<PathBuf>,

    /// Serve files under this directory; requires a prefix pattern.
    pub directory: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.connection.segment_size == 0 {
            return Err("connection.segment_size must be non-zero".into());
        }
        if self.poller.min_events == 0 {
            return Err("poller.min_events must be non-zero".into());
        }
        for route in &self.routes {
            if route.pattern.is_empty() {
                return Err("route.pattern must not be empty".into());
            }
            match (&route.file, &route.directory) {
                (Some(_), Some(_)) => {
                    return Err(format!(
                        "route '{}' sets both file and directory",
                        route.pattern
                    )
                    .into());
                }
                (None, None) => {
                    return Err(
                        format!("route '{}' sets neither file nor directory", route.pattern)
                            .into(),
                    );
                }
                (None, Some(_)) if !route.pattern.ends_with('/') => {
                    return Err(format!(
                        "directory route '{}' must use a prefix pattern ending in '/'",
                        route.pattern
                    )
                    .into());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.idle_timeout_ms)
    }
}

/// Parse a size string like "4KB" or "1MB" into bytes. Binary units only:
/// the unit names a power-of-two shift, so "4KB" is 4 << 10.
pub fn parse_size(input: &str) -> Result<usize, String> {
    let text = input.trim().to_ascii_uppercase();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(digits_end);
    if digits.is_empty() {
        return Err(format!("size '{input}' must start with a number"));
    }
    let count: usize = digits
        .parse()
        .map_err(|_| format!("size '{input}' is out of range"))?;
    let shift = match unit.trim_start() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        other => return Err(format!("size '{input}' has unknown unit '{other}'")),
    };
    count
        .checked_mul(1usize << shift)
        .ok_or_else(|| format!("size '{input}' overflows"))
}

/// Accept either a bare byte count or a string for [`parse_size`].
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct SizeVisitor;

    impl serde::de::Visitor<'_> for SizeVisitor {
        type Value = usize;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a byte count or a size string like \"4KB\"")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<usize, E> {
            usize::try_from(v).map_err(E::custom)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<usize, E> {
            usize::try_from(v).map_err(E::custom)
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<usize, E> {
            parse_size(v).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(SizeVisitor)
}
