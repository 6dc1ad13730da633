use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::qtunnel::{backoff::BackoffPolicy, tunnel::transport::quic::QuicTuning};

pub const CONFIG_ENV: &str = "QTUNNEL_CONFIG";
const CANDIDATES: [&str; 3] = ["qtunnel.toml", "qtunnel.yaml", "qtunnel.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
        }
    }
}

/// Flag, then `QTUNNEL_CONFIG`, then `qtunnel.{toml,yaml,yml}` in `cwd`.
/// `None` means run on built-in defaults.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        }));
    }

    // clap already maps QTUNNEL_CONFIG into the flag; this covers callers
    // that bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(Some(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            }));
        }
    }

    Ok(discover_config_path(cwd).map(|path| ResolvedConfigPath {
        path,
        source: ConfigPathSource::Cwd,
    }))
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };

    Ok(Config::from_file_config(fc))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub transport: QuicTuning,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_file_config(FileConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub cooldown: Duration,
    pub dial_timeout: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    transport: Option<FileTransport>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTransport {
    handshake_timeout_ms: Option<i64>,
    max_idle_timeout_ms: Option<i64>,
    keep_alive_interval_ms: Option<i64>,
    max_incoming_streams: Option<i64>,
    stream_receive_window: Option<i64>,
    receive_window: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    cooldown_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    backoff: Option<FileBackoff>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBackoff {
    initial_ms: Option<i64>,
    max_ms: Option<i64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => default,
    }
}

fn non_empty(v: Option<String>, default: &str) -> String {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Config {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: non_empty(l.level, "info"),
                format: non_empty(l.format, "text"),
                output: non_empty(l.output, "stderr"),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let mut transport = QuicTuning::default();
        if let Some(t) = fc.transport {
            transport.handshake_timeout = millis(t.handshake_timeout_ms, transport.handshake_timeout);
            transport.max_idle_timeout = millis(t.max_idle_timeout_ms, transport.max_idle_timeout);
            transport.keep_alive_interval =
                millis(t.keep_alive_interval_ms, transport.keep_alive_interval);
            if let Some(n) = t.max_incoming_streams {
                transport.max_incoming_streams = n.clamp(0, u32::MAX as i64) as u32;
            }
            if let Some(n) = t.stream_receive_window.filter(|n| *n > 0) {
                transport.stream_receive_window = n as u64;
            }
            if let Some(n) = t.receive_window.filter(|n| *n > 0) {
                transport.receive_window = n as u64;
            }
        }

        let mut client = ClientConfig {
            cooldown: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        };
        if let Some(c) = fc.client {
            client.cooldown = millis(c.cooldown_ms, client.cooldown);
            client.dial_timeout = millis(c.dial_timeout_ms, client.dial_timeout);
            if let Some(b) = c.backoff {
                client.backoff.initial = millis(b.initial_ms, client.backoff.initial);
                client.backoff.max = millis(b.max_ms, client.backoff.max);
                client.backoff.multiplier = b.multiplier.unwrap_or(client.backoff.multiplier);
                client.backoff.jitter = b.jitter.unwrap_or(client.backoff.jitter);
            }
        }
        client.backoff = client.backoff.sanitized();

        Config {
            logging,
            transport,
            client,
        }
    }
}
