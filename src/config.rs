use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

const ENV_PREFIX: &str = "TCPDELAY_";

#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// The parameters the proxy is constructed with. They remain unchanged for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    /// Applied to every chunk, in both directions.
    pub delay: Duration,
    pub connect_timeout: Option<Duration>,
    pub log_level: LogLevel,
}

impl ProxyConfig {
    pub fn new(listen_port: u16, remote_host: &str, remote_port: u16, delay: Duration) -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.to_owned(),
            listen_port,
            remote_host: remote_host.to_owned(),
            remote_port,
            delay,
            connect_timeout: None,
            log_level: LogLevel::default(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Configuration as given by a single source: every value is optional, missing values are taken from the next
/// source with lower precedence.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub delay_ms: Option<u64>,
    /// A human readable duration, e.g. "3s" or "500ms".
    pub connect_timeout: Option<String>,
    pub log_level: Option<LogLevel>,
}

impl PartialConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let description = path.display().to_string();
        let config_contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(description.clone(), e))?;
        toml::from_str(&config_contents).map_err(|e| ConfigError::Toml(description, e))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError> where F: Fn(&str) -> Option<String> {
        Ok(PartialConfig {
            listen_host: parse_env_toml::<String, _>(&lookup, "LISTEN_HOST")?,
            listen_port: parse_env_toml::<u16, _>(&lookup, "LISTEN_PORT")?,
            remote_host: parse_env_toml::<String, _>(&lookup, "REMOTE_HOST")?,
            remote_port: parse_env_toml::<u16, _>(&lookup, "REMOTE_PORT")?,
            delay_ms: parse_env_toml::<u64, _>(&lookup, "DELAY_MS")?,
            connect_timeout: parse_env_toml::<String, _>(&lookup, "CONNECT_TIMEOUT")?,
            log_level: parse_env_toml::<LogLevel, _>(&lookup, "LOG_LEVEL")?,
        })
    }

    /// Values of `self` take precedence over values of `lower`.
    pub fn or(self, lower: PartialConfig) -> PartialConfig {
        PartialConfig {
            listen_host: self.listen_host.or(lower.listen_host),
            listen_port: self.listen_port.or(lower.listen_port),
            remote_host: self.remote_host.or(lower.remote_host),
            remote_port: self.remote_port.or(lower.remote_port),
            delay_ms: self.delay_ms.or(lower.delay_ms),
            connect_timeout: self.connect_timeout.or(lower.connect_timeout),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    pub fn resolve(self) -> Result<ProxyConfig, ConfigError> {
        let listen_port = self.listen_port.ok_or(ConfigError::Missing("local port"))?;
        let remote_host = self.remote_host.ok_or(ConfigError::Missing("remote host"))?;
        if remote_host.trim().is_empty() {
            return Err(ConfigError::Invalid { key: "remote host", value: remote_host });
        }
        let remote_port = self.remote_port.ok_or(ConfigError::Missing("remote port"))?;
        let connect_timeout = match self.connect_timeout {
            None => None,
            Some(s) => match humantime::parse_duration(&s) {
                Ok(timeout) => Some(timeout),
                Err(_) => return Err(ConfigError::Invalid { key: "connect timeout", value: s }),
            },
        };
        Ok(ProxyConfig {
            listen_host: self.listen_host.unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_owned()),
            listen_port,
            remote_host,
            remote_port,
            delay: Duration::from_millis(self.delay_ms.unwrap_or(0)),
            connect_timeout,
            log_level: self.log_level.unwrap_or_default(),
        })
    }
}

fn quote_str(s: String) -> String {
    format!("\"{}\"", s)
}

trait TomlValue {
    // The default implementation is fine for numbers. Strings need to be quoted to be valid TOML, and so do our
    // own enums, since they are represented by TOML strings.
    fn toml_value_from_str(s: String) -> String {
        s
    }
}

impl TomlValue for u64 {}
impl TomlValue for u16 {}
impl TomlValue for String {
    fn toml_value_from_str(s: String) -> String {
        quote_str(s)
    }
}
impl TomlValue for LogLevel {
    fn toml_value_from_str(s: String) -> String {
        quote_str(s.to_lowercase())
    }
}

#[derive(Deserialize)]
struct DValue<T> {
    value: T,
}

fn parse_env_toml<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError> where
    T: serde::de::DeserializeOwned + TomlValue,
    F: Fn(&str) -> Option<String>,
{
    let env_key = format!("{}{}", ENV_PREFIX, key);
    let env_var = match lookup(&env_key) {
        None => return Ok(None),
        Some(v) => v,
    };
    // The parser only accepts complete TOML documents, so the value is wrapped into a document with a single
    // key-value pair.
    let toml_document = format!("value = {}", T::toml_value_from_str(env_var));
    match toml::from_str::<DValue<T>>(&toml_document) {
        Ok(deserialized) => Ok(Some(deserialized.value)),
        Err(e) => Err(ConfigError::Toml(env_key, e)),
    }
}
