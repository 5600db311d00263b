use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(String, std::io::Error),
    /// The configuration file or an environment variable is not valid TOML for the expected type.
    Toml(String, toml::de::Error),
    /// A required parameter was not given by any configuration source.
    Missing(&'static str),
    /// A parameter was given, but its value is not acceptable.
    Invalid { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Unable to read file {}: {}", path, e),
            ConfigError::Toml(source, e) => write!(f, "Unable to parse {}: {}", source, e),
            ConfigError::Missing(key) => write!(f, "Missing required parameter: {}", key),
            ConfigError::Invalid { key, value } => write!(f, "Invalid {}: {}", key, value),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug)]
pub enum ProxyError {
    /// Setting up the listening socket or the poll instance failed.
    Io(std::io::Error),
    Config(ConfigError),
    /// The listen address did not resolve to any socket address.
    Resolve(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(error: std::io::Error) -> Self {
        ProxyError::Io(error)
    }
}

impl From<ConfigError> for ProxyError {
    fn from(error: ConfigError) -> Self {
        ProxyError::Config(error)
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "I/O error: {}", e),
            ProxyError::Config(e) => write!(f, "{}", e),
            ProxyError::Resolve(host) => write!(f, "Unable to resolve {}", host),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(e) => Some(e),
            ProxyError::Config(e) => Some(e),
            ProxyError::Resolve(_) => None,
        }
    }
}
