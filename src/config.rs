//! Config file loading and parsing of route lists
//!
//! Values given on the command line or through the environment take
//! precedence over the YAML file passed with `--config`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid local '{0}': expected [scheme:]domain:port")]
    InvalidLocal(String),

    #[error("Invalid port forward '{0}': expected from:to, such as 2222:22")]
    InvalidPortForward(String),

    #[error("Invalid bind address '{0}'")]
    InvalidBindAddr(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// Contents of the YAML config file
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    pub relay: RelayFileConfig,
    pub connect: ConnectFileConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RelayFileConfig {
    pub listen: Vec<String>,
    pub secret: Option<String>,
    pub api_hostname: Option<String>,
    pub port_forwards: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub idle_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConnectFileConfig {
    pub relay: Option<String>,
    pub token: Option<String>,
    pub secret: Option<String>,
    pub subject: Option<String>,
    pub locals: Vec<String>,
    pub port_forwards: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub idle_timeout: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }
}

/// A local service exposed through the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    /// `http`, `https`, or any other value for a raw TCP forward
    pub scheme: Option<String>,
    /// Servername pattern; `*` matches every name
    pub domain: String,
    pub port: u16,
}

impl Local {
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidLocal(entry.to_string());

        let parts: Vec<&str> = entry.split(':').collect();
        let (scheme, domain, port) = match parts.as_slice() {
            [domain, port] => (None, *domain, *port),
            [scheme, domain, port] => (Some(scheme.to_ascii_lowercase()), *domain, *port),
            _ => return Err(invalid()),
        };
        if domain.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            domain: domain.to_ascii_lowercase(),
            port: port.parse().map_err(|_| invalid())?,
        })
    }

    /// Wildcard-only locals are not claimed from the relay
    pub fn is_claimable(&self) -> bool {
        self.domain != "*"
    }
}

/// Raw TCP forward from a public port to a local one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    pub from: u16,
    pub to: u16,
}

impl PortForward {
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidPortForward(entry.to_string());
        let (from, to) = entry.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            from: from.parse().map_err(|_| invalid())?,
            to: to.parse().map_err(|_| invalid())?,
        })
    }

    /// Route pattern matching connections on the public port
    pub fn pattern(&self) -> String {
        format!(":{}", self.from)
    }
}

/// Normalize `port`, `:port` or `host:port` into a bindable address
pub fn parse_bind_addr(entry: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidBindAddr(entry.to_string());
    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", entry),
    };
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

/// Flatten list values that may themselves be comma or space separated
pub fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Command-line values when any were given, otherwise the file's
pub fn merge_list(cli: Vec<String>, file: Vec<String>) -> Vec<String> {
    if cli.is_empty() {
        split_list(&file)
    } else {
        split_list(&cli)
    }
}

pub fn parse_all<T>(
    entries: &[String],
    parse: impl Fn(&str) -> Result<T, ConfigError>,
) -> Result<Vec<T>, ConfigError> {
    entries.iter().map(|e| parse(e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_local() {
        assert_eq!(
            Local::parse("https:App.example.com:3000").unwrap(),
            Local {
                scheme: Some("https".to_string()),
                domain: "app.example.com".to_string(),
                port: 3000,
            }
        );
        let plain = Local::parse("ssh.example.com:22").unwrap();
        assert_eq!(plain.scheme, None);
        assert_eq!(plain.port, 22);
        assert!(Local::parse("*:8080").is_ok_and(|l| !l.is_claimable()));

        assert!(Local::parse("example.com").is_err());
        assert!(Local::parse("a:b:c:1").is_err());
        assert!(Local::parse("example.com:http").is_err());
        assert!(Local::parse(":80").is_err());
    }

    #[test]
    fn test_parse_port_forward() {
        let fwd = PortForward::parse("2222:22").unwrap();
        assert_eq!(fwd, PortForward { from: 2222, to: 22 });
        assert_eq!(fwd.pattern(), ":2222");
        assert!(PortForward::parse("2222").is_err());
        assert!(PortForward::parse("a:22").is_err());
        assert!(PortForward::parse("1:2:3").is_err());
    }

    #[test]
    fn test_parse_bind_addr() {
        assert_eq!(parse_bind_addr("443").unwrap(), "0.0.0.0:443");
        assert_eq!(parse_bind_addr(":80").unwrap(), "0.0.0.0:80");
        assert_eq!(parse_bind_addr("localhost:8443").unwrap(), "localhost:8443");
        assert_eq!(parse_bind_addr("[::1]:443").unwrap(), "[::1]:443");
        assert!(parse_bind_addr("a:b:443").is_err());
        assert!(parse_bind_addr("localhost:https").is_err());
    }

    #[test]
    fn test_split_and_merge_lists() {
        let values = vec!["a:1,b:2".to_string(), " c:3  d:4".to_string()];
        assert_eq!(split_list(&values), vec!["a:1", "b:2", "c:3", "d:4"]);

        let file = vec!["file:1".to_string()];
        assert_eq!(merge_list(vec![], file.clone()), vec!["file:1"]);
        assert_eq!(merge_list(vec!["cli:2".to_string()], file), vec!["cli:2"]);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "relay:\n  listen: [\":443\"]\n  secret: s3cret\n  api-hostname: api.example.com\n\
             connect:\n  relay: wss://api.example.com/ws\n  locals:\n    - http:app.example.com:3000\n  idle-timeout: 30\n"
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.relay.listen, vec![":443"]);
        assert_eq!(config.relay.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.relay.api_hostname.as_deref(), Some("api.example.com"));
        assert_eq!(config.connect.locals, vec!["http:app.example.com:3000"]);
        assert_eq!(config.connect.idle_timeout, Some(30));
        assert!(config.connect.port_forwards.is_empty());
    }

    #[test]
    fn test_missing_and_empty_files() {
        assert!(matches!(
            FileConfig::load(Path::new("/nonexistent/burrow.yaml")),
            Err(ConfigError::Read { .. })
        ));
        assert!(FileConfig::parse("").unwrap().relay.listen.is_empty());
        assert!(FileConfig::parse("relay: [1, 2]").is_err());
    }
}
