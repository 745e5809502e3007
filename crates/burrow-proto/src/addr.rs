//! Logical endpoint addresses carried in frame headers

use std::fmt;

/// Network name reported by virtual tunnel connections
pub const TUNNEL_NETWORK: &str = "tun";

/// Service scheme of an endpoint
///
/// `End` and `Error` never describe a real service. They only appear in the
/// destination slot of a frame to signal that the stream finished or failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Unspecified,
    Http,
    Https,
    Ssh,
    OpenVpn,
    End,
    Error,
    Other(String),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Unspecified => "",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ssh => "ssh",
            Scheme::OpenVpn => "openvpn",
            Scheme::End => "end",
            Scheme::Error => "error",
            Scheme::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "" => Scheme::Unspecified,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "ssh" => Scheme::Ssh,
            "openvpn" => Scheme::OpenVpn,
            "end" => Scheme::End,
            "error" => Scheme::Error,
            other => Scheme::Other(other.to_string()),
        }
    }

    /// True for the `end` and `error` stream signals
    pub fn is_control(&self) -> bool {
        matches!(self, Scheme::End | Scheme::Error)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether TLS for this endpoint has already been terminated upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Termination {
    #[default]
    None,
    Tls,
}

/// Immutable endpoint identity: address family, host, port, scheme and termination mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    family: String,
    host: String,
    port: u16,
    scheme: Scheme,
    termination: Termination,
}

impl Addr {
    pub fn new(family: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            family: family.into(),
            host: host.into(),
            port,
            scheme: Scheme::Unspecified,
            termination: Termination::None,
        }
    }

    /// Build an address from a socket address, picking the family from the IP version
    pub fn from_socket(addr: std::net::SocketAddr) -> Self {
        let family = if addr.is_ipv4() { "IPv4" } else { "IPv6" };
        Self::new(family, addr.ip().to_string(), addr.port())
    }

    /// Destination used to signal a graceful end of stream
    pub fn end() -> Self {
        Self::new("", "", 0).with_scheme(Scheme::End)
    }

    /// Destination used to signal an abnormal end of stream
    pub fn error() -> Self {
        Self::new("", "", 0).with_scheme(Scheme::Error)
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn termination(&self) -> Termination {
        self.termination
    }

    pub fn network(&self) -> &'static str {
        TUNNEL_NETWORK
    }

    /// `host:port`, the form used to key per-client streams
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Canonical map key: `family+scheme:host:port`
    pub fn key(&self) -> String {
        format!(
            "{}+{}:{}:{}",
            self.family, self.scheme, self.host, self.port
        )
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
