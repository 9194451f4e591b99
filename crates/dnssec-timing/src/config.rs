//! The settings of one measurement pass.  A `Config` is built once,
//! up front, and every component takes what it needs from it at
//! construction time.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Port used for resolvers and zone transfer servers given without
/// one.
pub const DEFAULT_PORT: u16 = 53;

/// Limit on each network operation: connect, send, and receive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per (domain, type) before a query is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Advertised EDNS(0) UDP payload size.
pub const DEFAULT_EDNS_PAYLOAD_SIZE: u16 = 1232;

/// Capacity of the channel between the query workers and the writer.
pub const DEFAULT_ANSWER_BUFFER: usize = 1000;

/// Capacity of the channel between a zone transfer and its consumer.
pub const ZONE_RECORD_BUFFER: usize = 100;

/// Default number of in-flight domains when measuring a list.
pub const DEFAULT_MEASURE_CONCURRENCY: usize = 50;

/// Default number of in-flight domains when crawling a zone.
pub const DEFAULT_ZONE_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Recursive resolvers, used in turn.
    pub resolvers: Vec<SocketAddr>,

    /// Maximum number of domains being queried at once.
    pub concurrency: usize,

    pub timeout: Duration,

    /// Attempts per query on transport failure, at least 1.
    pub max_attempts: usize,

    pub transport: Transport,

    pub edns_payload_size: u16,

    /// Answers which may be waiting for the writer before the query
    /// workers block.
    pub answer_buffer: usize,
}

impl Config {
    /// A configuration with the default limits.
    ///
    /// # Errors
    ///
    /// If there are no resolvers or the concurrency is zero.
    pub fn new(resolvers: Vec<SocketAddr>, concurrency: usize) -> Result<Self, ConfigError> {
        Self {
            resolvers,
            concurrency,
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            transport: Transport::Tcp,
            edns_payload_size: DEFAULT_EDNS_PAYLOAD_SIZE,
            answer_buffer: DEFAULT_ANSWER_BUFFER,
        }
        .validate()
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, ConfigError> {
        Self { timeout, ..self }.validate()
    }

    pub fn with_max_attempts(self, max_attempts: usize) -> Result<Self, ConfigError> {
        Self {
            max_attempts,
            ..self
        }
        .validate()
    }

    pub fn with_transport(self, transport: Transport) -> Self {
        Self { transport, ..self }
    }

    pub fn with_answer_buffer(self, answer_buffer: usize) -> Result<Self, ConfigError> {
        Self {
            answer_buffer,
            ..self
        }
        .validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.resolvers.is_empty() {
            return Err(ConfigError::NoResolvers);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.answer_buffer == 0 {
            return Err(ConfigError::Zero("answer_buffer"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        Ok(self)
    }
}

/// How queries reach the resolvers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Transport {
    /// UDP, falling back to TCP when a response is truncated.
    Udp,
    Tcp,
}

impl FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            _ => Err(ConfigError::BadTransport(s.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Parse a server address: an IPv4 or IPv6 literal, with an optional
/// port (IPv6 addresses must then be bracketed).
///
/// # Errors
///
/// If the string is neither an address nor an address and port.
pub fn parse_server(s: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    let s = s.trim();
    if let Ok(address) = SocketAddr::from_str(s) {
        return Ok(address);
    }

    let bare = s
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(s);
    IpAddr::from_str(bare)
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| ConfigError::BadServer(s.to_string()))
}

/// Parse every resolver address.
///
/// # Errors
///
/// On the first address which does not parse.
pub fn parse_resolvers<S: AsRef<str>>(resolvers: &[S]) -> Result<Vec<SocketAddr>, ConfigError> {
    resolvers
        .iter()
        .map(|s| parse_server(s.as_ref(), DEFAULT_PORT))
        .collect()
}

/// Errors that can arise when building a `Config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoResolvers,
    BadServer(String),
    BadTransport(String),
    Zero(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::NoResolvers => write!(f, "no resolvers given"),
            ConfigError::BadServer(s) => write!(f, "could not parse server address '{s}'"),
            ConfigError::BadTransport(s) => {
                write!(f, "unknown transport '{s}', expected 'udp' or 'tcp'")
            }
            ConfigError::Zero(field) => write!(f, "{field} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
