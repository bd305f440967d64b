//! Frontend/backend address model and the DSN grammar used to describe them.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// The two wire protocols this proxy forwards. A single proxy instance (and its
/// load balancer) only ever deals in one of these at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A frontend or backend address, tagged with the protocol it is reachable over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr)
    }
}

#[derive(Debug, Error)]
pub enum DsnError {
    #[error("invalid endpoint DSN {0:?}: {1}")]
    Malformed(String, url::ParseError),
    #[error("endpoint DSN {0:?} has unsupported scheme {1:?} (expected tcp or udp)")]
    UnsupportedScheme(String, String),
    #[error("endpoint DSN {0:?} is missing a host:port")]
    MissingHost(String),
    #[error("endpoint DSN {0:?}: could not resolve frontend address: {1}")]
    BadFrontend(String, std::net::AddrParseError),
    #[error("endpoint DSN {0:?}: could not resolve backend address {1:?}: {2}")]
    BadBackend(String, String, std::net::AddrParseError),
    #[error("endpoint DSN {0:?} names no backends (at least one `backend=` parameter is required)")]
    NoBackends(String),
}

/// The parsed form of an `endpoints` DSN: `scheme://host:port?backend=host:port&...`.
pub struct Dsn {
    pub protocol: Protocol,
    pub frontend: SocketAddr,
    pub backends: Vec<SocketAddr>,
}

impl FromStr for Dsn {
    type Err = DsnError;

    fn from_str(dsn: &str) -> Result<Self, DsnError> {
        let url = Url::parse(dsn).map_err(|e| DsnError::Malformed(dsn.to_string(), e))?;

        let protocol = match url.scheme() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(DsnError::UnsupportedScheme(dsn.to_string(), other.to_string()));
            }
        };

        let host = url.host_str().ok_or_else(|| DsnError::MissingHost(dsn.to_string()))?;
        let port = url.port().ok_or_else(|| DsnError::MissingHost(dsn.to_string()))?;
        let frontend_str = format!("{host}:{port}");
        let frontend = frontend_str
            .parse()
            .map_err(|e| DsnError::BadFrontend(dsn.to_string(), e))?;

        let mut backends = Vec::new();
        for (key, value) in url.query_pairs() {
            if key == "backend" {
                let addr = value
                    .parse()
                    .map_err(|e| DsnError::BadBackend(dsn.to_string(), value.to_string(), e))?;
                backends.push(addr);
            }
        }

        if backends.is_empty() {
            return Err(DsnError::NoBackends(dsn.to_string()));
        }

        Ok(Dsn { protocol, frontend, backends })
    }
}

impl Dsn {
    pub fn frontend_endpoint(&self) -> Endpoint {
        Endpoint { protocol: self.protocol, addr: self.frontend }
    }

    pub fn backend_endpoints(&self) -> Vec<Endpoint> {
        self.backends
            .iter()
            .map(|addr| Endpoint { protocol: self.protocol, addr: *addr })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_dsn_with_multiple_backends() {
        let dsn: Dsn = "tcp://127.0.0.1:7000?backend=127.0.0.1:7001&backend=127.0.0.1:7002"
            .parse()
            .unwrap();
        assert_eq!(dsn.protocol, Protocol::Tcp);
        assert_eq!(dsn.frontend.to_string(), "127.0.0.1:7000");
        assert_eq!(dsn.backends.len(), 2);
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let err = "quic://127.0.0.1:7000?backend=127.0.0.1:7001".parse::<Dsn>().unwrap_err();
        assert!(matches!(err, DsnError::UnsupportedScheme(_, _)));
    }

    #[test]
    fn rejects_dsn_without_a_backend() {
        let err = "udp://127.0.0.1:5050".parse::<Dsn>().unwrap_err();
        assert!(matches!(err, DsnError::NoBackends(_)));
    }
}
