//! The traffic plane: accept, admit, dial, relay.

pub mod tcp;
pub mod udp;

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

pub use tcp::TcpProxy;
pub use udp::UdpProxy;

use crate::endpoint::Endpoint;

/// The policy function invoked once per new TCP connection and once per
/// first-datagram-of-flow on UDP. Returns whether the flow may proceed.
pub type AdmitFn = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

/// A proxy instance: either protocol, behind one shared capability set. The
/// controller picks which variant to construct from the configured DSN scheme;
/// callers that only need to run/close/observe a proxy don't need to match on it.
pub enum Proxy {
    Tcp(TcpProxy),
    Udp(UdpProxy),
}

impl Proxy {
    pub fn frontend(&self) -> Endpoint {
        match self {
            Proxy::Tcp(p) => p.frontend(),
            Proxy::Udp(p) => p.frontend(),
        }
    }

    /// Runs the accept loop until the proxy is closed or its listener fails.
    pub async fn run(&self) -> io::Result<()> {
        match self {
            Proxy::Tcp(p) => p.run().await,
            Proxy::Udp(p) => p.run().await,
        }
    }

    pub fn close(&self) {
        match self {
            Proxy::Tcp(p) => p.close(),
            Proxy::Udp(p) => p.close(),
        }
    }
}

/// Classifies an I/O error as safe to log quietly (debug) rather than loudly
/// (error): timeouts, resets, refusals, and use of an already-closed socket are
/// all expected outcomes of the network being the network.
pub fn is_ignorable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    ) || is_closed_socket(err)
}

fn is_closed_socket(err: &io::Error) -> bool {
    // `io::ErrorKind` has no stable "socket already closed" variant; match the
    // handful of OS-reported messages that mean exactly that.
    let msg = err.to_string();
    msg.contains("Bad file descriptor") || msg.contains("use of closed network connection")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_and_reset_are_ignorable() {
        assert!(is_ignorable(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_ignorable(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_ignorable(&io::Error::from(io::ErrorKind::TimedOut)));
    }

    #[test]
    fn unexpected_errors_are_not_ignorable() {
        assert!(!is_ignorable(&io::Error::new(io::ErrorKind::Other, "disk full")));
    }
}
