//! UDP: a single frontend socket, one dedicated backend socket per source flow,
//! and a reply loop per flow that demultiplexes backend replies back to the
//! client that opened the flow.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::endpoint::{Endpoint, Protocol};
use crate::lb::LoadBalancer;

use super::AdmitFn;

/// Maximum UDP payload size; a datagram larger than this cannot exist on the wire.
const BUF_SIZE: usize = 65507;
/// Idle timeout for a per-source flow's reply loop.
const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// The source address of a flow, normalized so IPv4 and IPv6 sources never
/// alias: the address is stored as its full 128-bit IPv6 form (IPv4 addresses
/// map into the low bits), plus the source port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct FlowKey {
    ip: u128,
    port: u16,
}

impl From<SocketAddr> for FlowKey {
    fn from(addr: SocketAddr) -> FlowKey {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        FlowKey { ip: u128::from(ip), port: addr.port() }
    }
}

/// A tracked flow: the dedicated backend socket and a handle to abort its
/// reply loop directly, since a `UdpSocket` has no `shutdown()` to force the
/// loop's blocking `recv` to return an error the way closing a `TcpStream`
/// would.
struct FlowEntry {
    socket: Arc<UdpSocket>,
    reply_loop: tokio::task::AbortHandle,
}

type Tracking = Arc<Mutex<HashMap<FlowKey, FlowEntry>>>;

/// Listens on a single frontend UDP socket, maintains a per-source flow table,
/// and spawns one reply-loop task per flow. `run()` drives the accept loop;
/// `close()` stops it and aborts every live reply loop.
pub struct UdpProxy {
    listener: Arc<UdpSocket>,
    frontend: Endpoint,
    lb: Arc<dyn LoadBalancer>,
    admit: AdmitFn,
    tracking: Tracking,
    closing: Notify,
    closed: AtomicBool,
}

impl UdpProxy {
    pub async fn bind(lb: Arc<dyn LoadBalancer>, admit: AdmitFn) -> io::Result<UdpProxy> {
        let frontend_ep = lb.frontend();
        debug_assert_eq!(frontend_ep.protocol, Protocol::Udp);
        let socket = UdpSocket::bind(frontend_ep.addr).await?;
        let frontend = Endpoint { protocol: Protocol::Udp, addr: socket.local_addr()? };
        Ok(UdpProxy {
            listener: Arc::new(socket),
            frontend,
            lb,
            admit,
            tracking: Arc::new(Mutex::new(HashMap::new())),
            closing: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn frontend(&self) -> Endpoint {
        self.frontend
    }

    /// Stops the accept loop and every live reply loop. The accept loop's
    /// wakeup is a stored single permit (`notify_one`), so a `close()` that
    /// lands while `run()` is busy admitting/forwarding rather than parked in
    /// `select!` is not lost: the next poll of the `closing` branch consumes
    /// it immediately. Each reply loop is stopped by aborting its task
    /// directly rather than by forcing a read error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closing.notify_one();
        let mut tracking = self.tracking.lock().expect("udp tracking mutex poisoned");
        for entry in tracking.values() {
            entry.reply_loop.abort();
        }
        tracking.clear();
    }

    /// Reads datagrams until `close()` is called or the listener fails.
    pub async fn run(&self) -> io::Result<()> {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = self.closing.notified() => return Ok(()),
                read = self.listener.recv_from(&mut buf) => read,
            };

            let (n, from) = match read {
                Ok(pair) => pair,
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    warn!("stopping udp proxy on {}: {e}", self.frontend);
                    return Err(e);
                }
            };

            if !(self.admit)(from.ip()) {
                continue;
            }

            let key = FlowKey::from(from);
            let backend_socket = match self.backend_socket_for(key, from).await {
                Some(s) => s,
                None => continue,
            };

            let mut i = 0;
            while i != n {
                match backend_socket.send(&buf[i..n]).await {
                    Ok(written) => i += written,
                    Err(e) => {
                        warn!("could not forward datagram from {from} to backend: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Looks up (or creates) the backend socket for `key`, spawning its reply
    /// loop on creation. The mutex is held only across the map operation, never
    /// across the dial or any I/O.
    async fn backend_socket_for(&self, key: FlowKey, from: SocketAddr) -> Option<Arc<UdpSocket>> {
        let existing = {
            let tracking = self.tracking.lock().expect("udp tracking mutex poisoned");
            tracking.get(&key).map(|entry| entry.socket.clone())
        };
        if let Some(socket) = existing {
            return Some(socket);
        }

        let backend_ep = self.lb.next_backend();
        let socket = match dial(backend_ep.addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("can't proxy a datagram to udp/{backend_ep}: {e}");
                return None;
            }
        };

        let mut tracking = self.tracking.lock().expect("udp tracking mutex poisoned");
        // Another task may have raced us to insert the same key between the
        // lookup above and this lock; prefer whichever entry is already there
        // so a single key never ends up with two live reply loops.
        if let Some(winner) = tracking.get(&key) {
            return Some(winner.socket.clone());
        }
        info!(
            "forwarding {}://{} to {}://{}",
            self.frontend.protocol, self.frontend.addr, backend_ep.protocol, backend_ep.addr
        );
        let handle = tokio::spawn(reply_loop(
            self.listener.clone(),
            socket.clone(),
            from,
            key,
            self.tracking.clone(),
        ));
        tracking.insert(key, FlowEntry { socket: socket.clone(), reply_loop: handle.abort_handle() });
        Some(socket)
    }
}

async fn dial(backend: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if backend.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(backend).await?;
    Ok(socket)
}

/// Reads replies from `backend` and writes them back to `from` via the shared
/// `listener`. Exits (and evicts its table entry) on any error other than
/// ECONNREFUSED, which is tolerated until the overall idle deadline elapses
/// since it may just mean the backend hasn't started listening yet.
async fn reply_loop(
    listener: Arc<UdpSocket>,
    backend: Arc<UdpSocket>,
    from: SocketAddr,
    key: FlowKey,
    tracking: Tracking,
) {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut deadline = tokio::time::Instant::now() + FLOW_IDLE_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            debug!("flow {from} idle timeout");
            break;
        }

        match timeout(remaining, backend.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                deadline = tokio::time::Instant::now() + FLOW_IDLE_TIMEOUT;

                let mut i = 0;
                let mut write_err = false;
                while i != n {
                    match listener.send_to(&buf[i..n], from).await {
                        Ok(written) => i += written,
                        Err(e) => {
                            debug!("could not write reply to {from}: {e}");
                            write_err = true;
                            break;
                        }
                    }
                }
                if write_err {
                    break;
                }
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                // The last write likely elicited an ICMP port-unreachable; the
                // backend may come up before the idle window elapses, so keep
                // polling without resetting the deadline.
                continue;
            }
            Ok(Err(e)) => {
                debug!("flow {from} closed: {e}");
                break;
            }
            Err(_elapsed) => {
                debug!("flow {from} idle timeout");
                break;
            }
        }
    }

    let mut tracking = tracking.lock().expect("udp tracking mutex poisoned");
    if let Some(entry) = tracking.get(&key) {
        if Arc::ptr_eq(&entry.socket, &backend) {
            tracking.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_and_ipv6_sources_on_the_same_port_never_alias() {
        let v4: SocketAddr = "203.0.113.7:4000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::7]:4000".parse().unwrap();
        assert_ne!(FlowKey::from(v4), FlowKey::from(v6));
    }

    #[test]
    fn same_source_produces_the_same_key() {
        let a: SocketAddr = "203.0.113.7:4000".parse().unwrap();
        let b: SocketAddr = "203.0.113.7:4000".parse().unwrap();
        assert_eq!(FlowKey::from(a), FlowKey::from(b));
    }
}
