//! TCP: accept, admit, dial, bidirectionally splice.

use std::io;
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::endpoint::{Endpoint, Protocol};
use crate::lb::LoadBalancer;

use super::{is_ignorable, AdmitFn};

/// Listens on `lb.frontend()`, admits each accepted connection, and relays it
/// to a backend chosen by `lb`. `run()` drives the accept loop; `close()`
/// unblocks it and tears down every active relay.
pub struct TcpProxy {
    listener: TcpListener,
    frontend: Endpoint,
    lb: Arc<dyn LoadBalancer>,
    admit: AdmitFn,
    closing: Notify,
}

impl TcpProxy {
    pub async fn bind(lb: Arc<dyn LoadBalancer>, admit: AdmitFn) -> io::Result<TcpProxy> {
        let frontend = lb.frontend();
        debug_assert_eq!(frontend.protocol, Protocol::Tcp);
        let listener = TcpListener::bind(frontend.addr).await?;
        let frontend = Endpoint { protocol: Protocol::Tcp, addr: listener.local_addr()? };
        Ok(TcpProxy { listener, frontend, lb, admit, closing: Notify::new() })
    }

    pub fn frontend(&self) -> Endpoint {
        self.frontend
    }

    /// `notify_one` stores a single permit when nothing is currently waiting,
    /// so a `close()` landing while `run()` is busy admitting/spawning rather
    /// than parked in `select!` still reaches it: the next poll of the
    /// `closing` branch consumes the stored permit immediately instead of
    /// blocking until the next connection arrives.
    pub fn close(&self) {
        self.closing.notify_one();
    }

    /// Accepts connections until `close()` is called or the listener fails.
    pub async fn run(&self) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.closing.notified() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            let (client, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("could not accept on {}: {e}", self.frontend);
                    return Err(e);
                }
            };

            if !(self.admit)(peer.ip()) {
                let mut client = client;
                let _ = client.shutdown().await;
                continue;
            }

            let backend = self.lb.next_backend();
            tokio::spawn(relay(client, peer, backend));
        }
    }
}

/// Dials the backend and splices bytes in both directions. When one direction
/// hits EOF or an error, the still-running copy task is aborted directly
/// rather than woken via a read deadline: the runtime here supports
/// cancellable task handles, so the deadline trick is unnecessary (it remains
/// the documented fallback for runtimes without cancellable reads).
async fn relay(mut client: TcpStream, peer: std::net::SocketAddr, backend_ep: Endpoint) {
    let backend = match TcpStream::connect(backend_ep.addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("could not connect to backend {backend_ep}: {e}");
            let _ = client.shutdown().await;
            return;
        }
    };

    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut backend_rd, mut backend_wr) = backend.into_split();

    let client_to_backend = tokio::spawn(async move {
        let result = tokio::io::copy(&mut client_rd, &mut backend_wr).await;
        let _ = backend_wr.shutdown().await;
        result
    });
    let backend_to_client = tokio::spawn(async move {
        let result = tokio::io::copy(&mut backend_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        result
    });

    let (first, other) = tokio::select! {
        r = client_to_backend => (r, backend_to_client),
        r = backend_to_client => (r, client_to_backend),
    };

    other.abort();
    let second = other.await;

    let first_err = first.ok().and_then(|r| r.err());
    let second_err = second.ok().and_then(|r| r.err());

    if let Some(e) = first_err.or(second_err) {
        if is_ignorable(&e) {
            debug!("tcp relay for {peer} closed: {e}");
        } else {
            error!("tcp relay for {peer} failed: {e}");
        }
    }
}
