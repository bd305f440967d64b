//! UDP flow tracking: replies are demultiplexed back to the originating
//! client, and a flow's reply loop gives up once it has been idle for the
//! full timeout window.

use std::sync::Arc;
use std::time::Duration;

use geoblock_proxy::endpoint::{Endpoint, Protocol};
use geoblock_proxy::lb::{LoadBalancer, RoundRobin};
use geoblock_proxy::proxy::udp::UdpProxy;
use geoblock_proxy::proxy::AdmitFn;
use tokio::net::UdpSocket;

fn loopback(port: u16) -> std::net::SocketAddr {
    ([127, 0, 0, 1], port).into()
}

async fn fake_backend() -> (Endpoint, UdpSocket) {
    let socket = UdpSocket::bind(loopback(0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    (Endpoint { protocol: Protocol::Udp, addr }, socket)
}

#[tokio::test]
async fn replies_are_routed_back_to_the_client_that_opened_the_flow() {
    let (backend_ep, backend) = fake_backend().await;
    let frontend = Endpoint { protocol: Protocol::Udp, addr: loopback(0) };
    let lb: Arc<dyn LoadBalancer> = Arc::new(RoundRobin::new(frontend, vec![backend_ep]));
    let admit: AdmitFn = Arc::new(|_ip| true);

    let proxy = Arc::new(UdpProxy::bind(lb, admit).await.unwrap());
    let proxy_addr = proxy.frontend().addr;
    {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.run().await });
    }

    let client = UdpSocket::bind(loopback(0)).await.unwrap();
    client.send_to(b"ping", proxy_addr).await.unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = backend.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    backend.send_to(b"pong", from).await.unwrap();

    let mut reply = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut reply))
        .await
        .expect("client should receive the reply")
        .unwrap();
    assert_eq!(&reply[..n], b"pong");
}

#[tokio::test(start_paused = true)]
async fn a_flow_is_evicted_after_ninety_seconds_of_backend_silence() {
    let (backend_ep, backend) = fake_backend().await;
    let frontend = Endpoint { protocol: Protocol::Udp, addr: loopback(0) };
    let lb: Arc<dyn LoadBalancer> = Arc::new(RoundRobin::new(frontend, vec![backend_ep]));
    let admit: AdmitFn = Arc::new(|_ip| true);

    let proxy = Arc::new(UdpProxy::bind(lb, admit).await.unwrap());
    let proxy_addr = proxy.frontend().addr;
    {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.run().await });
    }

    let client = UdpSocket::bind(loopback(0)).await.unwrap();
    client.send_to(b"open the flow", proxy_addr).await.unwrap();

    let mut buf = [0u8; 32];
    let (_, backend_peer) = backend.recv_from(&mut buf).await.unwrap();

    // Let the reply loop's idle deadline elapse without anything arriving.
    tokio::time::advance(Duration::from_secs(91)).await;
    // Give the now-woken reply-loop task a chance to run and evict the flow.
    tokio::task::yield_now().await;

    // A reply sent only now, after eviction, must not reach the client: the
    // socket that would have carried it back is gone.
    backend.send_to(b"too late", backend_peer).await.ok();

    let result = tokio::time::timeout(Duration::from_millis(50), client.recv(&mut buf)).await;
    assert!(result.is_err(), "evicted flow should not forward a late reply");
}
