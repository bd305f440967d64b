//! Backend selection.

mod round_robin;

pub use round_robin::RoundRobin;

use crate::endpoint::Endpoint;

/// Given a frontend identity, yields the next backend to forward a flow to.
/// Implementations must be safe to call concurrently: both the TCP accept loop
/// and the UDP first-datagram path call `next_backend()` from independent tasks.
pub trait LoadBalancer: Send + Sync {
    fn frontend(&self) -> Endpoint;
    fn next_backend(&self) -> Endpoint;
    fn backends(&self) -> &[Endpoint];
}
