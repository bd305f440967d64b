use std::sync::atomic::{AtomicUsize, Ordering};

use crate::endpoint::Endpoint;

use super::LoadBalancer;

/// Walks through the configured backends one at a time, wrapping back to the
/// first once the last is reached. The cursor starts such that the very first
/// call to `next_backend` returns `backends[0]`.
pub struct RoundRobin {
    frontend: Endpoint,
    backends: Vec<Endpoint>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// `backends` must be non-empty; callers (the DSN parser) guarantee this.
    pub fn new(frontend: Endpoint, backends: Vec<Endpoint>) -> RoundRobin {
        assert!(!backends.is_empty(), "round-robin requires at least one backend");
        RoundRobin { frontend, backends, cursor: AtomicUsize::new(0) }
    }
}

impl LoadBalancer for RoundRobin {
    fn frontend(&self) -> Endpoint {
        self.frontend
    }

    fn next_backend(&self) -> Endpoint {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.backends[index % self.backends.len()]
    }

    fn backends(&self) -> &[Endpoint] {
        &self.backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Protocol;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint { protocol: Protocol::Tcp, addr: ([127, 0, 0, 1], port).into() }
    }

    #[test]
    fn first_call_returns_the_first_backend() {
        let lb = RoundRobin::new(endpoint(9000), vec![endpoint(9001), endpoint(9002)]);
        assert_eq!(lb.next_backend(), endpoint(9001));
    }

    #[test]
    fn cycles_through_every_backend_exactly_once_per_round() {
        let lb = RoundRobin::new(
            endpoint(9000),
            vec![endpoint(9001), endpoint(9002), endpoint(9003)],
        );
        let first_round: Vec<_> = (0..3).map(|_| lb.next_backend()).collect();
        assert_eq!(first_round, vec![endpoint(9001), endpoint(9002), endpoint(9003)]);

        let second_round: Vec<_> = (0..3).map(|_| lb.next_backend()).collect();
        assert_eq!(second_round, first_round);
    }

    #[test]
    fn concurrent_callers_each_get_a_distinct_slot_per_round() {
        let lb = Arc::new(RoundRobin::new(
            endpoint(9000),
            vec![endpoint(9001), endpoint(9002), endpoint(9003), endpoint(9004)],
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = lb.clone();
                thread::spawn(move || lb.next_backend())
            })
            .collect();

        let seen: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(seen.len(), 4);
    }
}
