//! `geoblock-proxy` is a layer-4 reverse proxy that admits TCP connections and UDP
//! flows according to a per-source-IP country/CIDR policy, then forwards the
//! traffic to a load-balanced set of backends.
//!
//! The crate is organized around the traffic plane (`proxy`, `lb`), the admission
//! policy (`evaluator`, `geo`), and the wiring that ties them to configuration and
//! observability (`config`, `controller`, `metrics`).

pub mod config;
pub mod controller;
pub mod endpoint;
pub mod evaluator;
pub mod geo;
pub mod lb;
pub mod metrics;
pub mod proxy;
