//! Wires a loaded configuration into running proxies: builds the evaluator,
//! the load balancer and proxy for each endpoint, and (optionally) the metrics
//! server, then drives all of them concurrently until one fails or `close()`
//! is called.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::info;

use crate::config::{AppConfig, ConfigError};
use crate::endpoint::{Dsn, Protocol};
use crate::evaluator::Evaluator;
use crate::lb::{LoadBalancer, RoundRobin};
use crate::metrics::Metrics;
use crate::proxy::{AdmitFn, Proxy};

/// Everything needed to run the proxy fleet described by one configuration
/// file: the bound proxies, the shared evaluator driving admission, the
/// metrics registry, and the metrics HTTP address if one was configured.
pub struct Controller {
    proxies: Vec<Proxy>,
    metrics: Arc<Metrics>,
    metrics_addr: Option<SocketAddr>,
}

impl Controller {
    /// Validates and loads `config`, opens every database it names, binds every
    /// listener it describes, and returns a `Controller` ready to `run()`.
    /// Nothing here keeps the process alive on its own: binding failures (a
    /// port already in use, for instance) are returned as `io::Error` so the
    /// caller can report them the same way it reports configuration errors.
    pub async fn build(config: &AppConfig) -> Result<Controller, ControllerError> {
        let dsns = config.dsns()?;
        let evaluator = Arc::new(config.build_evaluator()?);
        let metrics = Arc::new(Metrics::new());
        let metrics_addr = config.metrics_addr()?;

        let mut proxies = Vec::with_capacity(dsns.len());
        for dsn in &dsns {
            proxies.push(bind_proxy(dsn, evaluator.clone(), metrics.clone()).await?);
        }

        Ok(Controller { proxies, metrics, metrics_addr })
    }

    /// Runs every bound proxy (and, if configured, the metrics server)
    /// concurrently. Returns as soon as any one of them exits, whether from
    /// `close()` being called or a listener failing unexpectedly; the rest are
    /// dropped in place, which cancels them.
    pub async fn run(&self) -> io::Result<()> {
        let proxies_fut = futures::future::try_join_all(self.proxies.iter().map(Proxy::run));

        match self.metrics_addr {
            Some(addr) => {
                tokio::select! {
                    r = proxies_fut => r.map(|_| ()),
                    r = crate::metrics::serve(addr, self.metrics.clone()) => r,
                }
            }
            None => proxies_fut.await.map(|_| ()),
        }
    }

    /// Signals every proxy to stop accepting and tear down its active work.
    /// Does not wait for in-flight relays to finish; `run()` returning is the
    /// signal that shutdown is complete.
    pub fn close(&self) {
        for proxy in &self.proxies {
            proxy.close();
        }
    }
}

async fn bind_proxy(
    dsn: &Dsn,
    evaluator: Arc<Evaluator>,
    metrics: Arc<Metrics>,
) -> io::Result<Proxy> {
    let lb: Arc<dyn LoadBalancer> =
        Arc::new(RoundRobin::new(dsn.frontend_endpoint(), dsn.backend_endpoints()));
    let admit = admit_fn(evaluator, metrics, dsn.frontend_endpoint().addr);

    match dsn.protocol {
        Protocol::Tcp => {
            let proxy = crate::proxy::tcp::TcpProxy::bind(lb, admit).await?;
            info!("bound tcp proxy on {}", proxy.frontend());
            Ok(Proxy::Tcp(proxy))
        }
        Protocol::Udp => {
            let proxy = crate::proxy::udp::UdpProxy::bind(lb, admit).await?;
            info!("bound udp proxy on {}", proxy.frontend());
            Ok(Proxy::Udp(proxy))
        }
    }
}

/// Builds the per-proxy admission closure: evaluates the source IP, records
/// the outcome to metrics, and logs a rejection at debug level (an allowed
/// flow is the expected case and isn't logged per-flow to avoid flooding).
fn admit_fn(evaluator: Arc<Evaluator>, metrics: Arc<Metrics>, frontend: SocketAddr) -> AdmitFn {
    Arc::new(move |ip: IpAddr| match evaluator.evaluate_ip(ip) {
        Ok(verdict) => {
            if verdict.allowed {
                metrics.record_allowed(&verdict.country);
            } else {
                metrics.record_rejected(&verdict.country);
                log::debug!("{frontend}: rejected {ip} ({})", display_country(&verdict.country));
            }
            verdict.allowed
        }
        Err(e) => {
            info!("{frontend}: admission check failed for {ip}: {e}");
            metrics.record_rejected("");
            false
        }
    })
}

fn display_country(country: &str) -> &str {
    if country.is_empty() {
        "unknown"
    } else {
        country
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not bind proxy: {0}")]
    Bind(#[from] io::Error),
}
