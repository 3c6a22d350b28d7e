//! Host network driver
//!
//! On a Linux gateway the operating system owns WiFi association, so the
//! driver only checks that the host has a usable non-loopback route over
//! IPv4 or IPv6 and reports association accordingly. The route check runs
//! at most once per [`ROUTE_RECHECK_INTERVAL`]; the supervisor asks every
//! poll step.

use super::NetworkDriver;
use crate::error::{AgentError, AgentResult};
use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Documentation-range targets used for route discovery; no packet is sent
const ROUTE_TARGETS: [SocketAddr; 2] = [
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 8883),
    SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 8883),
];

/// Minimum spacing between route checks from `is_associated`
pub const ROUTE_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

type RouteLookup = fn() -> Option<SocketAddr>;

/// Network driver backed by the host network stack
#[derive(Debug)]
pub struct HostNetwork {
    associated: bool,
    /// Last route check and its outcome
    last_check: Cell<Option<(Instant, bool)>>,
    route: RouteLookup,
}

impl Default for HostNetwork {
    fn default() -> Self {
        Self::with_route(routable_address)
    }
}

impl HostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_route(route: RouteLookup) -> Self {
        Self {
            associated: false,
            last_check: Cell::new(None),
            route,
        }
    }

    fn check_route(&self, now: Instant) -> Option<SocketAddr> {
        let local = (self.route)();
        self.last_check.set(Some((now, local.is_some())));
        local
    }
}

/// Whether a cached route check is stale at `now`
pub fn recheck_due(last_check: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last_check {
        Some(at) => now.saturating_duration_since(at) >= interval,
        None => true,
    }
}

/// Local address the host would use to reach the outside world, trying
/// IPv4 first and then IPv6
fn routable_address() -> Option<SocketAddr> {
    ROUTE_TARGETS.iter().find_map(|target| local_route_to(*target))
}

fn local_route_to(target: SocketAddr) -> Option<SocketAddr> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let local = socket.local_addr().ok()?;
    usable(local.ip()).then_some(local)
}

fn usable(ip: IpAddr) -> bool {
    !ip.is_unspecified() && !ip.is_loopback()
}

#[async_trait::async_trait]
impl NetworkDriver for HostNetwork {
    async fn associate(&mut self, ssid: &str, _secret: &str) -> AgentResult<()> {
        match self.check_route(Instant::now()) {
            Some(local) => {
                info!(ssid = %ssid, local_addr = %local, "Host network is up");
                self.associated = true;
                Ok(())
            }
            None => {
                self.associated = false;
                Err(AgentError::network(format!(
                    "no route to the outside network (ssid {ssid})"
                )))
            }
        }
    }

    fn is_associated(&self) -> bool {
        if !self.associated {
            return false;
        }
        let now = Instant::now();
        if let Some((at, up)) = self.last_check.get() {
            if !recheck_due(Some(at), now, ROUTE_RECHECK_INTERVAL) {
                return up;
            }
        }

        let up = self.check_route(now).is_some();
        if !up {
            debug!("Host network route disappeared");
        }
        up
    }
}
