//! Network configuration shared by all roles.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Discovery attempts made by a coordinator before it creates a leader itself.
pub const COORDINATOR_DISCOVERY_ATTEMPTS: usize = 5;
/// Discovery attempts made by a worker before it gives up.
pub const WORKER_DISCOVERY_ATTEMPTS: usize = 10;

/// Well-known ports of a cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ports {
    /// Leader discovery datagrams.
    pub discovery: u16,
    /// Leader-to-worker data connections.
    pub worker: u16,
    /// Coordinator-to-leader data connection.
    pub coordinator: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Ports {
            discovery: 30000,
            worker: 40000,
            coordinator: 50000,
        }
    }
}

/// Network configuration. Provides methods for tuning discovery and leader hand-off.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Cluster ports.
    ports: Ports,
    /// Address discovery requests are sent to.
    broadcast_addr: IpAddr,
    /// Time to wait for a discovery reply before the next attempt.
    discovery_timeout: Duration,
    /// Time a promoted worker waits before starting a leader.
    settle_delay: Duration,
    /// Time a finishing leader waits after notifying workers before closing connections.
    linger: Duration,
}

impl NetworkConfig {
    /// Creates a configuration with default parameters.
    pub fn new() -> Self {
        NetworkConfig::default()
    }

    /// Sets cluster ports.
    pub fn with_ports(mut self, ports: Ports) -> NetworkConfig {
        self.ports = ports;
        return self;
    }

    /// Sets the address discovery requests are sent to.
    pub fn with_broadcast_addr(mut self, addr: IpAddr) -> NetworkConfig {
        self.broadcast_addr = addr;
        return self;
    }

    /// Sets discovery reply timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> NetworkConfig {
        self.discovery_timeout = timeout;
        return self;
    }

    /// Sets the delay a promoted worker waits before starting a leader.
    pub fn with_settle_delay(mut self, delay: Duration) -> NetworkConfig {
        self.settle_delay = delay;
        return self;
    }

    /// Sets the delay a finishing leader waits before closing worker connections.
    pub fn with_linger(mut self, linger: Duration) -> NetworkConfig {
        self.linger = linger;
        return self;
    }

    pub fn ports(&self) -> Ports {
        self.ports
    }

    pub fn discovery_timeout(&self) -> Duration {
        self.discovery_timeout
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn linger(&self) -> Duration {
        self.linger
    }

    /// Returns the address discovery requests are sent to.
    pub fn discovery_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.ports.discovery)
    }

    /// Configuration of a cluster running on the loopback interface with short timeouts.
    /// Ports are allocated starting from `base`.
    #[cfg(test)]
    pub(crate) fn loopback(base: u16) -> NetworkConfig {
        NetworkConfig::new()
            .with_ports(Ports {
                discovery: base,
                worker: base + 1,
                coordinator: base + 2,
            })
            .with_broadcast_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_discovery_timeout(Duration::from_millis(100))
            .with_settle_delay(Duration::from_millis(50))
            .with_linger(Duration::from_millis(50))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ports: Ports::default(),
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_secs(3),
            linger: Duration::from_secs(3),
        }
    }
}
