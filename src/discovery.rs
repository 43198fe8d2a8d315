//! Leader discovery.
//!
//! A participant looking for the leader sends a `100` datagram to the discovery port and waits for a
//! `200` reply. The leader address is the address the reply came from.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use crate::config::{NetworkConfig, COORDINATOR_DISCOVERY_ATTEMPTS, WORKER_DISCOVERY_ATTEMPTS};
use crate::protocol::{Message, MIN_RECEIVE_BUFFER};

/// Leader discovery client.
#[derive(Clone, Debug)]
pub struct Discovery {
    target: SocketAddr,
    attempts: usize,
    timeout: Duration,
}

impl Discovery {
    /// Creates a discovery client.
    ///
    /// # Arguments
    /// * `target` - Address requests are sent to, usually a broadcast address
    /// * `attempts` - Number of requests sent before giving up
    /// * `timeout` - Time to wait for a reply to each request
    pub fn new(target: SocketAddr, attempts: usize, timeout: Duration) -> Self {
        Discovery {
            target,
            attempts,
            timeout,
        }
    }

    /// Discovery client used by a coordinator.
    pub fn for_coordinator(config: &NetworkConfig) -> Self {
        Discovery::new(
            config.discovery_target(),
            COORDINATOR_DISCOVERY_ATTEMPTS,
            config.discovery_timeout(),
        )
    }

    /// Discovery client used by a worker.
    pub fn for_worker(config: &NetworkConfig) -> Self {
        Discovery::new(
            config.discovery_target(),
            WORKER_DISCOVERY_ATTEMPTS,
            config.discovery_timeout(),
        )
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Looks for a leader. Returns [`None`] if no leader replied within the configured attempts.
    /// Only a failure to open the discovery socket is reported as an error.
    pub fn find_leader(&self) -> io::Result<Option<IpAddr>> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(self.timeout))?;

        let request = Message::Discover.encode();
        let mut buf = [0; MIN_RECEIVE_BUFFER];

        for attempt in 1..=self.attempts {
            log::debug!("contacting leader at {} (attempt {}/{})", self.target, attempt, self.attempts);

            if let Err(err) = socket.send_to(request.as_bytes(), self.target) {
                log::debug!("discovery request failed: {}", err);
                thread::sleep(self.timeout);
                continue;
            }

            match socket.recv_from(&mut buf) {
                Ok((len, addr)) => match Message::decode_bytes(&buf[..len]) {
                    Ok(Message::Acknowledged) => {
                        log::info!("leader found at {}", addr.ip());
                        return Ok(Some(addr.ip()));
                    }
                    Ok(message) => log::debug!("unexpected discovery reply from {}: {}", addr, message),
                    Err(err) => log::debug!("invalid discovery reply from {}: {}", addr, err),
                },
                Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    log::debug!("no response from leader, trying again");
                }
                Err(err) => {
                    log::debug!("discovery reply not received: {}", err);
                    thread::sleep(self.timeout);
                }
            }
        }

        log::info!("no leader found after {} attempts", self.attempts);

        return Ok(None);
    }
}
