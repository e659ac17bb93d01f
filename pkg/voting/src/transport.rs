//! Two UDP endpoints per server (spec §4.1, component C1).
//!
//! The multicast endpoint carries only ASCII gossip lines
//! (`ANNOUNCE:<id>`, `CRASH:<id>`, `WHO_IS_LEADER`, `LEADER:<id>`); the
//! unicast endpoint carries everything else as UTF-8 JSON. Both read
//! with a 1s timeout so callers poll a shutdown flag instead of blocking
//! forever (spec §5).

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use log::{debug, warn};

use crate::config::{Config, BUF};
use crate::errors::*;
use crate::protocol::Envelope;

pub struct Transport {
	pub unicast: UdpSocket,
	pub multicast: UdpSocket,
	pub mcast_addr: SocketAddr,
}

impl Transport {
	pub fn bind(config: &Config) -> Result<Transport> {
		let unicast = UdpSocket::bind((config.bind_ip.as_str(), config.port))?;
		unicast.set_read_timeout(Some(config.recv_timeout))?;

		let multicast = UdpSocket::bind(("0.0.0.0", config.mcast_port))?;
		let group: Ipv4Addr = config
			.mcast_group
			.parse()
			.chain_err(|| format!("invalid multicast group {}", config.mcast_group))?;
		multicast.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
		multicast.set_multicast_loop_v4(true)?;
		multicast.set_multicast_ttl_v4(2)?;
		multicast.set_read_timeout(Some(config.recv_timeout))?;

		let mcast_addr = SocketAddr::new(IpAddr::V4(group), config.mcast_port);

		Ok(Transport { unicast, multicast, mcast_addr })
	}

	/// Sends a JSON envelope to a single peer or client. Failures are
	/// logged and swallowed (`TRANSIENT_IO`, spec §7) — the FIFO
	/// retransmit loop is what recovers lost vote traffic; every other
	/// caller simply accepts best-effort delivery.
	pub fn send_json(&self, addr: SocketAddr, envelope: &Envelope) {
		match envelope.to_json() {
			Ok(bytes) => {
				if let Err(e) = self.unicast.send_to(&bytes, addr) {
					warn!("send to {} failed: {}", addr, e);
				}
			}
			Err(e) => warn!("failed to encode {:?}: {}", envelope, e),
		}
	}

	/// Sends an ASCII gossip line on the multicast group.
	pub fn send_gossip(&self, line: &str) {
		if let Err(e) = self.multicast.send_to(line.as_bytes(), self.mcast_addr) {
			warn!("multicast send failed: {}", e);
		}
	}

	/// Replies to a client-facing discovery query (`WHO_IS_LEADER`) on
	/// the unicast socket, unicast back to the sender.
	pub fn reply_gossip(&self, line: &str, to: SocketAddr) {
		if let Err(e) = self.unicast.send_to(line.as_bytes(), to) {
			warn!("gossip reply to {} failed: {}", to, e);
		}
	}

	/// Blocking receive on the unicast socket with the configured
	/// timeout. Returns `Ok(None)` on timeout, `Ok(Some(..))` on a
	/// successfully parsed envelope. A malformed datagram is logged and
	/// dropped rather than propagated (spec §4.1: "never crashes").
	pub fn recv_json(&self) -> Result<Option<(Envelope, SocketAddr)>> {
		let mut buf = [0u8; BUF];
		match self.unicast.recv_from(&mut buf) {
			Ok((n, addr)) => match Envelope::from_json(&buf[..n]) {
				Ok(env) => Ok(Some((env, addr))),
				Err(e) => {
					debug!("dropping malformed datagram from {}: {}", addr, e);
					Ok(None)
				}
			},
			Err(e) if is_timeout(&e) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// Blocking receive on the multicast socket with the configured
	/// timeout. Returns the raw ASCII line.
	pub fn recv_gossip(&self) -> Result<Option<(String, SocketAddr)>> {
		let mut buf = [0u8; BUF];
		match self.multicast.recv_from(&mut buf) {
			Ok((n, addr)) => match std::str::from_utf8(&buf[..n]) {
				Ok(line) => Ok(Some((line.to_string(), addr))),
				Err(e) => {
					debug!("dropping non-utf8 gossip datagram from {}: {}", addr, e);
					Ok(None)
				}
			},
			Err(e) if is_timeout(&e) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}
}

fn is_timeout(e: &std::io::Error) -> bool {
	matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

/// Sleeps used by the periodic tasks. Split out so tests can use a
/// shorter cadence without touching the production constants.
pub fn sleep(d: Duration) {
	std::thread::sleep(d);
}
