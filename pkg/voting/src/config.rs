//! Tunable constants and the `Config` assembled from CLI arguments
//! (spec §6, "Process surface"; ambient CLI layer per SPEC_FULL.md §2).

use std::time::Duration;

pub const MCAST_GRP: &str = "224.1.1.1";
pub const MCAST_PORT: u16 = 5007;
/// Maximum UDP payload the transport will read or write (spec §4.1).
pub const BUF: usize = 4096;

#[derive(Debug, Clone)]
pub struct Config {
	pub bind_ip: String,
	pub port: u16,
	pub mcast_group: String,
	pub mcast_port: u16,
	/// Cadence for T2 (announce + heartbeat), spec §4.2/§4.3: 1s.
	pub tick: Duration,
	/// Heartbeat ack deadline before declaring the predecessor crashed,
	/// spec §4.3: 5s.
	pub hb_timeout: Duration,
	/// Settling delay before an election starts after a join/crash,
	/// spec §4.2/§4.3: ~2s.
	pub settle_delay: Duration,
	/// Cadence for T4, the FIFO retransmit loop, spec §4.7: 500ms.
	pub retransmit_tick: Duration,
	/// recv timeout on both sockets so worker loops can poll the
	/// shutdown flag, spec §5: 1s.
	pub recv_timeout: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			bind_ip: "127.0.0.1".to_string(),
			port: 0,
			mcast_group: MCAST_GRP.to_string(),
			mcast_port: MCAST_PORT,
			tick: Duration::from_secs(1),
			hb_timeout: Duration::from_secs(5),
			settle_delay: Duration::from_secs(2),
			retransmit_tick: Duration::from_millis(500),
			recv_timeout: Duration::from_secs(1),
		}
	}
}

impl Config {
	pub fn self_id(&self) -> String {
		format!("{}:{}", self.bind_ip, self.port)
	}
}
