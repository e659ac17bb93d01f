//! Heartbeat-based failure detection of the ring predecessor (spec §4.3,
//! component C3). A pure tracker of "have we heard from `left` lately";
//! `server.rs`'s T2 tick drives it and decides what to do with a
//! detected crash (multicast `CRASH:`, settle, start HS).

use std::time::{Duration, Instant};

pub struct FailureDetector {
	last_ack: Instant,
	/// Whether the probe sent on the previous tick is still unacked.
	/// A crash is only declared once a tick finds the *previous* probe
	/// already outstanding past the timeout (spec §4.3).
	probe_outstanding: bool,
	hb_timeout: Duration,
}

impl FailureDetector {
	pub fn new(hb_timeout: Duration) -> FailureDetector {
		FailureDetector { last_ack: Instant::now(), probe_outstanding: false, hb_timeout }
	}

	/// Call once per tick, before sending the next heartbeat. Returns
	/// `true` if the predecessor should be declared crashed.
	pub fn tick(&mut self, now: Instant) -> bool {
		let overdue = now.duration_since(self.last_ack) > self.hb_timeout;
		let crashed = overdue && self.probe_outstanding;
		self.probe_outstanding = true;
		crashed
	}

	/// Call whenever a `HEARTBEAT_ACK` arrives from the current `left`.
	pub fn on_ack(&mut self, now: Instant) {
		self.last_ack = now;
		self.probe_outstanding = false;
	}

	/// Call whenever the view changes (new `left`), so a stale timer
	/// doesn't immediately declare the new predecessor crashed.
	pub fn reset(&mut self, now: Instant) {
		self.last_ack = now;
		self.probe_outstanding = false;
	}
}
