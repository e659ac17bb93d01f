//! Core data model (spec §3). Plain structs; no I/O lives here.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// `"host:port"`, totally ordered lexicographically. Never canonicalize
/// IPs when comparing two of these — identity is the literal string a
/// server advertised (spec §9, "Addressing").
pub type ServerId = String;

pub type ClientId = String;

/// The set of peer servers this node currently believes are alive,
/// including itself. Sorted by construction, which is exactly the order
/// the ring is built from.
pub type View = BTreeSet<ServerId>;

/// Computes this node's ring neighbors from a view that is guaranteed to
/// contain `self_id`. If `view` has one element, `left == right ==
/// self_id` and the failure detector should treat that as inert.
pub fn ring_neighbors(view: &View, self_id: &str) -> (ServerId, ServerId) {
	let sorted: Vec<&ServerId> = view.iter().collect();
	let n = sorted.len();
	let i = sorted
		.iter()
		.position(|id| id.as_str() == self_id)
		.expect("self must always be a member of its own view");

	if n == 1 {
		return (self_id.to_string(), self_id.to_string());
	}

	let left = sorted[(i + n - 1) % n].clone();
	let right = sorted[(i + 1) % n].clone();
	(left, right)
}

#[derive(Debug, Clone)]
pub struct Session {
	pub token: String,
	pub addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
	pub name: String,
	pub owner: ClientId,
	pub members: BTreeSet<ClientId>,
}

impl Group {
	pub fn new(name: String, owner: ClientId) -> Self {
		let mut members = BTreeSet::new();
		members.insert(owner.clone());
		Group { name, owner, members }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
	pub voter: ClientId,
	pub choice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
	pub vote_id: String,
	pub group: String,
	pub topic: String,
	pub options: Vec<String>,
	pub tallies: Vec<Ballot>,
	/// Set once `finalize` has run for this vote, so a late retransmit of
	/// the retransmit loop never finalizes it twice.
	#[serde(default)]
	pub finalized: bool,
}

impl Vote {
	/// Records a ballot, deduplicating by `(vote_id, voter)` so a
	/// duplicate `VOTE_ACK` from the same client is harmless (spec §4.7).
	pub fn record_ballot(&mut self, voter: ClientId, choice: String) {
		if self.tallies.iter().any(|b| b.voter == voter) {
			return;
		}
		self.tallies.push(Ballot { voter, choice });
	}

	/// Special marker winner when zero ballots were cast.
	pub const NO_WINNER: &'static str = "NO_WINNER";

	/// Tallies the vote: highest count wins, ties broken by first
	/// appearance in `options`, `NO_WINNER` if no ballots were cast.
	pub fn winner(&self) -> String {
		if self.tallies.is_empty() {
			return Self::NO_WINNER.to_string();
		}

		let mut best: Option<(&str, usize)> = None;
		for option in &self.options {
			let count = self.tallies.iter().filter(|b| &b.choice == option).count();
			if count == 0 {
				continue;
			}
			match best {
				Some((_, best_count)) if best_count >= count => {}
				_ => best = Some((option.as_str(), count)),
			}
		}

		match best {
			Some((option, _)) => option.to_string(),
			None => Self::NO_WINNER.to_string(),
		}
	}
}

/// Leader-side bookkeeping for one in-flight FIFO multicast message
/// (spec §3, "Pending entry").
pub struct PendingEntry {
	pub pending: BTreeSet<ClientId>,
	pub deadline: Instant,
	pub envelope: crate::protocol::Envelope,
	pub vote_id: Option<String>,
}

/// HS election bookkeeping (spec §3, "Election state").
#[derive(Debug, Clone)]
pub struct ElectionState {
	pub phase: u32,
	pub pending_replies: u8,
	pub in_progress: bool,
	pub leader: Option<ServerId>,
	pub is_leader: bool,
}

impl Default for ElectionState {
	fn default() -> Self {
		ElectionState {
			phase: 0,
			pending_replies: 0,
			in_progress: false,
			leader: None,
			is_leader: false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
	Left,
	Right,
}

impl Direction {
	pub fn opposite(self) -> Direction {
		match self {
			Direction::Left => Direction::Right,
			Direction::Right => Direction::Left,
		}
	}
}
