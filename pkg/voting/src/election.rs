//! Hirschberg–Sinclair leader election (spec §4.4, component C4).
//!
//! Pure step functions over `ElectionState` and a `Membership` snapshot,
//! returning the outbound messages each step produces — grounded in the
//! teacher's `consensus::Tick` pattern (`raft::consensus::ConsensusModule`
//! methods compute side effects as a returned value rather than doing
//! I/O directly). `server.rs` drives these from the unicast dispatch
//! loop and is responsible for actually sending the returned messages
//! and for the full-state replication that follows a new declaration.

use crate::membership::Membership;
use crate::protocol::Envelope;
use crate::types::{Direction, ElectionState, ServerId};

pub struct Outbound {
	pub to: ServerId,
	pub envelope: Envelope,
}

fn neighbor(membership: &Membership, direction: Direction) -> ServerId {
	match direction {
		Direction::Left => membership.left.clone(),
		Direction::Right => membership.right.clone(),
	}
}

fn probe(election: &mut ElectionState, membership: &Membership) -> Vec<Outbound> {
	let hop = 1u64 << election.phase;
	let mut out = Vec::with_capacity(2);
	for direction in [Direction::Left, Direction::Right] {
		out.push(Outbound {
			to: neighbor(membership, direction),
			envelope: Envelope::HS_ELECTION {
				id: membership.self_id.clone(),
				phase: election.phase,
				direction,
				hop,
			},
		});
	}
	out
}

/// Step 1: start an election, unless one is already in progress. A
/// single-node view declares immediately with no messages (spec §4.4,
/// "Edge cases").
pub fn hs_start(election: &mut ElectionState, membership: &Membership) -> Vec<Outbound> {
	if election.in_progress {
		return Vec::new();
	}

	if membership.len() == 1 {
		election.leader = Some(membership.self_id.clone());
		election.is_leader = true;
		election.in_progress = false;
		return Vec::new();
	}

	election.leader = None;
	election.is_leader = false;
	election.phase = 0;
	election.pending_replies = 2;
	election.in_progress = true;
	probe(election, membership)
}

/// Step 2: handle an incoming `HS_ELECTION` probe.
pub fn on_election(
	election: &mut ElectionState,
	membership: &Membership,
	cid: ServerId,
	phase: u32,
	direction: Direction,
	hop: u64,
) -> Vec<Outbound> {
	if cid < membership.self_id {
		// Swallowed: a lower-id candidate never wins. Start our own
		// election if we're not already running one (spec §4.4 point 2,
		// §7 ELECTION_STALE).
		if !election.in_progress {
			return hs_start(election, membership);
		}
		return Vec::new();
	}

	let next = neighbor(membership, direction);
	if hop > 1 {
		vec![Outbound {
			to: next,
			envelope: Envelope::HS_ELECTION { id: cid, phase, direction, hop: hop - 1 },
		}]
	} else {
		vec![Outbound { to: next, envelope: Envelope::HS_REPLY { id: cid, direction } }]
	}
}

/// Step 3: handle an incoming `HS_REPLY`. Returns the outbound messages
/// plus whether this call made us the newly declared leader (the caller
/// uses that to trigger a full `REPL_STATE` snapshot, spec §4.8).
pub fn on_reply(
	election: &mut ElectionState,
	membership: &Membership,
	cid: ServerId,
	direction: Direction,
) -> (Vec<Outbound>, bool) {
	if cid != membership.self_id {
		let next = neighbor(membership, direction);
		return (vec![Outbound { to: next, envelope: Envelope::HS_REPLY { id: cid, direction } }], false);
	}

	election.pending_replies = election.pending_replies.saturating_sub(1);
	if election.pending_replies != 0 {
		return (Vec::new(), false);
	}

	election.phase += 1;
	if (1u64 << election.phase) >= membership.len() as u64 {
		election.leader = Some(membership.self_id.clone());
		election.is_leader = true;
		election.in_progress = false;
		let out = vec![Outbound {
			to: membership.left.clone(),
			envelope: Envelope::HS_LEADER { id: membership.self_id.clone() },
		}];
		(out, true)
	} else {
		election.pending_replies = 2;
		(probe(election, membership), false)
	}
}

/// Step 5: handle an incoming `HS_LEADER` announcement, forwarding it
/// onward unless it has completed the ring.
pub fn on_leader(election: &mut ElectionState, membership: &Membership, cid: ServerId) -> Vec<Outbound> {
	election.leader = Some(cid.clone());
	election.is_leader = cid == membership.self_id;
	election.in_progress = false;

	if membership.left == cid {
		Vec::new()
	} else {
		vec![Outbound { to: membership.left.clone(), envelope: Envelope::HS_LEADER { id: cid } }]
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::View;

	fn membership_of(self_id: &str, ids: &[&str]) -> Membership {
		let mut m = Membership::new(self_id.to_string());
		for id in ids {
			m.insert(id);
		}
		m
	}

	#[test]
	fn single_node_declares_immediately() {
		let membership = Membership::new("a:1".to_string());
		let mut election = ElectionState::default();
		let out = hs_start(&mut election, &membership);
		assert!(out.is_empty());
		assert!(election.is_leader);
		assert_eq!(election.leader.as_deref(), Some("a:1"));
	}

	#[test]
	fn guarded_by_in_progress() {
		let membership = membership_of("a:1", &["b:2"]);
		let mut election = ElectionState::default();
		election.in_progress = true;
		let out = hs_start(&mut election, &membership);
		assert!(out.is_empty());
	}

	#[test]
	fn start_probes_both_neighbors_at_hop_one() {
		let membership = membership_of("b:2", &["a:1", "c:3"]);
		let mut election = ElectionState::default();
		let out = hs_start(&mut election, &membership);
		assert_eq!(out.len(), 2);
		assert_eq!(election.pending_replies, 2);
		assert_eq!(election.phase, 0);
		for o in &out {
			match &o.envelope {
				Envelope::HS_ELECTION { id, phase, hop, .. } => {
					assert_eq!(id, "b:2");
					assert_eq!(*phase, 0);
					assert_eq!(*hop, 1);
				}
				_ => panic!("expected HS_ELECTION"),
			}
		}
	}

	#[test]
	fn lower_id_probe_is_swallowed_and_starts_own_election() {
		let membership = membership_of("b:2", &["a:1", "c:3"]);
		let mut election = ElectionState::default();
		let out = on_election(&mut election, &membership, "a:1".to_string(), 0, Direction::Right, 1);
		// b:2 > a:1, so swallowed, and b starts its own election instead.
		assert_eq!(out.len(), 2);
		assert!(election.in_progress);
	}

	#[test]
	fn higher_id_probe_forwards_until_hop_exhausted_then_replies() {
		let membership = membership_of("a:1", &["b:2", "c:3", "d:4"]);
		let mut election = ElectionState::default();
		let out = on_election(&mut election, &membership, "z:9".to_string(), 0, Direction::Right, 2);
		assert_eq!(out.len(), 1);
		match &out[0].envelope {
			Envelope::HS_ELECTION { hop, .. } => assert_eq!(*hop, 1),
			_ => panic!("expected forwarded HS_ELECTION"),
		}

		let out2 = on_election(&mut election, &membership, "z:9".to_string(), 0, Direction::Right, 1);
		assert_eq!(out2.len(), 1);
		match &out2[0].envelope {
			Envelope::HS_REPLY { id, direction } => {
				assert_eq!(id, "z:9");
				assert_eq!(*direction, Direction::Right);
			}
			_ => panic!("expected HS_REPLY"),
		}
	}

	#[test]
	fn reply_forwards_until_it_reaches_the_originator() {
		let membership = membership_of("a:1", &["b:2"]);
		let mut election = ElectionState::default();
		let (out, became_leader) = on_reply(&mut election, &membership, "x:9".to_string(), Direction::Right);
		assert!(!became_leader);
		assert_eq!(out.len(), 1);
		match &out[0].envelope {
			Envelope::HS_REPLY { id, .. } => assert_eq!(id, "x:9"),
			_ => panic!("expected forwarded HS_REPLY"),
		}
	}

	#[test]
	fn three_node_election_converges_on_the_max_id() {
		// a:1, b:2, c:3 ring. c starts; both probes return after one hop
		// (hop=1 means the immediate neighbor turns it into a reply),
		// and since n=3, 2^1=2 < 3, so c must run a second phase before
		// declaring.
		let ids = ["a:1", "b:2", "c:3"];
		let view: View = ids.iter().map(|s| s.to_string()).collect();
		let _ = view;

		let membership_c = membership_of("c:3", &["a:1", "b:2"]);
		let mut election_c = ElectionState::default();
		let phase0 = hs_start(&mut election_c, &membership_c);
		assert_eq!(phase0.len(), 2);

		// Both neighbors (a and b) immediately see hop==1 and reply.
		let (r1, leader1) = on_reply(&mut election_c, &membership_c, "c:3".to_string(), Direction::Left);
		assert!(!leader1);
		assert!(r1.is_empty());
		let (r2, leader2) = on_reply(&mut election_c, &membership_c, "c:3".to_string(), Direction::Right);
		// phase now 1; 2^1=2 < 3 so it must probe again, not yet leader.
		assert!(!leader2);
		assert_eq!(r2.len(), 2);
		assert_eq!(election_c.phase, 1);

		let (r3, leader3) = on_reply(&mut election_c, &membership_c, "c:3".to_string(), Direction::Left);
		assert!(!leader3);
		assert!(r3.is_empty());
		let (_r4, leader4) = on_reply(&mut election_c, &membership_c, "c:3".to_string(), Direction::Right);
		// phase now 2; 2^2=4 >= 3, c declares itself leader.
		assert!(leader4);
		assert!(election_c.is_leader);
	}

	#[test]
	fn leader_announcement_forwards_then_stops_at_closure() {
		let membership = membership_of("b:2", &["a:1", "c:3"]);
		let mut election = ElectionState::default();
		let out = on_leader(&mut election, &membership, "c:3".to_string());
		assert_eq!(election.leader.as_deref(), Some("c:3"));
		assert!(!election.is_leader);
		assert_eq!(out.len(), 1);

		// When left IS the originator, the ring has closed and we stop.
		let membership2 = membership_of("a:1", &["c:3"]);
		let mut election2 = ElectionState::default();
		let out2 = on_leader(&mut election2, &membership2, "c:3".to_string());
		assert!(out2.is_empty());
	}
}
