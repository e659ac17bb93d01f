//! Leader-driven state replication (spec §4.8, component C8).
//!
//! Builds the `REPL_*` envelopes the leader mirrors to followers after
//! every successfully processed mutation, and the full `REPL_STATE`
//! snapshot a freshly elected leader ships on declaration. Applying a
//! `REPL_*` envelope on a follower is plain registry/session-store
//! mutation and is done inline in `server.rs`'s dispatch, next to where
//! the analogous client-facing mutation is applied.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use log::warn;

use crate::membership::Membership;
use crate::protocol::{Envelope, SessionSnapshot};
use crate::transport::Transport;
use crate::types::{Ballot, Group, Vote};

/// Unicasts `envelope` to every peer in `membership.view` other than
/// self. Best-effort: a peer whose id doesn't parse as `host:port` or
/// whose send fails is logged and skipped (spec §4.8: "replication is
/// best-effort").
pub fn broadcast_to_followers(transport: &Transport, membership: &Membership, envelope: &Envelope) {
	for peer in &membership.view {
		if peer == &membership.self_id {
			continue;
		}
		match peer.parse::<SocketAddr>() {
			Ok(addr) => transport.send_json(addr, envelope),
			Err(e) => warn!("cannot parse peer id {} as an address: {}", peer, e),
		}
	}
}

pub fn repl_register(id: String, token: String, addr: SocketAddr) -> Envelope {
	Envelope::REPL_REGISTER { id, token, addr }
}

pub fn repl_create_group(group: Group) -> Envelope {
	Envelope::REPL_CREATE_GROUP { group }
}

pub fn repl_join_group(id: String, group: String) -> Envelope {
	Envelope::REPL_JOIN_GROUP { id, group }
}

pub fn repl_leave_group(id: String, group: String) -> Envelope {
	Envelope::REPL_LEAVE_GROUP { id, group }
}

pub fn repl_vote(vote: &Vote, timeout: f64) -> Envelope {
	Envelope::REPL_VOTE {
		vote_id: vote.vote_id.clone(),
		group: vote.group.clone(),
		topic: vote.topic.clone(),
		options: vote.options.clone(),
		timeout,
		votes: vote.tallies.clone(),
	}
}

pub struct SnapshotInput {
	pub sessions: BTreeMap<String, SessionSnapshot>,
	pub groups: BTreeMap<String, Group>,
	pub votes: BTreeMap<String, Vote>,
	pub seqs: BTreeMap<String, u64>,
}

pub fn repl_state(input: SnapshotInput) -> Envelope {
	Envelope::REPL_STATE {
		sessions: input.sessions,
		groups: input.groups,
		votes: input.votes,
		seqs: input.seqs,
	}
}

/// Applies a `REPL_VOTE` snapshot to a follower's copy of a vote:
/// inserts if unknown, otherwise merges in any ballots the leader has
/// already collected (followers never run the FIFO engine themselves,
/// so this is the only way they learn about an in-flight vote's
/// tallies).
pub fn merged_vote(existing: Option<&Vote>, vote_id: String, group: String, topic: String, options: Vec<String>, votes: Vec<Ballot>) -> Vote {
	let mut v = existing.cloned().unwrap_or_else(|| Vote {
		vote_id,
		group,
		topic,
		options,
		tallies: Vec::new(),
		finalized: false,
	});
	for ballot in votes {
		v.record_ballot(ballot.voter, ballot.choice);
	}
	v
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merged_vote_creates_when_absent() {
		let v = merged_vote(
			None,
			"v1".into(),
			"g".into(),
			"t".into(),
			vec!["a".into()],
			vec![Ballot { voter: "x".into(), choice: "a".into() }],
		);
		assert_eq!(v.tallies.len(), 1);
	}

	#[test]
	fn merged_vote_dedups_against_existing() {
		let existing = Vote {
			vote_id: "v1".into(),
			group: "g".into(),
			topic: "t".into(),
			options: vec!["a".into()],
			tallies: vec![Ballot { voter: "x".into(), choice: "a".into() }],
			finalized: false,
		};
		let merged = merged_vote(
			Some(&existing),
			"v1".into(),
			"g".into(),
			"t".into(),
			vec!["a".into()],
			vec![Ballot { voter: "x".into(), choice: "a".into() }],
		);
		assert_eq!(merged.tallies.len(), 1);
	}
}
