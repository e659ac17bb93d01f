//! Group registry and vote records (spec §4.6, component C6).
//!
//! The FIFO multicast mechanics (sequencing, retransmission, hold-back,
//! finalization) live in `multicast.rs`; this module only owns the
//! group membership table and the vote records their tallies land in.

use std::collections::BTreeMap;

use crate::errors::*;
use crate::types::{ClientId, Group, Vote};

pub struct GroupRegistry {
	groups: BTreeMap<String, Group>,
	votes: BTreeMap<String, Vote>,
	/// Leader-only: next sequence number to assign per group (spec §3's
	/// `S[sender][group]`, collapsed to `S[group]` because the leader is
	/// always the sole sender of FIFO multicasts in this protocol).
	seqs: BTreeMap<String, u64>,
}

impl GroupRegistry {
	pub fn new() -> GroupRegistry {
		GroupRegistry { groups: BTreeMap::new(), votes: BTreeMap::new(), seqs: BTreeMap::new() }
	}

	pub fn create_group(&mut self, owner: ClientId, name: String) -> Result<()> {
		if self.groups.contains_key(&name) {
			return Err(ErrorKind::GroupExists(name).into());
		}
		self.groups.insert(name.clone(), Group::new(name.clone(), owner));
		self.seqs.insert(name, 0);
		Ok(())
	}

	/// Installs a group verbatim (used by `REPL_CREATE_GROUP` and
	/// `REPL_STATE` restore), seeding its sequencer at 0 if new.
	pub fn install_group(&mut self, group: Group) {
		self.seqs.entry(group.name.clone()).or_insert(0);
		self.groups.insert(group.name.clone(), group);
	}

	pub fn join_group(&mut self, id: ClientId, name: &str) -> Result<()> {
		match self.groups.get_mut(name) {
			Some(group) => {
				group.members.insert(id);
				Ok(())
			}
			None => Err(ErrorKind::NoSuchGroup(name.to_string()).into()),
		}
	}

	pub fn leave_group(&mut self, id: &str, name: &str) -> Result<()> {
		match self.groups.get_mut(name) {
			Some(group) => {
				if !group.members.remove(id) {
					return Err(ErrorKind::NotAMember(name.to_string()).into());
				}
				Ok(())
			}
			None => Err(ErrorKind::NoSuchGroup(name.to_string()).into()),
		}
	}

	pub fn group_names(&self) -> Vec<String> {
		self.groups.keys().cloned().collect()
	}

	pub fn joined_groups(&self, id: &str) -> Vec<String> {
		self.groups
			.values()
			.filter(|g| g.members.contains(id))
			.map(|g| g.name.clone())
			.collect()
	}

	pub fn get(&self, name: &str) -> Option<&Group> {
		self.groups.get(name)
	}

	pub fn all(&self) -> &BTreeMap<String, Group> {
		&self.groups
	}

	pub fn restore_all(&mut self, groups: BTreeMap<String, Group>, seqs: BTreeMap<String, u64>) {
		self.groups = groups;
		self.seqs = seqs;
	}

	/// The leader's next sequence number for `group`, incrementing it
	/// (spec §4.7 step 1). Panics if `group` has never been created —
	/// callers must check `get()` first.
	pub fn next_seq(&mut self, group: &str) -> u64 {
		let seq = self.seqs.entry(group.to_string()).or_insert(0);
		let n = *seq;
		*seq += 1;
		n
	}

	pub fn seqs(&self) -> &BTreeMap<String, u64> {
		&self.seqs
	}

	pub fn insert_vote(&mut self, vote: Vote) {
		self.votes.insert(vote.vote_id.clone(), vote);
	}

	pub fn vote_mut(&mut self, vote_id: &str) -> Option<&mut Vote> {
		self.votes.get_mut(vote_id)
	}

	pub fn vote(&self, vote_id: &str) -> Option<&Vote> {
		self.votes.get(vote_id)
	}

	pub fn votes(&self) -> &BTreeMap<String, Vote> {
		&self.votes
	}

	pub fn restore_votes(&mut self, votes: BTreeMap<String, Vote>) {
		self.votes = votes;
	}
}
