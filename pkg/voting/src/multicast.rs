//! FIFO reliable multicast engine (spec §4.7, component C7) — the
//! leader-side pending table with retransmission, and the receiver-side
//! hold-back reordering buffer. This is the subsystem SPEC_FULL.md notes
//! has no surviving counterpart in `original_source/`; it is built
//! directly from spec.md §4.7, in the teacher's bookkeeping style
//! (`raft::consensus`'s per-entry pending state, and its `Tick`'s
//! accumulated `messages: Vec<Message>` pattern, here realized as the
//! `Vec` of retransmit items `sweep` returns).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::protocol::Envelope;
use crate::types::{ClientId, PendingEntry};

pub struct FifoMulticast {
	pending: HashMap<(String, u64), PendingEntry>,
}

pub struct RetransmitItem {
	pub recipients: BTreeSet<ClientId>,
	pub envelope: Envelope,
}

pub struct FinishedEntry {
	pub group: String,
	pub seq: u64,
	pub vote_id: Option<String>,
}

impl FifoMulticast {
	pub fn new() -> FifoMulticast {
		FifoMulticast { pending: HashMap::new() }
	}

	/// Records a new outstanding multicast (spec §4.7 step 4). The
	/// caller has already assigned `seq` via `GroupRegistry::next_seq`
	/// and built the envelope carrying it; this just opens the pending
	/// entry that retransmission and acking operate on.
	pub fn track(
		&mut self,
		group: String,
		seq: u64,
		recipients: BTreeSet<ClientId>,
		envelope: Envelope,
		timeout: Duration,
		vote_id: Option<String>,
		now: Instant,
	) {
		self.pending.insert(
			(group, seq),
			PendingEntry { pending: recipients, deadline: now + timeout, envelope, vote_id },
		);
	}

	/// Removes `voter` from the pending set for `(group, seq)` on a
	/// `VOTE_ACK` (spec §4.7, "Leader on VOTE_ACK"). A reference to an
	/// unknown `(group, seq)` is a spec §7 `OUT_OF_ORDER_ACK` — silently
	/// ignored by returning `false`.
	pub fn ack(&mut self, group: &str, seq: u64, voter: &str) -> bool {
		match self.pending.get_mut(&(group.to_string(), seq)) {
			Some(entry) => {
				entry.pending.remove(voter);
				true
			}
			None => false,
		}
	}

	/// The 500ms retransmit tick (spec §4.7): entries with an empty
	/// pending set or a passed deadline are removed and reported as
	/// finished (invariant #7); everything else is re-sent verbatim.
	pub fn sweep(&mut self, now: Instant) -> (Vec<RetransmitItem>, Vec<FinishedEntry>) {
		let mut retransmit = Vec::new();
		let mut finished = Vec::new();

		self.pending.retain(|(group, seq), entry| {
			if entry.pending.is_empty() || now >= entry.deadline {
				finished.push(FinishedEntry {
					group: group.clone(),
					seq: *seq,
					vote_id: entry.vote_id.clone(),
				});
				false
			} else {
				retransmit.push(RetransmitItem {
					recipients: entry.pending.clone(),
					envelope: entry.envelope.clone(),
				});
				true
			}
		});

		(retransmit, finished)
	}

	#[cfg(test)]
	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}
}

/// Receiver-side per-sender FIFO delivery (spec §4.7, "Receiver
/// delivery"). Keyed by `(sender, group)` per SPEC_FULL.md's resolution
/// of the spec's open question on failover sequencer restarts.
pub struct HoldBack {
	next_deliver: HashMap<(String, String), i64>,
	buffered: HashMap<(String, String), BTreeMap<u64, Envelope>>,
}

impl HoldBack {
	pub fn new() -> HoldBack {
		HoldBack { next_deliver: HashMap::new(), buffered: HashMap::new() }
	}

	/// Feeds one received envelope for `(sender, group)` at sequence
	/// `seq`. Returns the envelopes that become deliverable, in order —
	/// possibly more than one if this message fills a gap ahead of
	/// already-buffered ones, possibly none if it's a duplicate or still
	/// out of order.
	pub fn on_receive(&mut self, sender: String, group: String, seq: u64, envelope: Envelope) -> Vec<Envelope> {
		let key = (sender, group);
		let r = *self.next_deliver.entry(key.clone()).or_insert(-1);

		if seq as i64 == r + 1 {
			let mut delivered = vec![envelope];
			let mut next = r + 1;
			if let Some(buf) = self.buffered.get_mut(&key) {
				loop {
					let want = (next + 1) as u64;
					match buf.remove(&want) {
						Some(env) => {
							delivered.push(env);
							next += 1;
						}
						None => break,
					}
				}
			}
			self.next_deliver.insert(key, next);
			delivered
		} else if (seq as i64) > r + 1 {
			self.buffered.entry(key).or_insert_with(BTreeMap::new).insert(seq, envelope);
			Vec::new()
		} else {
			// Duplicate: already delivered.
			Vec::new()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn env(n: u64) -> Envelope {
		Envelope::VOTE {
			vote_id: "v1".into(),
			group: "g".into(),
			topic: "t".into(),
			options: vec!["a".into(), "b".into()],
			seq: n,
			sender: "leader".into(),
		}
	}

	fn seq_of(e: &Envelope) -> u64 {
		match e {
			Envelope::VOTE { seq, .. } => *seq,
			_ => panic!("not a VOTE envelope"),
		}
	}

	#[test]
	fn track_then_sweep_before_deadline_retransmits() {
		let mut fm = FifoMulticast::new();
		let now = Instant::now();
		let mut recipients = BTreeSet::new();
		recipients.insert("x".to_string());
		fm.track("g".into(), 0, recipients, env(0), Duration::from_secs(10), None, now);

		let (retransmit, finished) = fm.sweep(now);
		assert_eq!(retransmit.len(), 1);
		assert!(finished.is_empty());
		assert_eq!(fm.pending_len(), 1);
	}

	#[test]
	fn ack_from_every_recipient_finalizes() {
		let mut fm = FifoMulticast::new();
		let now = Instant::now();
		let mut recipients = BTreeSet::new();
		recipients.insert("x".to_string());
		recipients.insert("y".to_string());
		fm.track("g".into(), 0, recipients, env(0), Duration::from_secs(10), Some("v1".into()), now);

		assert!(fm.ack("g", 0, "x"));
		let (retransmit, finished) = fm.sweep(now);
		assert_eq!(retransmit.len(), 1); // y still outstanding
		assert!(finished.is_empty());

		assert!(fm.ack("g", 0, "y"));
		let (retransmit, finished) = fm.sweep(now);
		assert!(retransmit.is_empty());
		assert_eq!(finished.len(), 1);
		assert_eq!(finished[0].vote_id.as_deref(), Some("v1"));
	}

	#[test]
	fn deadline_forces_finalization_regardless_of_outstanding_acks() {
		let mut fm = FifoMulticast::new();
		let now = Instant::now();
		let mut recipients = BTreeSet::new();
		recipients.insert("x".to_string());
		fm.track("g".into(), 0, recipients, env(0), Duration::from_millis(1), None, now);

		let later = now + Duration::from_millis(5);
		let (retransmit, finished) = fm.sweep(later);
		assert!(retransmit.is_empty());
		assert_eq!(finished.len(), 1);
	}

	#[test]
	fn ack_for_unknown_entry_is_ignored() {
		let mut fm = FifoMulticast::new();
		assert!(!fm.ack("g", 99, "x"));
	}

	#[test]
	fn holdback_delivers_in_order_despite_reordering() {
		let mut hb = HoldBack::new();
		let d1 = hb.on_receive("leader".into(), "g".into(), 1, env(1));
		assert!(d1.is_empty()); // out of order, buffered

		let d0 = hb.on_receive("leader".into(), "g".into(), 0, env(0));
		// delivering 0 should drain the buffered 1 right behind it
		assert_eq!(d0.len(), 2);
		assert_eq!(seq_of(&d0[0]), 0);
		assert_eq!(seq_of(&d0[1]), 1);

		let d2 = hb.on_receive("leader".into(), "g".into(), 2, env(2));
		assert_eq!(d2.len(), 1);
		assert_eq!(seq_of(&d2[0]), 2);
	}

	#[test]
	fn holdback_drops_duplicates() {
		let mut hb = HoldBack::new();
		let d0 = hb.on_receive("leader".into(), "g".into(), 0, env(0));
		assert_eq!(d0.len(), 1);
		let dup = hb.on_receive("leader".into(), "g".into(), 0, env(0));
		assert!(dup.is_empty());
	}

	#[test]
	fn holdback_is_independent_per_sender_and_group() {
		let mut hb = HoldBack::new();
		let from_a = hb.on_receive("a".into(), "g".into(), 0, env(0));
		let from_b = hb.on_receive("b".into(), "g".into(), 0, env(0));
		assert_eq!(from_a.len(), 1);
		assert_eq!(from_b.len(), 1);
	}
}
