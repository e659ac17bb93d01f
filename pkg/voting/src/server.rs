//! Ties C1–C8 together: the shared, mutex-protected server state, the
//! unicast/multicast dispatch, and the five background tasks (spec §5).
//!
//! Grounded in the teacher's `ConsensusModuleHandle = Arc<Mutex<
//! ConsensusModule>>` shape (`raft::consensus`): one coarse-grained lock
//! around all mutable state, which the spec explicitly allows
//! ("throughput is bounded by UDP, not CPU").

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use std::thread;
use std::collections::BTreeMap;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::election::{self, Outbound};
use crate::errors::*;
use crate::failure_detector::FailureDetector;
use crate::groups::GroupRegistry;
use crate::membership::{self, Gossip, Membership};
use crate::multicast::FifoMulticast;
use crate::protocol::{Envelope, SessionSnapshot};
use crate::replication::{self, SnapshotInput};
use crate::session::SessionStore;
use crate::transport::{self, Transport};
use crate::types::ElectionState;

/// Upper bound on a client-supplied `START_VOTE` timeout. `Duration::
/// from_secs_f64` panics on inputs outside its representable range, and
/// no legitimate ballot needs to stay open for more than an hour, so
/// anything past this is rejected rather than clamped (spec §7: bad
/// client input is never fatal to the process).
const MAX_VOTE_TIMEOUT_SECS: f64 = 3600.0;

pub struct ServerState {
	pub membership: Membership,
	pub election: ElectionState,
	pub failure_detector: FailureDetector,
	pub sessions: SessionStore,
	pub groups: GroupRegistry,
	pub fifo: FifoMulticast,
}

pub struct Server {
	pub config: Config,
	pub transport: Transport,
	pub state: Mutex<ServerState>,
	pub shutdown: AtomicBool,
}

impl Server {
	pub fn new(config: Config) -> Result<Server> {
		let transport = Transport::bind(&config)?;
		let self_id = config.self_id();
		let state = ServerState {
			membership: Membership::new(self_id),
			election: ElectionState::default(),
			failure_detector: FailureDetector::new(config.hb_timeout),
			sessions: SessionStore::new(),
			groups: GroupRegistry::new(),
			fifo: FifoMulticast::new(),
		};
		Ok(Server { config, transport, state: Mutex::new(state), shutdown: AtomicBool::new(false) })
	}

	pub fn run(self: Arc<Server>) {
		info!("starting voting server on {}", self.config.self_id());

		// Single-node view declares leadership immediately, with no
		// messages, per spec §4.4 "Edge cases".
		{
			let mut state = self.state.lock().unwrap();
			let out = election::hs_start(&mut state.election, &state.membership);
			drop(state);
			self.send_all(out);
		}

		let mut handles = Vec::new();

		let s1 = self.clone();
		handles.push(thread::spawn(move || s1.run_multicast_receiver()));

		let s2 = self.clone();
		handles.push(thread::spawn(move || s2.run_announce_and_heartbeat()));

		let s3 = self.clone();
		handles.push(thread::spawn(move || s3.run_unicast_dispatch()));

		let s4 = self.clone();
		handles.push(thread::spawn(move || s4.run_retransmit_loop()));

		let s5 = self.clone();
		handles.push(thread::spawn(move || s5.run_housekeeping_tick()));

		for h in handles {
			let _ = h.join();
		}

		info!("shutdown complete");
	}

	pub fn request_shutdown(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
	}

	fn is_shutting_down(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	fn send_all(&self, outbound: Vec<Outbound>) {
		for o in outbound {
			match o.to.parse::<SocketAddr>() {
				Ok(addr) => self.transport.send_json(addr, &o.envelope),
				Err(e) => warn!("cannot address peer {}: {}", o.to, e),
			}
		}
	}

	// ---- T1: multicast receiver (membership & discovery) ----

	fn run_multicast_receiver(self: Arc<Server>) {
		while !self.is_shutting_down() {
			match self.transport.recv_gossip() {
				Ok(Some((line, addr))) => self.handle_gossip(&line, addr, &self),
				Ok(None) => continue,
				Err(e) => {
					warn!("multicast recv error: {}", e);
					continue;
				}
			}
		}
	}

	fn handle_gossip(&self, line: &str, addr: SocketAddr, arc_self: &Arc<Server>) {
		let parsed = match membership::parse_gossip(line) {
			Some(g) => g,
			None => {
				debug!("dropping unrecognized gossip line: {:?}", line);
				return;
			}
		};

		match parsed {
			Gossip::Announce(sid) => {
				let mut state = self.state.lock().unwrap();
				if sid == state.membership.self_id {
					return;
				}
				let is_new = state.membership.insert(&sid);
				if is_new {
					state.failure_detector.reset(Instant::now());
				}
				let should_schedule = is_new && !state.election.in_progress && state.membership.len() > 1;
				drop(state);
				if is_new {
					info!("server joined: {}", sid);
				}
				if should_schedule {
					Server::schedule_election(arc_self);
				}
			}
			Gossip::Crash(sid) => {
				let mut state = self.state.lock().unwrap();
				if sid == state.membership.self_id {
					return;
				}
				let removed = state.membership.remove(&sid);
				if removed {
					state.failure_detector.reset(Instant::now());
				}
				drop(state);
				if removed {
					info!("server crashed: {}", sid);
					let mut state = self.state.lock().unwrap();
					let out = election::hs_start(&mut state.election, &state.membership);
					drop(state);
					self.send_all(out);
				}
			}
			Gossip::WhoIsLeader => {
				let state = self.state.lock().unwrap();
				if state.election.is_leader {
					let reply = membership::leader_line(&state.membership.self_id);
					drop(state);
					self.transport.reply_gossip(&reply, addr);
				}
			}
			Gossip::Leader(_) => {
				// Clients consume this; servers have no use for it.
			}
		}
	}

	/// Spawns a short-lived timer that starts an HS election after the
	/// settling delay, unless one has started in the meantime (spec
	/// §4.2: "schedule an HS election after a short settling delay").
	///
	/// Takes the owning `Arc` as a plain argument rather than as `self`
	/// so it can hand a genuinely owned, `'static` handle to the spawned
	/// thread; mirrors how `run()` clones `self` before each T1-T5 spawn.
	fn schedule_election(server: &Arc<Server>) {
		let server = Arc::clone(server);
		let delay = server.config.settle_delay;
		thread::spawn(move || {
			transport::sleep(delay);
			if server.is_shutting_down() {
				return;
			}
			let mut state = server.state.lock().unwrap();
			if state.election.in_progress {
				return;
			}
			let out = election::hs_start(&mut state.election, &state.membership);
			drop(state);
			server.send_all(out);
		});
	}

	// ---- T2: multicast announcer + heartbeat ticker (combined 1s tick) ----

	fn run_announce_and_heartbeat(self: Arc<Server>) {
		while !self.is_shutting_down() {
			let self_id = {
				let state = self.state.lock().unwrap();
				state.membership.self_id.clone()
			};
			self.transport.send_gossip(&membership::announce_line(&self_id));
			self.send_heartbeat_and_check_crash();
			transport::sleep(self.config.tick);
		}
	}

	fn send_heartbeat_and_check_crash(&self) {
		let now = Instant::now();
		let mut state = self.state.lock().unwrap();

		if state.membership.left == state.membership.self_id {
			// Solo view: detector is inert (spec §3).
			return;
		}

		let crashed = state.failure_detector.tick(now);
		let left = state.membership.left.clone();

		if crashed {
			drop(state);
			warn!("heartbeat timeout for {}, declaring crash", left);
			self.transport.send_gossip(&membership::crash_line(&left));
			transport::sleep(self.config.settle_delay);
			let mut state = self.state.lock().unwrap();
			// The crash gossip we just sent will also reach us and
			// remove `left` from the view; start our own election too
			// in case that race hasn't resolved yet.
			state.membership.remove(&left);
			state.failure_detector.reset(Instant::now());
			let out = election::hs_start(&mut state.election, &state.membership);
			drop(state);
			self.send_all(out);
			return;
		}

		if let Some(addr) = left.parse::<SocketAddr>().ok() {
			drop(state);
			self.transport.send_json(addr, &Envelope::HEARTBEAT { id: self.config.self_id() });
		}
	}

	// ---- T3: unicast receiver dispatching to handlers ----

	fn run_unicast_dispatch(self: Arc<Server>) {
		while !self.is_shutting_down() {
			match self.transport.recv_json() {
				Ok(Some((envelope, from))) => self.dispatch(envelope, from),
				Ok(None) => continue,
				Err(e) => {
					warn!("unicast recv error: {}", e);
					continue;
				}
			}
		}
	}

	fn dispatch(&self, envelope: Envelope, from: SocketAddr) {
		match envelope {
			// -- server <-> server: election --
			Envelope::HS_ELECTION { id, phase, direction, hop } => {
				let mut state = self.state.lock().unwrap();
				let out = election::on_election(&mut state.election, &state.membership, id, phase, direction, hop);
				drop(state);
				self.send_all(out);
			}
			Envelope::HS_REPLY { id, direction } => {
				let mut state = self.state.lock().unwrap();
				let (out, became_leader) = election::on_reply(&mut state.election, &state.membership, id, direction);
				if became_leader {
					info!("declared self leader");
					let snapshot = build_snapshot(&state);
					let membership = clone_membership_view(&state.membership);
					drop(state);
					self.send_all(out);
					replication::broadcast_to_followers(&self.transport, &membership, &snapshot);
				} else {
					drop(state);
					self.send_all(out);
				}
			}
			Envelope::HS_LEADER { id } => {
				let mut state = self.state.lock().unwrap();
				let out = election::on_leader(&mut state.election, &state.membership, id.clone());
				let became_leader = state.election.is_leader;
				drop(state);
				self.send_all(out);
				if became_leader {
					info!("leader is now {}", id);
				}
			}

			// -- server <-> server: failure detection --
			Envelope::HEARTBEAT { id: _ } => {
				self.transport.send_json(from, &Envelope::HEARTBEAT_ACK { id: self.config.self_id() });
			}
			Envelope::HEARTBEAT_ACK { id } => {
				let mut state = self.state.lock().unwrap();
				if id == state.membership.left {
					state.failure_detector.on_ack(Instant::now());
				}
			}

			// -- server <-> server: replication --
			Envelope::REPL_REGISTER { id, token, addr } => {
				let mut state = self.state.lock().unwrap();
				state.sessions.install(id, token, addr);
			}
			Envelope::REPL_CREATE_GROUP { group } => {
				let mut state = self.state.lock().unwrap();
				state.groups.install_group(group);
			}
			Envelope::REPL_JOIN_GROUP { id, group } => {
				let mut state = self.state.lock().unwrap();
				if let Err(e) = state.groups.join_group(id, &group) {
					debug!("replicated join failed locally: {}", e);
				}
			}
			Envelope::REPL_LEAVE_GROUP { id, group } => {
				let mut state = self.state.lock().unwrap();
				if let Err(e) = state.groups.leave_group(&id, &group) {
					debug!("replicated leave failed locally: {}", e);
				}
			}
			Envelope::REPL_VOTE { vote_id, group, topic, options, timeout: _, votes } => {
				let mut state = self.state.lock().unwrap();
				let existing = state.groups.vote(&vote_id).cloned();
				let merged = replication::merged_vote(existing.as_ref(), vote_id, group, topic, options, votes);
				state.groups.insert_vote(merged);
			}
			Envelope::REPL_STATE { sessions, groups, votes, seqs } => {
				let mut state = self.state.lock().unwrap();
				for (id, snap) in sessions {
					state.sessions.install(id, snap.token, snap.addr);
				}
				state.groups.restore_all(groups, seqs);
				state.groups.restore_votes(votes);
				info!("applied full state snapshot from new leader");
			}

			// -- client -> leader --
			Envelope::REGISTER { id } => self.handle_register(id, from),
			Envelope::CREATE_GROUP { id, token, group } => self.handle_create_group(id, token, group, from),
			Envelope::GET_GROUPS { id, token } => self.handle_get_groups(id, token, from),
			Envelope::JOIN_GROUP { id, token, group } => self.handle_join_group(id, token, group, from),
			Envelope::JOINED_GROUPS { id, token } => self.handle_joined_groups(id, token, from),
			Envelope::LEAVE_GROUP { id, token, group } => self.handle_leave_group(id, token, group, from),
			Envelope::START_VOTE { id, token, group, topic, options, timeout } => {
				self.handle_start_vote(id, token, group, topic, options, timeout, from)
			}
			Envelope::VOTE_ACK { id, token, group, vote_id, seq, vote } => {
				self.handle_vote_ack(id, token, group, vote_id, seq, vote, from)
			}

			// -- leader -> client: these never arrive at a server --
			other => {
				debug!("ignoring unexpected envelope at server: {:?}", other);
			}
		}
	}

	fn require_leader(&self) -> bool {
		let state = self.state.lock().unwrap();
		state.election.is_leader
	}

	fn handle_register(&self, id: String, from: SocketAddr) {
		if !self.require_leader() {
			debug!("dropping REGISTER at non-leader");
			return;
		}
		let (token, membership) = {
			let mut state = self.state.lock().unwrap();
			let token = state.sessions.register(id.clone(), from);
			(token, clone_membership_view(&state.membership))
		};
		self.transport.send_json(from, &Envelope::REGISTER_OK { token: token.clone() });
		replication::broadcast_to_followers(
			&self.transport,
			&membership,
			&replication::repl_register(id, token, from),
		);
	}

	fn handle_create_group(&self, id: String, token: String, group: String, from: SocketAddr) {
		if !self.require_leader() {
			return;
		}
		let mut state = self.state.lock().unwrap();
		if let Err(e) = state.sessions.authenticate(&id, &token) {
			drop(state);
			self.reply_error(from, &e);
			return;
		}
		let result = state.groups.create_group(id, group.clone());
		match result {
			Ok(()) => {
				let created = state.groups.get(&group).cloned();
				let membership = clone_membership_view(&state.membership);
				drop(state);
				self.transport.send_json(from, &Envelope::CREATE_GROUP_OK { group });
				if let Some(g) = created {
					replication::broadcast_to_followers(&self.transport, &membership, &replication::repl_create_group(g));
				}
			}
			Err(e) => {
				drop(state);
				self.reply_error(from, &e);
			}
		}
	}

	fn handle_get_groups(&self, id: String, token: String, from: SocketAddr) {
		if !self.require_leader() {
			return;
		}
		let state = self.state.lock().unwrap();
		if let Err(e) = state.sessions.authenticate(&id, &token) {
			drop(state);
			self.reply_error(from, &e);
			return;
		}
		let groups = state.groups.group_names();
		drop(state);
		self.transport.send_json(from, &Envelope::GET_GROUPS_OK { groups });
	}

	fn handle_join_group(&self, id: String, token: String, group: String, from: SocketAddr) {
		if !self.require_leader() {
			return;
		}
		let mut state = self.state.lock().unwrap();
		if let Err(e) = state.sessions.authenticate(&id, &token) {
			drop(state);
			self.reply_error(from, &e);
			return;
		}
		match state.groups.join_group(id.clone(), &group) {
			Ok(()) => {
				let membership = clone_membership_view(&state.membership);
				drop(state);
				self.transport.send_json(from, &Envelope::JOIN_GROUP_OK { group: group.clone() });
				replication::broadcast_to_followers(&self.transport, &membership, &replication::repl_join_group(id, group));
			}
			Err(e) => {
				drop(state);
				self.reply_error(from, &e);
			}
		}
	}

	fn handle_joined_groups(&self, id: String, token: String, from: SocketAddr) {
		if !self.require_leader() {
			return;
		}
		let state = self.state.lock().unwrap();
		if let Err(e) = state.sessions.authenticate(&id, &token) {
			drop(state);
			self.reply_error(from, &e);
			return;
		}
		let groups = state.groups.joined_groups(&id);
		drop(state);
		self.transport.send_json(from, &Envelope::JOINED_GROUPS_OK { groups });
	}

	fn handle_leave_group(&self, id: String, token: String, group: String, from: SocketAddr) {
		if !self.require_leader() {
			return;
		}
		let mut state = self.state.lock().unwrap();
		if let Err(e) = state.sessions.authenticate(&id, &token) {
			drop(state);
			self.reply_error(from, &e);
			return;
		}
		match state.groups.leave_group(&id, &group) {
			Ok(()) => {
				let membership = clone_membership_view(&state.membership);
				drop(state);
				self.transport.send_json(from, &Envelope::LEAVE_GROUP_OK { group: group.clone() });
				replication::broadcast_to_followers(&self.transport, &membership, &replication::repl_leave_group(id, group));
			}
			Err(e) => {
				drop(state);
				self.reply_error(from, &e);
			}
		}
	}

	fn handle_start_vote(
		&self,
		id: String,
		token: String,
		group: String,
		topic: String,
		options: Vec<String>,
		timeout: f64,
		from: SocketAddr,
	) {
		if !self.require_leader() {
			return;
		}
		if !(0.0..=MAX_VOTE_TIMEOUT_SECS).contains(&timeout) {
			self.reply_error(from, &ErrorKind::BadRequest(format!("timeout out of range: {}", timeout)).into());
			return;
		}
		let mut state = self.state.lock().unwrap();
		if let Err(e) = state.sessions.authenticate(&id, &token) {
			drop(state);
			self.reply_error(from, &e);
			return;
		}
		let members = match state.groups.get(&group) {
			Some(g) => g.members.clone(),
			None => {
				drop(state);
				self.reply_error(from, &ErrorKind::NoSuchGroup(group).into());
				return;
			}
		};

		let vote_id = Uuid::new_v4().to_string();
		let seq = state.groups.next_seq(&group);
		state.groups.insert_vote(crate::types::Vote {
			vote_id: vote_id.clone(),
			group: group.clone(),
			topic: topic.clone(),
			options: options.clone(),
			tallies: Vec::new(),
			finalized: false,
		});

		let envelope = Envelope::VOTE {
			vote_id: vote_id.clone(),
			group: group.clone(),
			topic: topic.clone(),
			options: options.clone(),
			seq,
			sender: state.membership.self_id.clone(),
		};

		let timeout_duration = std::time::Duration::from_secs_f64(timeout);
		state.fifo.track(group.clone(), seq, members.clone(), envelope.clone(), timeout_duration, Some(vote_id.clone()), Instant::now());

		let addrs: Vec<SocketAddr> = members
			.iter()
			.filter_map(|cid| state.sessions.get(cid).map(|s| s.addr))
			.collect();
		let vote_snapshot = state.groups.vote(&vote_id).cloned();
		let membership = clone_membership_view(&state.membership);
		drop(state);

		for addr in addrs {
			self.transport.send_json(addr, &envelope);
		}

		self.transport.send_json(from, &Envelope::START_VOTE_OK { group, topic, options, timeout });

		if let Some(v) = vote_snapshot {
			replication::broadcast_to_followers(&self.transport, &membership, &replication::repl_vote(&v, timeout));
		}
	}

	fn handle_vote_ack(&self, id: String, token: String, group: String, vote_id: String, seq: u64, vote: String, from: SocketAddr) {
		if !self.require_leader() {
			return;
		}
		let mut state = self.state.lock().unwrap();
		if let Err(e) = state.sessions.authenticate(&id, &token) {
			drop(state);
			self.reply_error(from, &e);
			return;
		}

		if !state.fifo.ack(&group, seq, &id) {
			debug!("OUT_OF_ORDER_ACK for ({}, {})", group, seq);
			return;
		}

		let mut replicate: Option<crate::types::Vote> = None;
		if let Some(v) = state.groups.vote_mut(&vote_id) {
			if !v.finalized {
				v.record_ballot(id, vote);
				replicate = Some(v.clone());
			}
		}

		if let Some(v) = replicate {
			let membership = clone_membership_view(&state.membership);
			drop(state);
			// Best-effort freshness for a takeover mid-vote: spec §4.8
			// doesn't specify a cadence for re-replicating a vote's
			// tallies, so this implementation repeats REPL_VOTE on
			// every recorded ballot (documented in DESIGN.md).
			replication::broadcast_to_followers(&self.transport, &membership, &replication::repl_vote(&v, 0.0));
		}
	}

	fn reply_error(&self, from: SocketAddr, err: &Error) {
		if let Some(code) = err.kind().client_code() {
			self.transport.send_json(from, &Envelope::ERROR { error: code.to_string() });
		} else {
			warn!("unsurfaced error: {}", err);
		}
	}

	// ---- T4: FIFO retransmit loop (500ms tick) ----

	fn run_retransmit_loop(self: Arc<Server>) {
		while !self.is_shutting_down() {
			transport::sleep(self.config.retransmit_tick);
			self.retransmit_and_finalize();
		}
	}

	fn retransmit_and_finalize(&self) {
		let now = Instant::now();
		let (retransmit, finished) = {
			let mut state = self.state.lock().unwrap();
			let (retransmit, finished) = state.fifo.sweep(now);
			let mut addrs = Vec::new();
			for item in &retransmit {
				for cid in &item.recipients {
					if let Some(s) = state.sessions.get(cid) {
						addrs.push((s.addr, item.envelope.clone()));
					}
				}
			}
			(addrs, finished)
		};

		for (addr, envelope) in retransmit {
			self.transport.send_json(addr, &envelope);
		}

		for entry in finished {
			if let Some(vote_id) = entry.vote_id {
				self.finalize_vote(&vote_id);
			}
		}
	}

	/// Finalizes a vote exactly once (spec §4.7, "Finalization"):
	/// tallies, computes the winner, and multicasts `VOTE_RESULT` to
	/// every *current* group member.
	fn finalize_vote(&self, vote_id: &str) {
		let (result_envelope, recipient_addrs) = {
			let mut state = self.state.lock().unwrap();
			let (group, topic, winner) = match state.groups.vote_mut(vote_id) {
				Some(v) if !v.finalized => {
					v.finalized = true;
					(v.group.clone(), v.topic.clone(), v.winner())
				}
				_ => return,
			};
			let envelope = Envelope::VOTE_RESULT { vote_id: vote_id.to_string(), group: group.clone(), topic, winner };
			let addrs: Vec<SocketAddr> = state
				.groups
				.get(&group)
				.map(|g| g.members.iter().filter_map(|cid| state.sessions.get(cid).map(|s| s.addr)).collect())
				.unwrap_or_default();
			(envelope, addrs)
		};

		for addr in recipient_addrs {
			self.transport.send_json(addr, &result_envelope);
		}
		info!("finalized vote {}", vote_id);
	}

	// ---- T5: optional housekeeping tick ----

	fn run_housekeeping_tick(self: Arc<Server>) {
		// Optional per spec §5. `env_logger` writes synchronously, so
		// there is no buffered log to flush; this tick is kept only so
		// the shutdown-polling shape matches T1-T4 symmetrically.
		while !self.is_shutting_down() {
			transport::sleep(std::time::Duration::from_millis(200));
		}
	}
}

fn clone_membership_view(membership: &Membership) -> Membership {
	Membership { self_id: membership.self_id.clone(), view: membership.view.clone(), left: membership.left.clone(), right: membership.right.clone() }
}

fn build_snapshot(state: &ServerState) -> Envelope {
	let sessions: BTreeMap<String, SessionSnapshot> = state
		.sessions
		.iter()
		.map(|(id, s)| (id.clone(), SessionSnapshot { token: s.token.clone(), addr: s.addr }))
		.collect();
	replication::repl_state(SnapshotInput {
		sessions,
		groups: state.groups.all().clone(),
		votes: state.groups.votes().clone(),
		seqs: state.groups.seqs().clone(),
	})
}
