//! Wire envelopes (spec §6). One internally-tagged enum covers every
//! unicast JSON message the engine sends or receives, client-facing and
//! server-to-server alike. `#[serde(tag = "type")]` gives exactly the
//! `{"type":"REGISTER", ...}` shape the spec's envelopes describe.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::types::{Ballot, Direction, Group, Vote};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
	pub token: String,
	pub addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(non_camel_case_types)]
pub enum Envelope {
	// -- client -> leader --
	REGISTER { id: String },
	CREATE_GROUP { id: String, token: String, group: String },
	GET_GROUPS { id: String, token: String },
	JOIN_GROUP { id: String, token: String, group: String },
	JOINED_GROUPS { id: String, token: String },
	LEAVE_GROUP { id: String, token: String, group: String },
	START_VOTE {
		id: String,
		token: String,
		group: String,
		topic: String,
		options: Vec<String>,
		timeout: f64,
	},
	VOTE_ACK {
		id: String,
		token: String,
		group: String,
		vote_id: String,
		#[serde(rename = "S")]
		seq: u64,
		vote: String,
	},

	// -- leader -> client --
	REGISTER_OK { token: String },
	CREATE_GROUP_OK { group: String },
	GET_GROUPS_OK { groups: Vec<String> },
	JOIN_GROUP_OK { group: String },
	JOINED_GROUPS_OK { groups: Vec<String> },
	LEAVE_GROUP_OK { group: String },
	START_VOTE_OK {
		group: String,
		topic: String,
		options: Vec<String>,
		timeout: f64,
	},
	VOTE {
		vote_id: String,
		group: String,
		topic: String,
		options: Vec<String>,
		#[serde(rename = "S")]
		seq: u64,
		sender: String,
	},
	VOTE_RESULT { vote_id: String, group: String, topic: String, winner: String },
	ERROR { error: String },

	// -- server <-> server --
	HS_ELECTION { id: String, phase: u32, direction: Direction, hop: u64 },
	HS_REPLY { id: String, direction: Direction },
	HS_LEADER { id: String },
	HEARTBEAT { id: String },
	HEARTBEAT_ACK { id: String },
	REPL_REGISTER { id: String, token: String, addr: SocketAddr },
	REPL_CREATE_GROUP { group: Group },
	REPL_JOIN_GROUP { id: String, group: String },
	REPL_LEAVE_GROUP { id: String, group: String },
	REPL_VOTE {
		vote_id: String,
		group: String,
		topic: String,
		options: Vec<String>,
		timeout: f64,
		votes: Vec<Ballot>,
	},
	REPL_STATE {
		sessions: BTreeMap<String, SessionSnapshot>,
		groups: BTreeMap<String, Group>,
		votes: BTreeMap<String, Vote>,
		#[serde(rename = "S")]
		seqs: BTreeMap<String, u64>,
	},
}

impl Envelope {
	pub fn to_json(&self) -> crate::errors::Result<Vec<u8>> {
		Ok(serde_json::to_vec(self)?)
	}

	pub fn from_json(bytes: &[u8]) -> crate::errors::Result<Envelope> {
		Ok(serde_json::from_slice(bytes)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn register_round_trips_with_type_tag() {
		let env = Envelope::REGISTER { id: "abc".into() };
		let json = env.to_json().unwrap();
		let text = String::from_utf8(json.clone()).unwrap();
		assert!(text.contains("\"type\":\"REGISTER\""));

		let back = Envelope::from_json(&json).unwrap();
		match back {
			Envelope::REGISTER { id } => assert_eq!(id, "abc"),
			_ => panic!("wrong variant"),
		}
	}

	#[test]
	fn vote_ack_seq_field_is_capital_s_on_the_wire() {
		let env = Envelope::VOTE_ACK {
			id: "c1".into(),
			token: "t".into(),
			group: "g".into(),
			vote_id: "v1".into(),
			seq: 3,
			vote: "a".into(),
		};
		let text = String::from_utf8(env.to_json().unwrap()).unwrap();
		assert!(text.contains("\"S\":3"));
	}

	#[test]
	fn unknown_type_tag_fails_to_parse_without_panicking() {
		let bad = br#"{"type":"NOT_A_REAL_MESSAGE"}"#;
		assert!(Envelope::from_json(bad).is_err());
	}
}
