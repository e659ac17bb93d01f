//! Error taxonomy for the voting engine (spec §7).
//!
//! Every kind below is non-fatal to the process: handlers log and either
//! surface an `ERROR{..}` envelope (`AuthFailed`, `BadRequest` and the
//! group/vote semantic errors) or recover locally (`TransientIo`,
//! `PeerCrash`, `OutOfOrderAck`, `ElectionStale`).

error_chain! {
	foreign_links {
		Io(::std::io::Error);
		Json(::serde_json::Error);
	}

	errors {
		/// Missing or incorrect bearer token.
		AuthFailed {
			description("authentication failed")
			display("AUTH_FAILED")
		}

		/// Missing required field, unknown message type, or malformed JSON.
		BadRequest(reason: String) {
			description("bad request")
			display("BAD_REQUEST: {}", reason)
		}

		GroupExists(group: String) {
			description("group already exists")
			display("GROUP_EXISTS: {}", group)
		}

		NoSuchGroup(group: String) {
			description("no such group")
			display("NO_SUCH_GROUP: {}", group)
		}

		NotAMember(group: String) {
			description("not a member of group")
			display("NOT_A_MEMBER: {}", group)
		}

		/// A UDP send failed. Logged and otherwise ignored; the FIFO
		/// retransmit loop is what actually recovers vote traffic.
		TransientIo(detail: String) {
			description("transient I/O failure")
			display("TRANSIENT_IO: {}", detail)
		}

		/// The predecessor missed its heartbeat deadline.
		PeerCrash(id: String) {
			description("peer crash detected")
			display("PEER_CRASH: {}", id)
		}

		/// A VOTE_ACK referenced a (group, seq) with no pending entry.
		OutOfOrderAck {
			description("ack for unknown pending entry")
			display("OUT_OF_ORDER_ACK")
		}

		/// An HS_ELECTION probe arrived carrying a lower id than ours.
		ElectionStale {
			description("stale election probe")
			display("ELECTION_STALE")
		}
	}
}

impl ErrorKind {
	/// The wire-level error code for kinds that are ever surfaced to a
	/// client in an `ERROR{error}` envelope. Returns `None` for kinds
	/// that are always handled locally (spec §7's "Local recovery"
	/// column).
	pub fn client_code(&self) -> Option<&'static str> {
		match self {
			ErrorKind::AuthFailed => Some("AUTH_FAILED"),
			ErrorKind::BadRequest(_) => Some("BAD_REQUEST"),
			ErrorKind::GroupExists(_) => Some("GROUP_EXISTS"),
			ErrorKind::NoSuchGroup(_) => Some("NO_SUCH_GROUP"),
			ErrorKind::NotAMember(_) => Some("NOT_A_MEMBER"),
			_ => None,
		}
	}
}
