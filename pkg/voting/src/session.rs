//! Authenticated client sessions (spec §4.5, component C5).

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::RngCore;

use crate::errors::*;
use crate::types::{ClientId, Session};

pub struct SessionStore {
	sessions: HashMap<ClientId, Session>,
}

impl SessionStore {
	pub fn new() -> SessionStore {
		SessionStore { sessions: HashMap::new() }
	}

	/// Generates a fresh 128-bit token, records the session, and returns
	/// the hex token to hand back in `REGISTER_OK` (spec §4.5, §8
	/// invariant 3).
	pub fn register(&mut self, id: ClientId, addr: SocketAddr) -> String {
		let mut raw = [0u8; 16];
		rand::thread_rng().fill_bytes(&mut raw);
		let token = core::to_hex(&raw);
		self.sessions.insert(id, Session { token: token.clone(), addr });
		token
	}

	/// Used by `REPL_REGISTER` on followers, and by `REPL_STATE` restore
	/// on a new leader — installs a session verbatim rather than
	/// generating a new token.
	pub fn install(&mut self, id: ClientId, token: String, addr: SocketAddr) {
		self.sessions.insert(id, Session { token, addr });
	}

	pub fn get(&self, id: &str) -> Option<&Session> {
		self.sessions.get(id)
	}

	/// Verifies `(id, token)` in constant time relative to the stored
	/// token (spec §4.5, §8 invariant 4) and returns the client's last
	/// known address on success.
	pub fn authenticate(&self, id: &str, token: &str) -> Result<SocketAddr> {
		match self.sessions.get(id) {
			Some(session) if core::consttime_eq(session.token.as_bytes(), token.as_bytes()) => {
				Ok(session.addr)
			}
			_ => Err(ErrorKind::AuthFailed.into()),
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &Session)> {
		self.sessions.iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn register_then_authenticate_succeeds() {
		let mut store = SessionStore::new();
		let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
		let token = store.register("client-1".to_string(), addr);
		assert_eq!(token.len(), 32);
		assert!(store.authenticate("client-1", &token).is_ok());
	}

	#[test]
	fn wrong_token_is_rejected() {
		let mut store = SessionStore::new();
		let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
		let token = store.register("client-1".to_string(), addr);
		let mut wrong = token.clone();
		wrong.replace_range(0..1, if &wrong[0..1] == "0" { "1" } else { "0" });
		assert!(store.authenticate("client-1", &wrong).is_err());
	}

	#[test]
	fn unknown_client_is_rejected() {
		let store = SessionStore::new();
		assert!(store.authenticate("nobody", "deadbeef").is_err());
	}

	#[test]
	fn tokens_are_unique_across_registrations() {
		let mut store = SessionStore::new();
		let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
		let t1 = store.register("a".to_string(), addr);
		let t2 = store.register("b".to_string(), addr);
		assert_ne!(t1, t2);
	}
}
