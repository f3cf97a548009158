use std::net::SocketAddrV4;

use slog::{info, o};

/// One registered encapsulation session on a TCP connection.
#[derive(Debug, Clone)]
pub struct Session {
	pub handle: u32,
	pub peer: SocketAddrV4,
	/// Remaining inactivity budget in milliseconds; reloaded on traffic.
	pub inactivity_ms: i64,
}

/// Owns the registered sessions and their inactivity accounting. Handles are
/// never zero and never reused within a process run.
#[derive(Debug)]
pub struct SessionManager {
	sessions: Vec<Session>,
	next_handle: u32,
	logger: slog::Logger,
}

impl SessionManager {
	pub fn new(logger: slog::Logger) -> SessionManager {
		SessionManager {
			sessions: Vec::new(),
			next_handle: 0,
			logger: logger.new(o!("component" => "enip-session")),
		}
	}

	pub fn register(&mut self, peer: SocketAddrV4, inactivity_timeout_s: u16) -> u32 {
		self.next_handle += 1;
		let handle = self.next_handle;
		self.sessions.push(Session {
			handle,
			peer,
			inactivity_ms: inactivity_timeout_s as i64 * 1000,
		});
		info!(self.logger, "session registered"; "handle" => handle, "peer" => %peer);
		handle
	}

	pub fn unregister(&mut self, handle: u32) {
		if self.sessions.iter().any(|s| s.handle == handle) {
			info!(self.logger, "session unregistered"; "handle" => handle);
		}
		self.sessions.retain(|s| s.handle != handle);
	}

	pub fn is_valid(&self, handle: u32) -> bool {
		self.sessions.iter().any(|s| s.handle == handle)
	}

	pub fn count(&self) -> usize {
		self.sessions.len()
	}

	/// Reload a session's inactivity budget after traffic on its TCP half.
	pub fn touch(&mut self, handle: u32, inactivity_timeout_s: u16) {
		if let Some(session) = self.sessions.iter_mut().find(|s| s.handle == handle) {
			session.inactivity_ms = inactivity_timeout_s as i64 * 1000;
		}
	}

	/// Advance the inactivity timers, returning the handles whose TCP halves
	/// have been silent for the whole timeout. The caller drops the sessions
	/// and closes the sockets.
	pub fn manage(&mut self, elapsed_ms: u64) -> Vec<u32> {
		let mut expired = Vec::new();
		for session in self.sessions.iter_mut() {
			session.inactivity_ms -= elapsed_ms as i64;
			if session.inactivity_ms <= 0 {
				expired.push(session.handle);
			}
		}
		for &handle in expired.iter() {
			info!(self.logger, "session timed out"; "handle" => handle);
		}
		self.sessions.retain(|s| s.inactivity_ms > 0);
		expired
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn manager() -> SessionManager {
		SessionManager::new(common::obs::discard_logger())
	}

	#[test]
	fn test_register_and_touch() {
		let mut sessions = manager();
		let handle = sessions.register("10.0.0.2:50000".parse().unwrap(), 120);
		assert!(sessions.is_valid(handle));
		assert_ne!(handle, 0);

		/* one second short of the timeout, then traffic, then survive */
		assert!(sessions.manage(119_000).is_empty());
		sessions.touch(handle, 120);
		assert!(sessions.manage(119_000).is_empty());
		assert_eq!(sessions.manage(1_000), vec![handle]);
		assert!(!sessions.is_valid(handle));
	}

	#[test]
	fn test_handles_are_unique() {
		let mut sessions = manager();
		let first = sessions.register("10.0.0.2:50000".parse().unwrap(), 120);
		sessions.unregister(first);
		let second = sessions.register("10.0.0.2:50001".parse().unwrap(), 120);
		assert_ne!(first, second);
	}
}
