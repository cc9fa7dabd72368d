// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A view of the shared factory output's lifecycle, as consumed by the
//! just-in-time fallback logic. Factory construction and signing live
//! elsewhere; this module only answers "what state is the factory in at
//! height h" and carries the per-client factory channel entries.

use crate::channel::Channel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactoryState {
	Active,
	Dying,
	Expired,
}

/// Lifecycle parameters of one published factory.
#[derive(Clone, Debug)]
pub struct Factory {
	pub id: u32,
	pub created_block: u32,
	pub active_blocks: u32,
	pub dying_blocks: u32,
}

impl Factory {
	pub fn new(id: u32, created_block: u32, active_blocks: u32, dying_blocks: u32) -> Self {
		Factory { id, created_block, active_blocks, dying_blocks }
	}

	pub fn state_at(&self, height: u32) -> FactoryState {
		let age = height.saturating_sub(self.created_block);
		if age < self.active_blocks {
			FactoryState::Active
		} else if age < self.active_blocks + self.dying_blocks {
			FactoryState::Dying
		} else {
			FactoryState::Expired
		}
	}
}

/// Per-client entry for a factory-anchored channel.
///
/// `ready` is flipped by the rotation logic once the client's channel inside
/// the current factory is usable; routing always prefers a ready entry over
/// any JIT fallback.
pub struct FactoryEntry {
	pub channel_id: u32,
	pub ready: bool,
	pub channel: Channel,
	/// Unix timestamp of the last message seen from this client.
	pub last_message_time: i64,
	pub offline_detected: bool,
}

impl FactoryEntry {
	pub fn new(channel_id: u32) -> Self {
		FactoryEntry {
			channel_id,
			ready: false,
			channel: Channel::default(),
			last_message_time: 0,
			offline_detected: false,
		}
	}

	/// Record client activity, clearing any offline flag.
	pub fn touch(&mut self, now: i64) {
		self.last_message_time = now;
		self.offline_detected = false;
	}

	pub fn is_stale(&self, now: i64, timeout_secs: u64) -> bool {
		self.last_message_time != 0 && now - self.last_message_time >= timeout_secs as i64
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn factory_lifecycle_by_height() {
		let f = Factory::new(0, 100, 5, 5);
		assert_eq!(f.state_at(100), FactoryState::Active);
		assert_eq!(f.state_at(104), FactoryState::Active);
		assert_eq!(f.state_at(105), FactoryState::Dying);
		assert_eq!(f.state_at(109), FactoryState::Dying);
		assert_eq!(f.state_at(110), FactoryState::Expired);
		assert_eq!(f.state_at(500), FactoryState::Expired);
	}

	#[test]
	fn factory_state_before_creation_height() {
		// A height below created_block saturates to age zero.
		let f = Factory::new(1, 100, 5, 5);
		assert_eq!(f.state_at(50), FactoryState::Active);
	}

	#[test]
	fn entry_staleness_and_reconnect() {
		let mut entry = FactoryEntry::new(3);
		assert!(!entry.is_stale(1_000_000, 120));

		entry.touch(1_000_000 - 200);
		assert!(entry.is_stale(1_000_000, 120));

		if entry.is_stale(1_000_000, 120) {
			entry.offline_detected = true;
		}
		assert!(entry.offline_detected);

		// Reconnect resets detection.
		entry.touch(1_000_000);
		assert!(!entry.offline_detected);
		assert!(!entry.is_stale(1_000_000, 120));
	}
}
