// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The just-in-time fallback channel table and its lifecycle states.
//!
//! A fallback channel moves NONE -> FUNDING -> OPEN -> MIGRATING -> CLOSED;
//! FUNDING may abort straight to CLOSED when confirmation never arrives.
//! Channel ids carry the high bit so they can never collide with
//! factory-anchored ids.

pub mod retry;
pub mod router;

use crate::channel::Channel;

/// Fallback channel ids live at and above this base; factory-anchored ids
/// stay strictly below it. Membership in either set is the high bit.
pub const JIT_CHANNEL_ID_BASE: u32 = 0x8000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JitState {
	#[default]
	None,
	Funding,
	Open,
	Migrating,
	Closed,
}

impl JitState {
	pub fn as_str(&self) -> &'static str {
		match self {
			JitState::None => "none",
			JitState::Funding => "funding",
			JitState::Open => "open",
			JitState::Migrating => "migrating",
			JitState::Closed => "closed",
		}
	}

	/// Inverse of [`as_str`]; unrecognized strings map to `None`.
	///
	/// [`as_str`]: Self::as_str
	pub fn from_str(s: &str) -> JitState {
		match s {
			"funding" => JitState::Funding,
			"open" => JitState::Open,
			"migrating" => JitState::Migrating,
			"closed" => JitState::Closed,
			_ => JitState::None,
		}
	}
}

/// One fallback channel record.
pub struct JitChannel {
	pub jit_channel_id: u32,
	pub client_idx: usize,
	pub state: JitState,
	pub funding_txid: String,
	pub funding_vout: u32,
	pub funding_amount: u64,
	pub funding_confirmed: bool,
	pub created_at: i64,
	pub created_block: u32,
	/// The factory this channel folds into; nonzero only while MIGRATING
	/// or after a completed migration.
	pub target_factory_id: u32,
	pub channel: Channel,
}

impl JitChannel {
	pub fn new(client_idx: usize) -> Self {
		JitChannel {
			jit_channel_id: JIT_CHANNEL_ID_BASE | client_idx as u32,
			client_idx,
			state: JitState::None,
			funding_txid: String::new(),
			funding_vout: 0,
			funding_amount: 0,
			funding_confirmed: false,
			created_at: 0,
			created_block: 0,
			target_factory_id: 0,
			channel: Channel::default(),
		}
	}

	pub fn is_active(&self) -> bool {
		matches!(self.state, JitState::Open | JitState::Migrating)
	}
}

/// The per-LSP table of fallback channels, at most one non-closed record per
/// client. Slots of closed channels are reused.
pub struct JitStore {
	slots: Vec<JitChannel>,
	capacity: usize,
	enabled: bool,
}

impl JitStore {
	pub fn new(n_channels: usize) -> Self {
		JitStore { slots: Vec::with_capacity(n_channels), capacity: n_channels, enabled: true }
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	pub fn set_enabled(&mut self, enabled: bool) {
		self.enabled = enabled;
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Number of occupied slots, closed records included.
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	/// The unique non-closed record for a client, if any.
	pub fn find(&self, client_idx: usize) -> Option<&JitChannel> {
		self.slots.iter().find(|j| j.client_idx == client_idx && j.state != JitState::Closed)
	}

	pub fn find_mut(&mut self, client_idx: usize) -> Option<&mut JitChannel> {
		self.slots.iter_mut().find(|j| j.client_idx == client_idx && j.state != JitState::Closed)
	}

	pub fn is_active(&self, client_idx: usize) -> bool {
		self.find(client_idx).map_or(false, |j| j.is_active())
	}

	/// Whether a record for this client could be inserted right now.
	pub fn has_free_slot(&self, client_idx: usize) -> bool {
		self.find(client_idx).is_none()
			&& (self.slots.len() < self.capacity
				|| self.slots.iter().any(|j| j.state == JitState::Closed))
	}

	/// Insert a record, reusing a closed slot when the table is full.
	/// Returns `None` when the client already has a live record or no slot
	/// is available.
	pub fn insert(&mut self, jit: JitChannel) -> Option<&mut JitChannel> {
		if self.find(jit.client_idx).is_some() {
			return None;
		}
		if self.slots.len() < self.capacity {
			self.slots.push(jit);
			return self.slots.last_mut();
		}
		if let Some(pos) = self.slots.iter().position(|j| j.state == JitState::Closed) {
			self.slots[pos] = jit;
			return Some(&mut self.slots[pos]);
		}
		None
	}

	pub fn iter(&self) -> impl Iterator<Item = &JitChannel> {
		self.slots.iter()
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JitChannel> {
		self.slots.iter_mut()
	}

	/// Release every slot. After this, `find` is empty for all clients.
	pub fn clear(&mut self) {
		self.slots.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn init_find_and_cleanup() {
		let mut store = JitStore::new(4);
		assert!(store.is_enabled());
		assert_eq!(store.len(), 0);
		assert!(store.find(0).is_none());
		assert!(!store.is_active(0));

		let mut jit = JitChannel::new(1);
		jit.state = JitState::Open;
		store.insert(jit).unwrap();

		assert!(store.find(1).is_some());
		assert!(store.find(0).is_none());
		assert!(store.is_active(1));
		assert!(!store.is_active(0));

		store.clear();
		assert!(store.find(1).is_none());
		assert_eq!(store.len(), 0);
	}

	#[test]
	fn id_partition() {
		for i in 0..0x8000u32 {
			let jit_id = JIT_CHANNEL_ID_BASE | i;
			assert!(jit_id & 0x8000 != 0);
			assert!(i & 0x8000 == 0);
			assert_ne!(jit_id, i);
		}
	}

	#[test]
	fn at_most_one_live_record_per_client() {
		let mut store = JitStore::new(4);
		let mut a = JitChannel::new(2);
		a.state = JitState::Open;
		store.insert(a).unwrap();

		let mut b = JitChannel::new(2);
		b.state = JitState::Funding;
		assert!(store.insert(b).is_none());

		// A closed record does not block a new one.
		store.find_mut(2).unwrap().state = JitState::Closed;
		let mut c = JitChannel::new(2);
		c.state = JitState::Funding;
		assert!(store.insert(c).is_some());
		assert_eq!(store.find(2).unwrap().state, JitState::Funding);
	}

	#[test]
	fn closed_slot_reused_when_full() {
		let mut store = JitStore::new(2);
		let mut a = JitChannel::new(0);
		a.state = JitState::Closed;
		store.insert(a).unwrap();
		let mut b = JitChannel::new(1);
		b.state = JitState::Open;
		store.insert(b).unwrap();

		let mut c = JitChannel::new(0);
		c.state = JitState::Open;
		assert!(store.insert(c).is_some());
		assert_eq!(store.len(), 2);
		assert!(store.is_active(0));

		// Full table with no closed slot refuses.
		let mut d = JitChannel::new(3);
		d.state = JitState::Funding;
		assert!(store.insert(d).is_none());
	}

	#[test]
	fn multiple_channels_found_independently() {
		let mut store = JitStore::new(4);
		for (client, local) in [(0usize, 10000u64), (2, 20000), (3, 30000)] {
			let mut jit = JitChannel::new(client);
			jit.state = JitState::Open;
			jit.channel.local_amount = local;
			store.insert(jit).unwrap();
		}

		assert_eq!(store.find(0).unwrap().channel.local_amount, 10000);
		assert_eq!(store.find(2).unwrap().channel.local_amount, 20000);
		assert_eq!(store.find(3).unwrap().channel.local_amount, 30000);
		assert!(store.find(1).is_none());
	}

	#[test]
	fn state_string_bijection() {
		for state in [
			JitState::None,
			JitState::Funding,
			JitState::Open,
			JitState::Migrating,
			JitState::Closed,
		] {
			assert_eq!(JitState::from_str(state.as_str()), state);
		}
		assert_eq!(JitState::from_str("bogus"), JitState::None);
	}
}
