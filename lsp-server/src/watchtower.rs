// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Breach-watch registry.
//!
//! Channels are keyed by a flat watch index: factory channels occupy
//! `[0, n_channels)` and fallback channels `[n_channels, 2*n_channels)`, so
//! the two ranges never collide. The registry records revoked commitments per
//! index; the on-chain penalty response lives in the tower service itself.

use std::collections::BTreeMap;

use bitcoin::secp256k1::PublicKey;

use crate::channel::Channel;
use crate::error::{ErrorCode, LspError};

/// A revoked commitment to watch for on-chain.
#[derive(Clone, Debug)]
pub struct WatchEntry {
	pub channel_id: u32,
	pub commitment_number: u64,
	pub txid: String,
	pub vout: u32,
	pub amount: u64,
	pub script_pubkey: Vec<u8>,
}

/// What the tower keeps per registered channel. Indices, not references:
/// dereferencing back to the live channel goes through the owning store.
#[derive(Clone, Debug)]
struct WatchedChannel {
	remote_revocation_basepoint: Option<PublicKey>,
	remote_payment_basepoint: Option<PublicKey>,
}

#[derive(Default)]
pub struct Watchtower {
	channels: BTreeMap<u32, WatchedChannel>,
	entries: Vec<WatchEntry>,
}

impl Watchtower {
	pub fn new() -> Self {
		Watchtower::default()
	}

	/// Register a channel under a watch index, replacing any prior
	/// registration at that index.
	pub fn set_channel(&mut self, idx: u32, channel: &Channel) {
		let watched = WatchedChannel {
			remote_revocation_basepoint: channel.remote_basepoints.as_ref().map(|b| b.revocation),
			remote_payment_basepoint: channel.remote_basepoints.as_ref().map(|b| b.payment),
		};
		self.channels.insert(idx, watched);
	}

	pub fn has_channel(&self, idx: u32) -> bool {
		self.channels.contains_key(&idx)
	}

	/// Record a revoked commitment for a registered channel.
	pub fn watch(
		&mut self, idx: u32, commitment_number: u64, txid: &str, vout: u32, amount: u64,
		script_pubkey: &[u8],
	) -> Result<(), LspError> {
		if !self.channels.contains_key(&idx) {
			return Err(LspError::new(
				ErrorCode::WatchtowerBindError,
				format!("watch index {} is not registered", idx),
			));
		}
		self.entries.push(WatchEntry {
			channel_id: idx,
			commitment_number,
			txid: txid.to_string(),
			vout,
			amount,
			script_pubkey: script_pubkey.to_vec(),
		});
		Ok(())
	}

	/// Drop a channel registration and every watch entry filed under it.
	pub fn remove_channel(&mut self, idx: u32) {
		self.channels.remove(&idx);
		self.entries.retain(|e| e.channel_id != idx);
	}

	pub fn entries(&self) -> &[WatchEntry] {
		&self.entries
	}

	pub fn n_entries(&self) -> usize {
		self.entries.len()
	}

	/// The counterparty keys recorded for a watch index, for handing to the
	/// tower's penalty path.
	pub fn remote_keys(&self, idx: u32) -> Option<(Option<PublicKey>, Option<PublicKey>)> {
		self.channels
			.get(&idx)
			.map(|c| (c.remote_revocation_basepoint, c.remote_payment_basepoint))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SPK: [u8; 34] = {
		let mut spk = [0u8; 34];
		spk[0] = 0x51;
		spk[1] = 0x20;
		spk
	};

	#[test]
	fn watch_requires_registration() {
		let mut wt = Watchtower::new();
		let err = wt.watch(6, 0, &"bb".repeat(32), 0, 40000, &SPK).unwrap_err();
		assert_eq!(err.code, ErrorCode::WatchtowerBindError);

		wt.set_channel(6, &Channel::default());
		wt.watch(6, 0, &"bb".repeat(32), 0, 40000, &SPK).unwrap();
		assert_eq!(wt.n_entries(), 1);
		assert_eq!(wt.entries()[0].channel_id, 6);
	}

	#[test]
	fn remove_channel_drops_only_its_entries() {
		let mut wt = Watchtower::new();
		wt.set_channel(6, &Channel::default());
		wt.set_channel(0, &Channel::default());

		wt.watch(6, 0, &"11".repeat(32), 0, 10000, &SPK).unwrap();
		wt.watch(6, 1, &"22".repeat(32), 0, 12000, &SPK).unwrap();
		wt.watch(0, 0, &"33".repeat(32), 0, 15000, &SPK).unwrap();
		assert_eq!(wt.n_entries(), 3);

		wt.remove_channel(6);
		assert_eq!(wt.n_entries(), 1);
		assert_eq!(wt.entries()[0].channel_id, 0);
		assert!(!wt.has_channel(6));
		assert!(wt.has_channel(0));
	}

	#[test]
	fn set_channel_is_idempotent_per_index() {
		let mut wt = Watchtower::new();
		wt.set_channel(4, &Channel::default());
		wt.set_channel(4, &Channel::default());
		assert!(wt.has_channel(4));
		wt.remove_channel(4);
		assert!(!wt.has_channel(4));
	}
}
