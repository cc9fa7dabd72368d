// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Channel selection for the outer message loop.
//!
//! A ready factory entry always wins, even while a fallback channel is still
//! live, so exactly one commitment path is authoritative per client at any
//! commitment number.

use crate::channel::Channel;
use crate::factory::FactoryEntry;
use crate::jit::{JitStore, JIT_CHANNEL_ID_BASE};

/// Whether a channel id belongs to the fallback id space.
pub fn is_jit_channel_id(channel_id: u32) -> bool {
	channel_id & JIT_CHANNEL_ID_BASE != 0
}

/// The channel that currently carries this client's traffic: the factory
/// entry when ready, else the live fallback, else none.
pub fn effective_channel<'a>(
	entries: &'a [FactoryEntry], jits: &'a JitStore, client_idx: usize,
) -> Option<(u32, &'a Channel)> {
	if let Some(entry) = entries.get(client_idx) {
		if entry.ready {
			return Some((entry.channel_id, &entry.channel));
		}
	}
	jits.find(client_idx).filter(|j| j.is_active()).map(|j| (j.jit_channel_id, &j.channel))
}

/// Inverse lookup for an inbound channel id.
pub fn resolve<'a>(
	entries: &'a [FactoryEntry], jits: &'a JitStore, channel_id: u32, client_idx: usize,
) -> Option<&'a Channel> {
	if is_jit_channel_id(channel_id) {
		jits.find(client_idx).filter(|j| j.jit_channel_id == channel_id).map(|j| &j.channel)
	} else {
		entries.get(client_idx).filter(|e| e.channel_id == channel_id).map(|e| &e.channel)
	}
}
