// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

pub(crate) mod sqlite_store;

pub use sqlite_store::SqliteStore;

/// The eight basepoint values stored per channel: the four local secrets and
/// the four remote public keys, both in canonical role order.
pub struct BasepointRecord {
	pub local_secrets: [[u8; 32]; 4],
	pub remote_pubkeys: [[u8; 33]; 4],
}
