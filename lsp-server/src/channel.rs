// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The opaque per-channel object. Commitment construction, revocation
//! derivation and HTLC handling happen in the signing layer; the channel
//! subsystem only touches balances, the commitment number, basepoints and
//! the nonce batch.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::{Address, Network};

use crate::error::{ErrorCode, LspError};

/// Length of a serialized MuSig2 public nonce.
pub const NONCE_LEN: usize = 66;

/// The four per-channel basepoint roles, in the canonical order used on the
/// wire and in the database.
pub const BASEPOINT_NAMES: [&str; 4] = ["payment", "delayed_payment", "revocation", "htlc"];

/// One side's basepoint public keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Basepoints {
	pub payment: PublicKey,
	pub delayed_payment: PublicKey,
	pub revocation: PublicKey,
	pub htlc: PublicKey,
}

impl Basepoints {
	pub fn from_bytes(bytes: &[[u8; 33]; 4]) -> Result<Self, LspError> {
		let parse = |b: &[u8; 33]| {
			PublicKey::from_slice(b)
				.map_err(|e| LspError::new(ErrorCode::MalformedMessage, format!("bad basepoint: {}", e)))
		};
		Ok(Basepoints {
			payment: parse(&bytes[0])?,
			delayed_payment: parse(&bytes[1])?,
			revocation: parse(&bytes[2])?,
			htlc: parse(&bytes[3])?,
		})
	}

	pub fn to_bytes(&self) -> [[u8; 33]; 4] {
		[
			self.payment.serialize(),
			self.delayed_payment.serialize(),
			self.revocation.serialize(),
			self.htlc.serialize(),
		]
	}
}

/// The local basepoint secrets the LSP holds for one channel.
#[derive(Clone, Copy)]
pub struct BasepointSecrets {
	pub payment: SecretKey,
	pub delayed_payment: SecretKey,
	pub revocation: SecretKey,
	pub htlc: SecretKey,
}

impl BasepointSecrets {
	pub fn generate() -> Self {
		let mut rng = rand::thread_rng();
		BasepointSecrets {
			payment: SecretKey::new(&mut rng),
			delayed_payment: SecretKey::new(&mut rng),
			revocation: SecretKey::new(&mut rng),
			htlc: SecretKey::new(&mut rng),
		}
	}

	pub fn from_bytes(bytes: &[[u8; 32]; 4]) -> Result<Self, LspError> {
		let parse = |b: &[u8; 32]| {
			SecretKey::from_slice(b)
				.map_err(|e| LspError::new(ErrorCode::MalformedMessage, format!("bad basepoint secret: {}", e)))
		};
		Ok(BasepointSecrets {
			payment: parse(&bytes[0])?,
			delayed_payment: parse(&bytes[1])?,
			revocation: parse(&bytes[2])?,
			htlc: parse(&bytes[3])?,
		})
	}

	pub fn to_bytes(&self) -> [[u8; 32]; 4] {
		[
			self.payment.secret_bytes(),
			self.delayed_payment.secret_bytes(),
			self.revocation.secret_bytes(),
			self.htlc.secret_bytes(),
		]
	}

	pub fn basepoints<C: Signing>(&self, secp: &Secp256k1<C>) -> Basepoints {
		Basepoints {
			payment: PublicKey::from_secret_key(secp, &self.payment),
			delayed_payment: PublicKey::from_secret_key(secp, &self.delayed_payment),
			revocation: PublicKey::from_secret_key(secp, &self.revocation),
			htlc: PublicKey::from_secret_key(secp, &self.htlc),
		}
	}
}

/// A payment channel as seen by the channel subsystem.
#[derive(Default)]
pub struct Channel {
	pub local_secrets: Option<BasepointSecrets>,
	pub local_basepoints: Option<Basepoints>,
	pub remote_basepoints: Option<Basepoints>,
	/// Remote public nonces for upcoming commitments, newest last.
	pub remote_nonces: Vec<[u8; NONCE_LEN]>,
	pub commitment_number: u64,
	pub local_amount: u64,
	pub remote_amount: u64,
}

impl Channel {
	/// Generate fresh local basepoint secrets and derive their public points.
	pub fn generate_basepoints<C: Signing>(&mut self, secp: &Secp256k1<C>) -> Basepoints {
		let secrets = BasepointSecrets::generate();
		let points = secrets.basepoints(secp);
		self.local_basepoints = Some(points);
		self.local_secrets = Some(secrets);
		points
	}

	/// The 2-of-2 aggregate funding address for this channel: a taproot
	/// output of the combined LSP and client keys.
	pub fn funding_address<C: Verification>(
		secp: &Secp256k1<C>, lsp_pubkey: &PublicKey, client_pubkey: &PublicKey, network: Network,
	) -> Result<Address, LspError> {
		let aggregate = lsp_pubkey.combine(client_pubkey).map_err(|e| {
			LspError::new(ErrorCode::HandshakeFailed, format!("key aggregation failed: {}", e))
		})?;
		let (internal_key, _parity) = aggregate.x_only_public_key();
		Ok(Address::p2tr(secp, internal_key, None, network))
	}
}
