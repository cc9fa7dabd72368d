// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The JSON-over-socket control messages exchanged with clients.
//!
//! Every message is one JSON object per line, self-describing through its
//! `type` field. Public keys travel as 33-byte SEC1-compressed hex, txids as
//! 64-char hex, nonces as 66-byte hex.

use std::io::{BufRead, BufReader, Read, Write};

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::channel::NONCE_LEN;
use crate::error::{ErrorCode, LspError};

/// Maximum byte length of the human-readable reason in a [`JitOffer`].
pub const MAX_REASON_LEN: usize = 63;

/// An offer from the LSP to open a dedicated fallback channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitOffer {
	pub client_idx: u64,
	pub funding_amount: u64,
	pub reason: String,
	pub lsp_pubkey: PublicKey,
}

/// The client's acceptance of a [`JitOffer`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitAccept {
	pub client_idx: u64,
	pub client_pubkey: PublicKey,
}

/// Sent by the LSP once the fallback channel's funding is broadcast,
/// carrying the outpoint and the initial balance split.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitReady {
	pub jit_channel_id: u32,
	pub funding_txid: String,
	pub vout: u32,
	pub amount: u64,
	pub local_balance: u64,
	pub remote_balance: u64,
}

/// Tells the client its fallback balance is being folded into a factory
/// channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitMigrate {
	pub jit_channel_id: u32,
	pub target_factory_id: u32,
	pub local_balance: u64,
	pub remote_balance: u64,
}

/// One side's channel basepoints, exchanged in both directions during setup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBasepoints {
	pub channel_id: u32,
	pub payment: PublicKey,
	pub delayed_payment: PublicKey,
	pub revocation: PublicKey,
	pub htlc: PublicKey,
}

/// A batch of public nonces for upcoming commitments, hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNonces {
	pub channel_id: u32,
	pub nonces: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
	#[serde(rename = "JIT_OFFER")]
	JitOffer(JitOffer),
	#[serde(rename = "JIT_ACCEPT")]
	JitAccept(JitAccept),
	#[serde(rename = "JIT_READY")]
	JitReady(JitReady),
	#[serde(rename = "JIT_MIGRATE")]
	JitMigrate(JitMigrate),
	#[serde(rename = "CHANNEL_BASEPOINTS")]
	ChannelBasepoints(ChannelBasepoints),
	#[serde(rename = "CHANNEL_NONCES")]
	ChannelNonces(ChannelNonces),
}

impl Message {
	pub fn msg_type_name(&self) -> &'static str {
		match self {
			Message::JitOffer(_) => "JIT_OFFER",
			Message::JitAccept(_) => "JIT_ACCEPT",
			Message::JitReady(_) => "JIT_READY",
			Message::JitMigrate(_) => "JIT_MIGRATE",
			Message::ChannelBasepoints(_) => "CHANNEL_BASEPOINTS",
			Message::ChannelNonces(_) => "CHANNEL_NONCES",
		}
	}
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
	s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Field-range checks beyond what the type layer enforces.
fn validate(msg: &Message) -> Result<(), LspError> {
	match msg {
		Message::JitOffer(m) => {
			if m.reason.len() > MAX_REASON_LEN {
				return Err(LspError::new(
					ErrorCode::MalformedMessage,
					format!("reason exceeds {} bytes", MAX_REASON_LEN),
				));
			}
		},
		Message::JitReady(m) => {
			if !is_hex_of_len(&m.funding_txid, 64) {
				return Err(LspError::new(ErrorCode::MalformedMessage, "funding_txid is not 64-char hex"));
			}
		},
		Message::ChannelNonces(m) => {
			for nonce in &m.nonces {
				if !is_hex_of_len(nonce, NONCE_LEN * 2) {
					return Err(LspError::new(
						ErrorCode::MalformedMessage,
						format!("nonce is not {}-char hex", NONCE_LEN * 2),
					));
				}
			}
		},
		Message::JitAccept(_) | Message::JitMigrate(_) | Message::ChannelBasepoints(_) => {},
	}
	Ok(())
}

/// Serialize a message to its wire line (without the trailing newline).
pub fn build(msg: &Message) -> Result<String, LspError> {
	validate(msg)?;
	Ok(serde_json::to_string(msg)?)
}

/// Parse one wire line into a message.
pub fn parse(line: &str) -> Result<Message, LspError> {
	let msg: Message = serde_json::from_str(line)?;
	validate(&msg)?;
	Ok(msg)
}

/// A bidirectional, ordered message stream to one client.
pub trait MessageTransport {
	fn send(&mut self, msg: &Message) -> Result<(), LspError>;
	fn recv(&mut self) -> Result<Message, LspError>;
}

/// Newline-delimited JSON over any pair of byte streams.
///
/// Callers with a single duplex socket pass two handles to it (for example
/// via `try_clone`).
pub struct JsonTransport<R: Read, W: Write> {
	reader: BufReader<R>,
	writer: W,
}

impl<R: Read, W: Write> JsonTransport<R, W> {
	pub fn new(reader: R, writer: W) -> Self {
		JsonTransport { reader: BufReader::new(reader), writer }
	}
}

impl<R: Read, W: Write> MessageTransport for JsonTransport<R, W> {
	fn send(&mut self, msg: &Message) -> Result<(), LspError> {
		let line = build(msg)?;
		self.writer.write_all(line.as_bytes())?;
		self.writer.write_all(b"\n")?;
		self.writer.flush()?;
		Ok(())
	}

	fn recv(&mut self) -> Result<Message, LspError> {
		let mut line = String::new();
		let n = self.reader.read_line(&mut line)?;
		if n == 0 {
			return Err(LspError::new(ErrorCode::MalformedMessage, "connection closed"));
		}
		parse(line.trim_end())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::secp256k1::{Secp256k1, SecretKey};

	fn test_pubkey(fill: u8) -> PublicKey {
		let secp = Secp256k1::new();
		PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[fill; 32]).unwrap())
	}

	#[test]
	fn jit_offer_round_trip() {
		let msg = Message::JitOffer(JitOffer {
			client_idx: 2,
			funding_amount: 50000,
			reason: "factory_expired".to_string(),
			lsp_pubkey: test_pubkey(0x42),
		});
		assert_eq!(parse(&build(&msg).unwrap()).unwrap(), msg);
	}

	#[test]
	fn jit_accept_round_trip() {
		let msg = Message::JitAccept(JitAccept { client_idx: 3, client_pubkey: test_pubkey(0x43) });
		assert_eq!(parse(&build(&msg).unwrap()).unwrap(), msg);
	}

	#[test]
	fn jit_ready_round_trip() {
		let msg = Message::JitReady(JitReady {
			jit_channel_id: 0x8001,
			funding_txid: "aabbccdd00112233445566778899aabbccddeeff00112233445566778899aabb"
				.to_string(),
			vout: 0,
			amount: 100000,
			local_balance: 45000,
			remote_balance: 45000,
		});
		assert_eq!(parse(&build(&msg).unwrap()).unwrap(), msg);
	}

	#[test]
	fn jit_migrate_round_trip() {
		let msg = Message::JitMigrate(JitMigrate {
			jit_channel_id: 0x8002,
			target_factory_id: 5,
			local_balance: 30000,
			remote_balance: 20000,
		});
		assert_eq!(parse(&build(&msg).unwrap()).unwrap(), msg);
	}

	#[test]
	fn basepoints_and_nonces_round_trip() {
		let msg = Message::ChannelBasepoints(ChannelBasepoints {
			channel_id: 0x8000,
			payment: test_pubkey(0x10),
			delayed_payment: test_pubkey(0x11),
			revocation: test_pubkey(0x12),
			htlc: test_pubkey(0x13),
		});
		assert_eq!(parse(&build(&msg).unwrap()).unwrap(), msg);

		let nonces = Message::ChannelNonces(ChannelNonces {
			channel_id: 0x8000,
			nonces: vec!["42".repeat(NONCE_LEN), "43".repeat(NONCE_LEN)],
		});
		assert_eq!(parse(&build(&nonces).unwrap()).unwrap(), nonces);
	}

	#[test]
	fn msg_type_names() {
		let pk = test_pubkey(0x42);
		let cases = [
			(
				Message::JitOffer(JitOffer {
					client_idx: 0,
					funding_amount: 0,
					reason: String::new(),
					lsp_pubkey: pk,
				}),
				"JIT_OFFER",
			),
			(Message::JitAccept(JitAccept { client_idx: 0, client_pubkey: pk }), "JIT_ACCEPT"),
			(
				Message::JitReady(JitReady {
					jit_channel_id: 0,
					funding_txid: String::new(),
					vout: 0,
					amount: 0,
					local_balance: 0,
					remote_balance: 0,
				}),
				"JIT_READY",
			),
			(
				Message::JitMigrate(JitMigrate {
					jit_channel_id: 0,
					target_factory_id: 0,
					local_balance: 0,
					remote_balance: 0,
				}),
				"JIT_MIGRATE",
			),
		];
		for (msg, name) in cases {
			assert_eq!(msg.msg_type_name(), name);
		}
	}

	#[test]
	fn rejects_missing_field() {
		let err = parse(r#"{"type":"JIT_ACCEPT","client_idx":1}"#).unwrap_err();
		assert_eq!(err.code, ErrorCode::MalformedMessage);
	}

	#[test]
	fn rejects_bad_pubkey() {
		let err = parse(r#"{"type":"JIT_ACCEPT","client_idx":1,"client_pubkey":"00"}"#).unwrap_err();
		assert_eq!(err.code, ErrorCode::MalformedMessage);
	}

	#[test]
	fn rejects_unknown_type() {
		let err = parse(r#"{"type":"JIT_BOGUS"}"#).unwrap_err();
		assert_eq!(err.code, ErrorCode::MalformedMessage);
	}

	#[test]
	fn rejects_oversized_reason() {
		let msg = Message::JitOffer(JitOffer {
			client_idx: 1,
			funding_amount: 1000,
			reason: "x".repeat(MAX_REASON_LEN + 1),
			lsp_pubkey: test_pubkey(0x42),
		});
		assert_eq!(build(&msg).unwrap_err().code, ErrorCode::MalformedMessage);
	}

	#[test]
	fn rejects_short_txid() {
		let msg = Message::JitReady(JitReady {
			jit_channel_id: 0x8001,
			funding_txid: "aabb".to_string(),
			vout: 0,
			amount: 1,
			local_balance: 0,
			remote_balance: 0,
		});
		assert_eq!(build(&msg).unwrap_err().code, ErrorCode::MalformedMessage);
	}

	#[test]
	fn transport_sends_one_message_per_line() {
		use std::io::Cursor;

		let msg = Message::JitAccept(JitAccept { client_idx: 7, client_pubkey: test_pubkey(0x44) });
		let mut out = Vec::new();
		{
			let mut t = JsonTransport::new(Cursor::new(Vec::new()), &mut out);
			t.send(&msg).unwrap();
		}
		assert!(out.ends_with(b"\n"));

		let mut t = JsonTransport::new(Cursor::new(out), Vec::new());
		assert_eq!(t.recv().unwrap(), msg);
		assert_eq!(t.recv().unwrap_err().code, ErrorCode::MalformedMessage);
	}
}
