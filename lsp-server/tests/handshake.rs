//! End-to-end fallback handshake: the service on one end of a socket pair,
//! a client speaking the protocol on a thread at the other end.

use std::os::unix::net::UnixStream;
use std::thread;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;

use lsp_server::error::{ErrorCode, LspError};
use lsp_server::factory::{Factory, FactoryState};
use lsp_server::io::chain::ChainSource;
use lsp_server::io::persist::SqliteStore;
use lsp_server::jit::{JitState, JIT_CHANNEL_ID_BASE};
use lsp_server::service::{LspService, REASON_FACTORY_EXPIRED};
use lsp_server::util::config::JitConfig;
use lsp_server::wire::{
	ChannelBasepoints, ChannelNonces, JitAccept, JsonTransport, Message, MessageTransport,
};

const N_CHANNELS: usize = 4;

/// A chain backend that funds instantly and confirms everything.
struct InstantChain;

impl ChainSource for InstantChain {
	fn get_block_height(&self) -> Result<u32, LspError> {
		Ok(110)
	}

	fn tx_confirmed(&self, _txid: &str, _vout: u32, _min_depth: u32) -> Result<bool, LspError> {
		Ok(true)
	}

	fn broadcast(&self, _rawtx: &[u8]) -> Result<String, LspError> {
		Ok("cc".repeat(32))
	}

	fn get_new_address(&self) -> Result<String, LspError> {
		Ok("bcrt1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqdku202".to_string())
	}

	fn fund_address(&self, _address: &str, _amount_sats: u64) -> Result<(String, u32), LspError> {
		Ok(("ab".repeat(32), 0))
	}
}

fn test_pubkey(fill: u8) -> PublicKey {
	let secp = Secp256k1::new();
	PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[fill; 32]).unwrap())
}

fn test_service(chain: Option<Box<dyn ChainSource>>) -> LspService {
	let cfg = JitConfig { n_channels: N_CHANNELS, ..JitConfig::default() };
	LspService::new(
		cfg,
		Network::Regtest,
		SecretKey::from_slice(&[0x01; 32]).unwrap(),
		SqliteStore::open(":memory:").unwrap(),
		chain,
	)
}

/// Speak the client half of the handshake; returns what JIT_READY carried.
fn spawn_client(stream: UnixStream) -> thread::JoinHandle<Option<(u32, u64, u64, u64)>> {
	thread::spawn(move || {
		let reader = stream.try_clone().ok()?;
		let mut transport = JsonTransport::new(reader, stream);

		let offer = match transport.recv().ok()? {
			Message::JitOffer(offer) => offer,
			_ => return None,
		};
		transport
			.send(&Message::JitAccept(JitAccept {
				client_idx: offer.client_idx,
				client_pubkey: test_pubkey(0x22),
			}))
			.ok()?;

		let basepoints = match transport.recv().ok()? {
			Message::ChannelBasepoints(basepoints) => basepoints,
			_ => return None,
		};
		transport
			.send(&Message::ChannelBasepoints(ChannelBasepoints {
				channel_id: basepoints.channel_id,
				payment: test_pubkey(0x30),
				delayed_payment: test_pubkey(0x31),
				revocation: test_pubkey(0x32),
				htlc: test_pubkey(0x33),
			}))
			.ok()?;

		let nonces = match transport.recv().ok()? {
			Message::ChannelNonces(nonces) => nonces,
			_ => return None,
		};
		transport
			.send(&Message::ChannelNonces(ChannelNonces {
				channel_id: nonces.channel_id,
				nonces: vec!["42".repeat(66); nonces.nonces.len()],
			}))
			.ok()?;

		match transport.recv().ok()? {
			Message::JitReady(ready) => {
				Some((ready.jit_channel_id, ready.amount, ready.local_balance, ready.remote_balance))
			},
			_ => None,
		}
	})
}

#[test]
fn factory_expiry_drives_fallback_open() {
	// The factory this service anchored its clients in has run out.
	let factory = Factory::new(0, 100, 5, 5);
	assert_eq!(factory.state_at(100), FactoryState::Active);
	assert_eq!(factory.state_at(105), FactoryState::Dying);
	assert_eq!(factory.state_at(110), FactoryState::Expired);

	let mut service = test_service(Some(Box::new(InstantChain)));
	assert!(service.jits.is_enabled());
	assert!(!service.jits.is_active(0));
	assert_eq!(service.clients_needing_fallback(&factory, 110), vec![0, 1, 2, 3]);

	let (server_stream, client_stream) = UnixStream::pair().unwrap();
	let client = spawn_client(client_stream);

	let reader = server_stream.try_clone().unwrap();
	let mut transport = JsonTransport::new(reader, server_stream);
	let id = service
		.jit_channel_create(&mut transport, 0, 50000, REASON_FACTORY_EXPIRED)
		.unwrap();
	assert_eq!(id, JIT_CHANNEL_ID_BASE);

	// Funding confirms on the next watcher pass.
	assert_eq!(service.check_funding().unwrap(), 1);
	assert!(service.jits.is_active(0));
	let jit = service.jits.find(0).unwrap();
	assert_eq!(jit.state, JitState::Open);
	assert!(jit.funding_amount > 0);
	assert_eq!(jit.created_block, 110);

	// The watch index sits in the fallback range.
	assert!(service.watchtower.has_channel(N_CHANNELS as u32));

	// The client heard the whole story.
	let (ready_id, amount, local, remote) = client.join().unwrap().expect("client handshake");
	assert_eq!(ready_id, JIT_CHANNEL_ID_BASE);
	assert_eq!(amount, 50000);
	assert_eq!(local, 22500);
	assert_eq!(remote, 22500);

	// And the expired-factory trigger no longer fires for this client.
	assert_eq!(service.clients_needing_fallback(&factory, 110), vec![1, 2, 3]);
}

#[test]
fn wrong_accept_rolls_handshake_back() {
	let mut service = test_service(None);

	let (server_stream, client_stream) = UnixStream::pair().unwrap();
	let saboteur = thread::spawn(move || {
		let reader = client_stream.try_clone().unwrap();
		let mut transport = JsonTransport::new(reader, client_stream);
		// Swallow the offer, answer with the wrong message type.
		let _ = transport.recv().unwrap();
		transport
			.send(&Message::ChannelNonces(ChannelNonces { channel_id: 1, nonces: vec![] }))
			.unwrap();
	});

	let reader = server_stream.try_clone().unwrap();
	let mut transport = JsonTransport::new(reader, server_stream);
	let err = service
		.jit_channel_create(&mut transport, 2, 50000, REASON_FACTORY_EXPIRED)
		.unwrap_err();
	assert_eq!(err.code, ErrorCode::HandshakeFailed);

	// Nothing stuck: no record, no persisted row, no watch registration.
	assert!(service.jits.find(2).is_none());
	assert!(service.persister().load_jits().unwrap().is_empty());
	assert!(!service.watchtower.has_channel((N_CHANNELS + 2) as u32));

	saboteur.join().unwrap();
}
