//! The control-loop side of the fallback subsystem: evaluating triggers,
//! running the channel-open handshake with a client, watching fundings,
//! and folding balances back into a factory once rotation lands.
//!
//! Everything here runs on the single control loop that owns the stores,
//! so no two updates to the same channel can ever interleave.

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use log::{debug, info, warn};
use rand::Rng;

use crate::channel::{Basepoints, BasepointSecrets, Channel, NONCE_LEN};
use crate::error::{ErrorCode, LspError};
use crate::factory::{Factory, FactoryEntry, FactoryState};
use crate::io::chain::ChainSource;
use crate::io::persist::SqliteStore;
use crate::jit::retry::{RetryDecision, RotationRetryTable};
use crate::jit::{router, JitChannel, JitState, JitStore};
use crate::util::config::JitConfig;
use crate::watchtower::Watchtower;
use crate::wire::{
	ChannelBasepoints, ChannelNonces, JitMigrate, JitOffer, JitReady, Message, MessageTransport,
};

/// Share of the funding amount held back from the initial balance split to
/// cover closing fees.
const FUNDING_FEE_RESERVE_DIV: u64 = 10;

/// Public nonces exchanged up front for the first commitments.
const NONCE_BATCH: usize = 8;

/// Trigger reason carried in the offer when the factory has expired.
pub const REASON_FACTORY_EXPIRED: &str = "factory_expired";
/// Trigger reason for a client that connected before rotation completed.
pub const REASON_NEW_CLIENT: &str = "new_client";

fn unfunded_txid() -> String {
	"0".repeat(64)
}

fn is_unfunded(txid: &str) -> bool {
	txid.is_empty() || txid.bytes().all(|b| b == b'0')
}

fn handshake_err(what: &str, e: LspError) -> LspError {
	LspError::new(ErrorCode::HandshakeFailed, format!("{}: {}", what, e.message))
}

pub struct LspService {
	jit_cfg: JitConfig,
	network: Network,
	secp: Secp256k1<All>,
	lsp_seckey: SecretKey,
	pub entries: Vec<FactoryEntry>,
	pub jits: JitStore,
	pub retries: RotationRetryTable,
	pub watchtower: Watchtower,
	persister: SqliteStore,
	chain: Option<Box<dyn ChainSource>>,
}

impl LspService {
	pub fn new(
		jit_cfg: JitConfig, network: Network, lsp_seckey: SecretKey, persister: SqliteStore,
		chain: Option<Box<dyn ChainSource>>,
	) -> Self {
		let entries = (0..jit_cfg.n_channels).map(|i| FactoryEntry::new(i as u32)).collect();
		let mut jits = JitStore::new(jit_cfg.n_channels);
		jits.set_enabled(jit_cfg.enabled);
		let retries =
			RotationRetryTable::new(jit_cfg.max_rotation_retries, jit_cfg.rotation_retry_blocks);
		LspService {
			jit_cfg,
			network,
			secp: Secp256k1::new(),
			lsp_seckey,
			entries,
			jits,
			retries,
			watchtower: Watchtower::new(),
			persister,
			chain,
		}
	}

	pub fn lsp_pubkey(&self) -> PublicKey {
		PublicKey::from_secret_key(&self.secp, &self.lsp_seckey)
	}

	pub fn persister(&self) -> &SqliteStore {
		&self.persister
	}

	/// Best-effort current block height, when a chain source is attached.
	pub fn chain_height(&self) -> Option<u32> {
		self.chain.as_ref().and_then(|chain| chain.get_block_height().ok())
	}

	/// The watch index a fallback channel occupies: factory channels use
	/// `[0, n_channels)`, fallbacks `[n_channels, 2*n_channels)`.
	pub fn watch_index(&self, client_idx: usize) -> u32 {
		(self.entries.len() + client_idx) as u32
	}

	pub fn effective_channel(&self, client_idx: usize) -> Option<(u32, &Channel)> {
		router::effective_channel(&self.entries, &self.jits, client_idx)
	}

	pub fn resolve(&self, channel_id: u32, client_idx: usize) -> Option<&Channel> {
		router::resolve(&self.entries, &self.jits, channel_id, client_idx)
	}

	/// Open a fallback channel for a client: offer, accept, funding
	/// broadcast, basepoint and nonce exchange, then the ready notice.
	///
	/// The record and its basepoints hit the database before the ready
	/// notice leaves the process; any failure before that point leaves no
	/// trace, and a failure after it removes the partial row.
	pub fn jit_channel_create(
		&mut self, transport: &mut dyn MessageTransport, client_idx: usize, funding_sats: u64,
		reason: &str,
	) -> Result<u32, LspError> {
		if !self.jits.is_enabled() {
			return Err(LspError::new(ErrorCode::HandshakeFailed, "fallback channels are disabled"));
		}
		if client_idx >= self.entries.len() {
			return Err(LspError::new(
				ErrorCode::HandshakeFailed,
				format!("unknown client index {}", client_idx),
			));
		}
		if self.jits.is_active(client_idx) {
			return Err(LspError::new(
				ErrorCode::HandshakeFailed,
				format!("client {} already has a live fallback channel", client_idx),
			));
		}
		if !self.jits.has_free_slot(client_idx) {
			return Err(LspError::new(ErrorCode::HandshakeFailed, "fallback table is full"));
		}

		info!("Offering fallback channel to client {} (reason: {})", client_idx, reason);

		let lsp_pubkey = self.lsp_pubkey();
		transport
			.send(&Message::JitOffer(JitOffer {
				client_idx: client_idx as u64,
				funding_amount: funding_sats,
				reason: reason.to_string(),
				lsp_pubkey,
			}))
			.map_err(|e| handshake_err("offer not delivered", e))?;

		let accept = match transport.recv() {
			Ok(Message::JitAccept(accept)) => accept,
			Ok(other) => {
				return Err(LspError::new(
					ErrorCode::HandshakeFailed,
					format!("expected JIT_ACCEPT, got {}", other.msg_type_name()),
				))
			},
			Err(e) => return Err(handshake_err("no acceptance", e)),
		};
		// Our index is authoritative; the client's echo only has to agree.
		if accept.client_idx != client_idx as u64 {
			return Err(LspError::new(
				ErrorCode::HandshakeFailed,
				format!("client echoed index {} instead of {}", accept.client_idx, client_idx),
			));
		}

		let mut jit = JitChannel::new(client_idx);
		jit.created_at = chrono::Utc::now().timestamp();
		jit.funding_amount = funding_sats;
		let local_points = jit.channel.generate_basepoints(&self.secp);

		// Broadcast the funding payment to the 2-of-2 aggregate. Without a
		// chain source the outpoint stays a zero placeholder and the channel
		// waits in FUNDING.
		if let Some(chain) = &self.chain {
			let address = Channel::funding_address(
				&self.secp,
				&lsp_pubkey,
				&accept.client_pubkey,
				self.network,
			)?;
			jit.created_block = chain.get_block_height()?;
			let (txid, vout) = chain.fund_address(&address.to_string(), funding_sats)?;
			jit.funding_txid = txid;
			jit.funding_vout = vout;
		} else {
			debug!("No chain source attached; skipping funding broadcast");
			jit.funding_txid = unfunded_txid();
		}
		jit.state = JitState::Funding;

		transport
			.send(&Message::ChannelBasepoints(ChannelBasepoints {
				channel_id: jit.jit_channel_id,
				payment: local_points.payment,
				delayed_payment: local_points.delayed_payment,
				revocation: local_points.revocation,
				htlc: local_points.htlc,
			}))
			.map_err(|e| handshake_err("basepoints not delivered", e))?;

		let theirs = match transport.recv() {
			Ok(Message::ChannelBasepoints(bp)) => bp,
			Ok(other) => {
				return Err(LspError::new(
					ErrorCode::HandshakeFailed,
					format!("expected CHANNEL_BASEPOINTS, got {}", other.msg_type_name()),
				))
			},
			Err(e) => return Err(handshake_err("no basepoints", e)),
		};
		jit.channel.remote_basepoints = Some(Basepoints {
			payment: theirs.payment,
			delayed_payment: theirs.delayed_payment,
			revocation: theirs.revocation,
			htlc: theirs.htlc,
		});

		let mut rng = rand::thread_rng();
		let mut local_nonces = Vec::with_capacity(NONCE_BATCH);
		for _ in 0..NONCE_BATCH {
			let mut nonce = [0u8; NONCE_LEN];
			rng.fill(&mut nonce[..]);
			local_nonces.push(nonce);
		}
		transport
			.send(&Message::ChannelNonces(ChannelNonces {
				channel_id: jit.jit_channel_id,
				nonces: local_nonces.iter().map(|n| hex_str(n)).collect(),
			}))
			.map_err(|e| handshake_err("nonces not delivered", e))?;

		let their_nonces = match transport.recv() {
			Ok(Message::ChannelNonces(n)) => n,
			Ok(other) => {
				return Err(LspError::new(
					ErrorCode::HandshakeFailed,
					format!("expected CHANNEL_NONCES, got {}", other.msg_type_name()),
				))
			},
			Err(e) => return Err(handshake_err("no nonces", e)),
		};
		jit.channel.remote_nonces = parse_nonces(&their_nonces.nonces)?;

		// Initial split with the fee reserve carved out.
		let reserve = funding_sats / FUNDING_FEE_RESERVE_DIV;
		let local_balance = (funding_sats - reserve) / 2;
		let remote_balance = funding_sats - reserve - local_balance;
		jit.channel.local_amount = local_balance;
		jit.channel.remote_amount = remote_balance;

		let jit_channel_id = jit.jit_channel_id;
		self.persister.save_jit(&jit)?;
		self.persister.save_basepoints(jit_channel_id, &jit)?;

		let watch_idx = self.watch_index(client_idx);
		self.watchtower.set_channel(watch_idx, &jit.channel);

		let ready = Message::JitReady(JitReady {
			jit_channel_id,
			funding_txid: jit.funding_txid.clone(),
			vout: jit.funding_vout,
			amount: funding_sats,
			local_balance,
			remote_balance,
		});
		if let Err(e) = transport.send(&ready) {
			self.watchtower.remove_channel(watch_idx);
			self.persister.delete_jit(jit_channel_id)?;
			return Err(handshake_err("ready notice not delivered", e));
		}

		match self.jits.insert(jit) {
			Some(_) => {
				info!(
					"Fallback channel {:#06x} in FUNDING for client {} ({} sats)",
					jit_channel_id, client_idx, funding_sats
				);
				Ok(jit_channel_id)
			},
			None => {
				self.watchtower.remove_channel(watch_idx);
				self.persister.delete_jit(jit_channel_id)?;
				Err(LspError::new(ErrorCode::HandshakeFailed, "fallback table refused the record"))
			},
		}
	}

	/// Advance FUNDING channels whose outpoint has reached the confirmation
	/// depth, and abort those that waited too long. Returns the number of
	/// FUNDING -> OPEN transitions performed.
	pub fn check_funding(&mut self) -> Result<usize, LspError> {
		let chain = match &self.chain {
			Some(chain) => chain,
			None => return Ok(0),
		};
		let height = match chain.get_block_height() {
			Ok(height) => height,
			Err(e) => {
				warn!("Chain backend unavailable, skipping funding checks: {}", e);
				return Ok(0);
			},
		};

		let depth = self.jit_cfg.confirmation_depth;
		let timeout_blocks = self.jit_cfg.funding_timeout_blocks;
		let mut transitions = 0;
		let mut aborted = Vec::new();

		for jit in self.jits.iter_mut() {
			if jit.state != JitState::Funding || is_unfunded(&jit.funding_txid) {
				continue;
			}
			match chain.tx_confirmed(&jit.funding_txid, jit.funding_vout, depth) {
				Ok(true) => {
					jit.funding_confirmed = true;
					jit.state = JitState::Open;
					self.persister.update_jit_state(jit.jit_channel_id, JitState::Open)?;
					info!(
						"Fallback channel {:#06x} funding confirmed, now OPEN",
						jit.jit_channel_id
					);
					transitions += 1;
				},
				Ok(false) => {
					if height.saturating_sub(jit.created_block) >= timeout_blocks {
						jit.state = JitState::Closed;
						self.persister.update_jit_state(jit.jit_channel_id, JitState::Closed)?;
						warn!(
							"Fallback channel {:#06x} funding unconfirmed after {} blocks, aborting",
							jit.jit_channel_id, timeout_blocks
						);
						aborted.push(jit.client_idx);
					}
				},
				Err(e) => {
					debug!(
						"Confirmation check for {}:{} failed: {}",
						jit.funding_txid, jit.funding_vout, e
					);
				},
			}
		}

		for client_idx in aborted {
			let watch_idx = self.watch_index(client_idx);
			self.watchtower.remove_channel(watch_idx);
		}
		Ok(transitions)
	}

	/// Fold an OPEN fallback channel into the client's factory channel.
	/// No-op (returns `Ok(false)`) when the client has none.
	///
	/// The migrate notice is best-effort: an undeliverable notice still
	/// closes the channel locally, and the client re-syncs from persisted
	/// factory state on reconnect.
	pub fn jit_channel_migrate(
		&mut self, transport: Option<&mut dyn MessageTransport>, client_idx: usize,
		target_factory_id: u32,
	) -> Result<bool, LspError> {
		let (jit_channel_id, local_amount, remote_amount) = {
			let jit = match self.jits.find_mut(client_idx) {
				Some(jit) if jit.state == JitState::Open => jit,
				_ => return Ok(false),
			};
			jit.state = JitState::Migrating;
			jit.target_factory_id = target_factory_id;
			(jit.jit_channel_id, jit.channel.local_amount, jit.channel.remote_amount)
		};
		self.persister.update_jit_state(jit_channel_id, JitState::Migrating)?;

		if let Some(transport) = transport {
			let notice = Message::JitMigrate(JitMigrate {
				jit_channel_id,
				target_factory_id,
				local_balance: local_amount,
				remote_balance: remote_amount,
			});
			if let Err(e) = transport.send(&notice) {
				warn!(
					"Migrate notice for {:#06x} undeliverable ({}); client re-syncs on reconnect",
					jit_channel_id, e
				);
			}
		}

		self.finish_migration(client_idx, jit_channel_id, local_amount, remote_amount)?;
		info!(
			"Fallback channel {:#06x} migrated into factory {} for client {}",
			jit_channel_id, target_factory_id, client_idx
		);
		Ok(true)
	}

	fn finish_migration(
		&mut self, client_idx: usize, jit_channel_id: u32, local_amount: u64, remote_amount: u64,
	) -> Result<(), LspError> {
		let entry = self.entries.get_mut(client_idx).ok_or_else(|| {
			LspError::new(
				ErrorCode::MigrationRefused,
				format!("no factory entry for client {}", client_idx),
			)
		})?;
		entry.channel.local_amount += local_amount;
		entry.channel.remote_amount += remote_amount;

		let watch_idx = self.watch_index(client_idx);
		self.watchtower.remove_channel(watch_idx);

		if let Some(jit) = self.jits.find_mut(client_idx) {
			jit.state = JitState::Closed;
		}
		self.persister.update_jit_state(jit_channel_id, JitState::Closed)?;
		Ok(())
	}

	/// Complete migrations interrupted by a restart, using the persisted
	/// target factory id.
	pub fn resume_migrations(&mut self) -> Result<usize, LspError> {
		let pending: Vec<(usize, u32, u64, u64, u32)> = self
			.jits
			.iter()
			.filter(|j| j.state == JitState::Migrating)
			.map(|j| {
				(
					j.client_idx,
					j.jit_channel_id,
					j.channel.local_amount,
					j.channel.remote_amount,
					j.target_factory_id,
				)
			})
			.collect();

		for (client_idx, jit_channel_id, local, remote, target) in &pending {
			self.finish_migration(*client_idx, *jit_channel_id, *local, *remote)?;
			info!(
				"Resumed migration of {:#06x} into factory {} for client {}",
				jit_channel_id, target, client_idx
			);
		}
		Ok(pending.len())
	}

	/// Clients that need a fallback channel opened because the factory can
	/// no longer serve them.
	pub fn clients_needing_fallback(&self, factory: &Factory, height: u32) -> Vec<usize> {
		if !self.jits.is_enabled() || factory.state_at(height) != FactoryState::Expired {
			return Vec::new();
		}
		self.entries
			.iter()
			.enumerate()
			.filter(|(idx, entry)| {
				!entry.ready && !entry.offline_detected && !self.jits.is_active(*idx)
			})
			.map(|(idx, _)| idx)
			.collect()
	}

	/// Flag clients that have been silent past the liveness timeout.
	pub fn detect_offline_clients(&mut self, now: i64) -> usize {
		let timeout = self.jit_cfg.offline_timeout_secs;
		let mut flagged = 0;
		for (idx, entry) in self.entries.iter_mut().enumerate() {
			if !entry.offline_detected && entry.is_stale(now, timeout) {
				entry.offline_detected = true;
				warn!("Client {} silent for over {}s, marked offline", idx, timeout);
				flagged += 1;
			}
		}
		flagged
	}

	pub fn rotation_should_retry(&self, factory_id: u32, cur_height: u32) -> RetryDecision {
		self.retries.should_retry(factory_id, cur_height)
	}

	pub fn record_rotation_failure(&mut self, factory_id: u32, cur_height: u32) {
		self.retries.record_failure(factory_id, cur_height);
	}

	/// A rotation landed: clear the retry state. The caller then migrates
	/// each live fallback channel into the new factory.
	pub fn record_rotation_success(&mut self, factory_id: u32) {
		self.retries.record_success(factory_id);
	}

	pub fn active_jit_clients(&self) -> Vec<usize> {
		self.jits.iter().filter(|j| j.is_active()).map(|j| j.client_idx).collect()
	}

	/// A commitment update landed on a fallback channel: persist the new
	/// balances and hand the now-revoked commitment to the watchtower.
	pub fn jit_commitment_updated(
		&mut self, client_idx: usize, local_amount: u64, remote_amount: u64,
		revoked_txid: &str, revoked_vout: u32, revoked_amount: u64, script_pubkey: &[u8],
	) -> Result<(), LspError> {
		let (jit_channel_id, old_commitment_number, new_commitment_number) = {
			let jit = self.jits.find_mut(client_idx).filter(|j| j.is_active()).ok_or_else(
				|| {
					LspError::new(
						ErrorCode::MalformedMessage,
						format!("no live fallback channel for client {}", client_idx),
					)
				},
			)?;
			let old = jit.channel.commitment_number;
			jit.channel.commitment_number += 1;
			jit.channel.local_amount = local_amount;
			jit.channel.remote_amount = remote_amount;
			(jit.jit_channel_id, old, jit.channel.commitment_number)
		};

		self.persister.update_jit_balance(
			jit_channel_id,
			local_amount,
			remote_amount,
			new_commitment_number,
		)?;

		let watch_idx = self.watch_index(client_idx);
		if let Err(e) = self.watchtower.watch(
			watch_idx,
			old_commitment_number,
			revoked_txid,
			revoked_vout,
			revoked_amount,
			script_pubkey,
		) {
			// Non-fatal: the channel keeps operating, just unwatched.
			warn!("Fallback channel {:#06x} left unwatched: {}", jit_channel_id, e);
		}
		Ok(())
	}

	/// Restore fallback channels from disk on startup.
	///
	/// OPEN and MIGRATING rows come back live (migrations are finished by
	/// [`resume_migrations`]); FUNDING rows wait for the watcher to confirm
	/// or abort them; CLOSED rows stay on disk for audit.
	///
	/// [`resume_migrations`]: Self::resume_migrations
	pub fn reload(&mut self) -> Result<usize, LspError> {
		let rows = self.persister.load_jits()?;
		let mut restored = 0;

		for mut jit in rows {
			match jit.state {
				JitState::Closed | JitState::None => continue,
				JitState::Funding | JitState::Open | JitState::Migrating => {},
			}
			if jit.client_idx >= self.entries.len() {
				warn!(
					"Persisted fallback channel {:#06x} references unknown client {}, skipping",
					jit.jit_channel_id, jit.client_idx
				);
				continue;
			}

			if let Some(record) = self.persister.load_basepoints(jit.jit_channel_id)? {
				let secrets = BasepointSecrets::from_bytes(&record.local_secrets)?;
				jit.channel.local_basepoints = Some(secrets.basepoints(&self.secp));
				jit.channel.local_secrets = Some(secrets);
				jit.channel.remote_basepoints =
					Some(Basepoints::from_bytes(&record.remote_pubkeys)?);
			}

			let client_idx = jit.client_idx;
			let jit_channel_id = jit.jit_channel_id;
			let state = jit.state;
			let watch_idx = self.watch_index(client_idx);
			self.watchtower.set_channel(watch_idx, &jit.channel);
			if self.jits.insert(jit).is_none() {
				warn!(
					"Duplicate live fallback record {:#06x} for client {}, skipping",
					jit_channel_id, client_idx
				);
				self.watchtower.remove_channel(watch_idx);
				continue;
			}
			info!(
				"Restored fallback channel {:#06x} for client {} in state {}",
				jit_channel_id,
				client_idx,
				state.as_str()
			);
			restored += 1;
		}
		Ok(restored)
	}
}

fn hex_str(bytes: &[u8]) -> String {
	use hex::DisplayHex;
	bytes.to_lower_hex_string()
}

fn parse_nonces(nonces: &[String]) -> Result<Vec<[u8; NONCE_LEN]>, LspError> {
	use hex::FromHex;
	let mut out = Vec::with_capacity(nonces.len());
	for nonce in nonces {
		let bytes = Vec::<u8>::from_hex(nonce).map_err(|e| {
			LspError::new(ErrorCode::HandshakeFailed, format!("bad nonce hex: {}", e))
		})?;
		let nonce: [u8; NONCE_LEN] = bytes.try_into().map_err(|_| {
			LspError::new(ErrorCode::HandshakeFailed, "nonce is not 66 bytes")
		})?;
		out.push(nonce);
	}
	Ok(out)
}
