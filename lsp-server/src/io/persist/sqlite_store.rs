// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! SQLite-backed records of every fallback channel and its basepoints.
//!
//! Each state transition and balance change is written before the matching
//! wire acknowledgement leaves the process, so a restart can always rebuild
//! the table from disk. Closed rows are retained for audit.

use std::path::Path;

use hex::{DisplayHex, FromHex};
use rusqlite::{params, Connection};

use crate::channel::BASEPOINT_NAMES;
use crate::error::{ErrorCode, LspError};
use crate::io::persist::BasepointRecord;
use crate::jit::{JitChannel, JitState};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jit_channels (
	jit_channel_id INTEGER PRIMARY KEY,
	client_idx INTEGER NOT NULL,
	state TEXT NOT NULL,
	funding_txid TEXT NOT NULL DEFAULT '',
	funding_vout INTEGER NOT NULL DEFAULT 0,
	funding_amount INTEGER NOT NULL DEFAULT 0,
	local_amount INTEGER NOT NULL DEFAULT 0,
	remote_amount INTEGER NOT NULL DEFAULT 0,
	commitment_number INTEGER NOT NULL DEFAULT 0,
	created_at INTEGER NOT NULL DEFAULT 0,
	created_block INTEGER NOT NULL DEFAULT 0,
	target_factory_id INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS basepoints (
	channel_id INTEGER NOT NULL,
	side TEXT NOT NULL,
	name TEXT NOT NULL,
	value TEXT NOT NULL,
	PRIMARY KEY (channel_id, side, name)
);
";

pub struct SqliteStore {
	conn: Connection,
}

impl SqliteStore {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, LspError> {
		let conn = Connection::open(path)?;
		conn.execute_batch(SCHEMA)?;
		Ok(SqliteStore { conn })
	}

	/// Upsert the full record keyed by its channel id.
	pub fn save_jit(&self, jit: &JitChannel) -> Result<(), LspError> {
		self.conn.execute(
			"INSERT OR REPLACE INTO jit_channels (
				jit_channel_id, client_idx, state, funding_txid, funding_vout,
				funding_amount, local_amount, remote_amount, commitment_number,
				created_at, created_block, target_factory_id
			) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
			params![
				jit.jit_channel_id,
				jit.client_idx as i64,
				jit.state.as_str(),
				jit.funding_txid,
				jit.funding_vout,
				jit.funding_amount as i64,
				jit.channel.local_amount as i64,
				jit.channel.remote_amount as i64,
				jit.channel.commitment_number as i64,
				jit.created_at,
				jit.created_block,
				jit.target_factory_id,
			],
		)?;
		Ok(())
	}

	pub fn update_jit_state(&self, jit_channel_id: u32, state: JitState) -> Result<(), LspError> {
		self.conn.execute(
			"UPDATE jit_channels SET state = ?2 WHERE jit_channel_id = ?1",
			params![jit_channel_id, state.as_str()],
		)?;
		Ok(())
	}

	pub fn update_jit_balance(
		&self, jit_channel_id: u32, local_amount: u64, remote_amount: u64, commitment_number: u64,
	) -> Result<(), LspError> {
		self.conn.execute(
			"UPDATE jit_channels SET local_amount = ?2, remote_amount = ?3,
				commitment_number = ?4 WHERE jit_channel_id = ?1",
			params![
				jit_channel_id,
				local_amount as i64,
				remote_amount as i64,
				commitment_number as i64
			],
		)?;
		Ok(())
	}

	/// Purge a row and its basepoints. Closed rows are normally retained;
	/// this exists for operators that prune instead.
	pub fn delete_jit(&self, jit_channel_id: u32) -> Result<(), LspError> {
		self.conn.execute(
			"DELETE FROM jit_channels WHERE jit_channel_id = ?1",
			params![jit_channel_id],
		)?;
		self.conn
			.execute("DELETE FROM basepoints WHERE channel_id = ?1", params![jit_channel_id])?;
		Ok(())
	}

	/// All persisted fallback channels, order unspecified.
	pub fn load_jits(&self) -> Result<Vec<JitChannel>, LspError> {
		let mut stmt = self.conn.prepare(
			"SELECT jit_channel_id, client_idx, state, funding_txid, funding_vout,
				funding_amount, local_amount, remote_amount, commitment_number,
				created_at, created_block, target_factory_id
			FROM jit_channels",
		)?;
		let rows = stmt.query_map([], |row| {
			let mut jit = JitChannel::new(row.get::<_, i64>(1)? as usize);
			jit.jit_channel_id = row.get(0)?;
			jit.state = JitState::from_str(&row.get::<_, String>(2)?);
			jit.funding_txid = row.get(3)?;
			jit.funding_vout = row.get(4)?;
			jit.funding_amount = row.get::<_, i64>(5)? as u64;
			jit.channel.local_amount = row.get::<_, i64>(6)? as u64;
			jit.channel.remote_amount = row.get::<_, i64>(7)? as u64;
			jit.channel.commitment_number = row.get::<_, i64>(8)? as u64;
			jit.created_at = row.get(9)?;
			jit.created_block = row.get(10)?;
			jit.target_factory_id = row.get(11)?;
			Ok(jit)
		})?;

		let mut jits = Vec::new();
		for jit in rows {
			jits.push(jit?);
		}
		Ok(jits)
	}

	/// Store the eight basepoint values so the channel can be rehydrated
	/// after a restart.
	pub fn save_basepoints(
		&mut self, jit_channel_id: u32, jit: &JitChannel,
	) -> Result<(), LspError> {
		let secrets = jit.channel.local_secrets.as_ref().ok_or_else(|| {
			LspError::new(ErrorCode::PersistenceError, "channel has no local basepoint secrets")
		})?;
		let remote = jit.channel.remote_basepoints.as_ref().ok_or_else(|| {
			LspError::new(ErrorCode::PersistenceError, "channel has no remote basepoints")
		})?;

		let secret_bytes = secrets.to_bytes();
		let remote_bytes = remote.to_bytes();

		let tx = self.conn.transaction()?;
		for (i, name) in BASEPOINT_NAMES.iter().enumerate() {
			tx.execute(
				"INSERT OR REPLACE INTO basepoints (channel_id, side, name, value)
					VALUES (?1, 'local', ?2, ?3)",
				params![jit_channel_id, name, secret_bytes[i].to_lower_hex_string()],
			)?;
			tx.execute(
				"INSERT OR REPLACE INTO basepoints (channel_id, side, name, value)
					VALUES (?1, 'remote', ?2, ?3)",
				params![jit_channel_id, name, remote_bytes[i].to_lower_hex_string()],
			)?;
		}
		tx.commit()?;
		Ok(())
	}

	/// Read the eight basepoint values back, or `None` when the channel has
	/// no complete set stored.
	pub fn load_basepoints(
		&self, jit_channel_id: u32,
	) -> Result<Option<BasepointRecord>, LspError> {
		let mut stmt = self.conn.prepare(
			"SELECT side, name, value FROM basepoints WHERE channel_id = ?1",
		)?;
		let rows = stmt.query_map(params![jit_channel_id], |row| {
			Ok((
				row.get::<_, String>(0)?,
				row.get::<_, String>(1)?,
				row.get::<_, String>(2)?,
			))
		})?;

		let mut record = BasepointRecord {
			local_secrets: [[0u8; 32]; 4],
			remote_pubkeys: [[0u8; 33]; 4],
		};
		let mut seen = 0usize;
		for row in rows {
			let (side, name, value) = row?;
			let idx = match BASEPOINT_NAMES.iter().position(|n| *n == name) {
				Some(idx) => idx,
				None => continue,
			};
			let bytes = Vec::<u8>::from_hex(&value).map_err(|e| {
				LspError::new(ErrorCode::PersistenceError, format!("bad basepoint hex: {}", e))
			})?;
			match side.as_str() {
				"local" => {
					record.local_secrets[idx] = bytes.try_into().map_err(|_| {
						LspError::new(ErrorCode::PersistenceError, "basepoint secret is not 32 bytes")
					})?;
					seen += 1;
				},
				"remote" => {
					record.remote_pubkeys[idx] = bytes.try_into().map_err(|_| {
						LspError::new(ErrorCode::PersistenceError, "basepoint pubkey is not 33 bytes")
					})?;
					seen += 1;
				},
				_ => {},
			}
		}

		if seen == 8 {
			Ok(Some(record))
		} else {
			Ok(None)
		}
	}
}
