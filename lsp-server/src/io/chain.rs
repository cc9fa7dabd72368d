// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Chain access as consumed by the channel subsystem: block height,
//! outpoint confirmation, broadcast, and wallet funding.

use std::str::FromStr;

use corepc_client::bitcoin::consensus::encode::deserialize;
use corepc_client::bitcoin::{Address, Amount, Transaction, Txid};
use corepc_client::client_sync::v28::Client;
use corepc_client::client_sync::Auth;
use log::debug;

use crate::error::{ErrorCode, LspError};

pub trait ChainSource {
	fn get_block_height(&self) -> Result<u32, LspError>;

	/// Whether the outpoint `txid:vout` has at least `min_depth`
	/// confirmations.
	fn tx_confirmed(&self, txid: &str, vout: u32, min_depth: u32) -> Result<bool, LspError>;

	/// Broadcast a raw transaction, returning its txid.
	fn broadcast(&self, rawtx: &[u8]) -> Result<String, LspError>;

	fn get_new_address(&self) -> Result<String, LspError>;

	/// Pay `amount_sats` from the backing wallet to `address`, returning the
	/// funding outpoint.
	fn fund_address(&self, address: &str, amount_sats: u64) -> Result<(String, u32), LspError>;
}

/// Chain access over bitcoind's JSON-RPC interface.
pub struct BitcoindClient {
	client: Client,
}

impl BitcoindClient {
	pub fn new(rpc_url: &str, rpc_user: &str, rpc_password: &str) -> Result<Self, LspError> {
		let auth = Auth::UserPass(rpc_user.to_string(), rpc_password.to_string());
		let client = Client::new_with_auth(rpc_url, auth).map_err(|e| {
			LspError::new(
				ErrorCode::FundingBroadcastFailed,
				format!("failed to create bitcoind client: {}", e),
			)
		})?;
		Ok(Self { client })
	}

	fn parse_txid(txid: &str) -> Result<Txid, LspError> {
		Txid::from_str(txid)
			.map_err(|e| LspError::new(ErrorCode::MalformedMessage, format!("bad txid: {}", e)))
	}
}

impl ChainSource for BitcoindClient {
	fn get_block_height(&self) -> Result<u32, LspError> {
		let info = self.client.get_blockchain_info().map_err(|e| {
			LspError::new(
				ErrorCode::FundingBroadcastFailed,
				format!("get_blockchain_info failed: {}", e),
			)
		})?;
		Ok(info.blocks as u32)
	}

	fn tx_confirmed(&self, txid: &str, vout: u32, min_depth: u32) -> Result<bool, LspError> {
		let txid = Self::parse_txid(txid)?;
		// gettxout reports nothing for unknown or spent outputs; either way
		// the outpoint is not a confirmed, unspent funding output.
		match self.client.get_tx_out(txid, vout as u64) {
			Ok(out) => Ok(out.confirmations >= min_depth),
			Err(e) => {
				debug!("gettxout {}:{} returned nothing: {}", txid, vout, e);
				Ok(false)
			},
		}
	}

	fn broadcast(&self, rawtx: &[u8]) -> Result<String, LspError> {
		let tx: Transaction = deserialize(rawtx).map_err(|e| {
			LspError::new(ErrorCode::FundingBroadcastFailed, format!("bad raw transaction: {}", e))
		})?;
		let sent = self.client.send_raw_transaction(&tx).map_err(|e| {
			LspError::new(
				ErrorCode::FundingBroadcastFailed,
				format!("send_raw_transaction failed: {}", e),
			)
		})?;
		Ok(sent.0)
	}

	fn get_new_address(&self) -> Result<String, LspError> {
		let addr = self.client.new_address().map_err(|e| {
			LspError::new(ErrorCode::FundingBroadcastFailed, format!("getnewaddress failed: {}", e))
		})?;
		Ok(addr.to_string())
	}

	fn fund_address(&self, address: &str, amount_sats: u64) -> Result<(String, u32), LspError> {
		let addr = Address::from_str(address)
			.map_err(|e| {
				LspError::new(ErrorCode::FundingBroadcastFailed, format!("invalid address: {}", e))
			})?
			.assume_checked();

		let sent = self
			.client
			.send_to_address(&addr, Amount::from_sat(amount_sats))
			.map_err(|e| {
				LspError::new(
					ErrorCode::FundingBroadcastFailed,
					format!("sendtoaddress failed: {}", e),
				)
			})?;
		let txid = sent.0;

		// Locate the paid output among the transaction's outputs; wallets
		// add a change output at an arbitrary position.
		let parsed = Self::parse_txid(&txid)?;
		for vout in 0..4u32 {
			if let Ok(out) = self.client.get_tx_out(parsed, vout as u64) {
				let sats = (out.value * 100_000_000.0).round() as u64;
				if sats == amount_sats {
					return Ok((txid, vout));
				}
			}
		}
		Ok((txid, 0))
	}
}
