// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::{fs, io};

use bitcoin::Network;
use clap::Parser;
use log::LevelFilter;
use serde::Deserialize;

pub const DEFAULT_N_CHANNELS: usize = 8;
pub const DEFAULT_FUNDING_SATS: u64 = 50_000;
pub const DEFAULT_CONFIRMATION_DEPTH: u32 = 1;
pub const DEFAULT_FUNDING_TIMEOUT_BLOCKS: u32 = 144;
pub const DEFAULT_OFFLINE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_ROTATION_RETRIES: u32 = 3;
pub const DEFAULT_ROTATION_RETRY_BLOCKS: u32 = 6;
pub const DEFAULT_FACTORY_ACTIVE_BLOCKS: u32 = 144;
pub const DEFAULT_FACTORY_DYING_BLOCKS: u32 = 144;

/// Configuration for the LSP server.
#[derive(Debug)]
pub struct Config {
	pub network: Network,
	pub listening_addr: SocketAddr,
	pub storage_dir_path: String,
	pub bitcoind_rpc_addr: Option<SocketAddr>,
	pub bitcoind_rpc_user: Option<String>,
	pub bitcoind_rpc_password: Option<String>,
	pub jit: JitConfig,
	pub factory: FactoryConfig,
	pub log_level: LevelFilter,
	pub log_file_path: Option<String>,
}

/// Parameters of the just-in-time fallback subsystem.
#[derive(Clone, Debug)]
pub struct JitConfig {
	pub enabled: bool,
	/// Number of client slots; also the base of the fallback watch-index
	/// range.
	pub n_channels: usize,
	pub default_funding_sats: u64,
	pub confirmation_depth: u32,
	pub funding_timeout_blocks: u32,
	pub offline_timeout_secs: u64,
	pub max_rotation_retries: u32,
	pub rotation_retry_blocks: u32,
}

impl Default for JitConfig {
	fn default() -> Self {
		JitConfig {
			enabled: true,
			n_channels: DEFAULT_N_CHANNELS,
			default_funding_sats: DEFAULT_FUNDING_SATS,
			confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
			funding_timeout_blocks: DEFAULT_FUNDING_TIMEOUT_BLOCKS,
			offline_timeout_secs: DEFAULT_OFFLINE_TIMEOUT_SECS,
			max_rotation_retries: DEFAULT_MAX_ROTATION_RETRIES,
			rotation_retry_blocks: DEFAULT_ROTATION_RETRY_BLOCKS,
		}
	}
}

#[derive(Clone, Copy, Debug)]
pub struct FactoryConfig {
	pub active_blocks: u32,
	pub dying_blocks: u32,
}

impl Default for FactoryConfig {
	fn default() -> Self {
		FactoryConfig {
			active_blocks: DEFAULT_FACTORY_ACTIVE_BLOCKS,
			dying_blocks: DEFAULT_FACTORY_DYING_BLOCKS,
		}
	}
}

/// Command-line overrides, applied on top of the TOML file.
#[derive(Parser, Debug, Default)]
#[command(name = "lsp-server")]
pub struct ArgsConfig {
	/// Path to the TOML configuration file.
	pub config_path: Option<String>,

	#[arg(long)]
	pub network: Option<Network>,

	#[arg(long)]
	pub listening_address: Option<String>,

	#[arg(long)]
	pub storage_dir_path: Option<String>,

	#[arg(long)]
	pub bitcoind_rpc_address: Option<String>,

	#[arg(long)]
	pub bitcoind_rpc_user: Option<String>,

	#[arg(long)]
	pub bitcoind_rpc_password: Option<String>,

	#[arg(long, env = "JIT_OFFLINE_TIMEOUT_SEC")]
	pub jit_offline_timeout_secs: Option<u64>,

	#[arg(long)]
	pub log_level: Option<String>,
}

#[derive(Deserialize)]
struct TomlConfig {
	node: Option<NodeToml>,
	bitcoind: Option<BitcoindToml>,
	jit: Option<JitToml>,
	factory: Option<FactoryToml>,
	log: Option<LogToml>,
}

#[derive(Deserialize)]
struct NodeToml {
	network: Option<Network>,
	listening_address: Option<String>,
	storage_dir_path: Option<String>,
}

#[derive(Deserialize)]
struct BitcoindToml {
	rpc_address: Option<String>,
	rpc_user: Option<String>,
	rpc_password: Option<String>,
}

#[derive(Deserialize)]
struct JitToml {
	enabled: Option<bool>,
	n_channels: Option<usize>,
	default_funding_sats: Option<u64>,
	confirmation_depth: Option<u32>,
	funding_timeout_blocks: Option<u32>,
	offline_timeout_secs: Option<u64>,
	max_rotation_retries: Option<u32>,
	rotation_retry_blocks: Option<u32>,
}

#[derive(Deserialize)]
struct FactoryToml {
	active_blocks: Option<u32>,
	dying_blocks: Option<u32>,
}

#[derive(Deserialize)]
struct LogToml {
	level: Option<String>,
	file: Option<String>,
}

/// A builder for `Config`.
#[derive(Default)]
struct ConfigBuilder {
	network: Option<Network>,
	listening_address: Option<String>,
	storage_dir_path: Option<String>,
	bitcoind_rpc_addr: Option<String>,
	bitcoind_rpc_user: Option<String>,
	bitcoind_rpc_password: Option<String>,
	jit: JitConfig,
	factory: FactoryConfig,
	log_level: Option<String>,
	log_file_path: Option<String>,
}

impl ConfigBuilder {
	fn merge_toml(&mut self, toml: TomlConfig) {
		if let Some(node) = toml.node {
			self.network = node.network.or(self.network);
			self.listening_address = node.listening_address.or(self.listening_address.clone());
			self.storage_dir_path = node.storage_dir_path.or(self.storage_dir_path.clone());
		}

		if let Some(bitcoind) = toml.bitcoind {
			self.bitcoind_rpc_addr = bitcoind.rpc_address.or(self.bitcoind_rpc_addr.clone());
			self.bitcoind_rpc_user = bitcoind.rpc_user.or(self.bitcoind_rpc_user.clone());
			self.bitcoind_rpc_password =
				bitcoind.rpc_password.or(self.bitcoind_rpc_password.clone());
		}

		if let Some(jit) = toml.jit {
			if let Some(enabled) = jit.enabled {
				self.jit.enabled = enabled;
			}
			if let Some(n_channels) = jit.n_channels {
				self.jit.n_channels = n_channels;
			}
			if let Some(sats) = jit.default_funding_sats {
				self.jit.default_funding_sats = sats;
			}
			if let Some(depth) = jit.confirmation_depth {
				self.jit.confirmation_depth = depth;
			}
			if let Some(blocks) = jit.funding_timeout_blocks {
				self.jit.funding_timeout_blocks = blocks;
			}
			if let Some(secs) = jit.offline_timeout_secs {
				self.jit.offline_timeout_secs = secs;
			}
			if let Some(retries) = jit.max_rotation_retries {
				self.jit.max_rotation_retries = retries;
			}
			if let Some(blocks) = jit.rotation_retry_blocks {
				self.jit.rotation_retry_blocks = blocks;
			}
		}

		if let Some(factory) = toml.factory {
			if let Some(blocks) = factory.active_blocks {
				self.factory.active_blocks = blocks;
			}
			if let Some(blocks) = factory.dying_blocks {
				self.factory.dying_blocks = blocks;
			}
		}

		if let Some(log) = toml.log {
			self.log_level = log.level.or(self.log_level.clone());
			self.log_file_path = log.file.or(self.log_file_path.clone());
		}
	}

	fn merge_args(&mut self, args: &ArgsConfig) {
		if let Some(network) = args.network {
			self.network = Some(network);
		}

		if let Some(listening_address) = &args.listening_address {
			self.listening_address = Some(listening_address.clone());
		}

		if let Some(storage_dir_path) = &args.storage_dir_path {
			self.storage_dir_path = Some(storage_dir_path.clone());
		}

		if let Some(bitcoind_rpc_address) = &args.bitcoind_rpc_address {
			self.bitcoind_rpc_addr = Some(bitcoind_rpc_address.clone());
		}

		if let Some(bitcoind_rpc_user) = &args.bitcoind_rpc_user {
			self.bitcoind_rpc_user = Some(bitcoind_rpc_user.clone());
		}

		if let Some(bitcoind_rpc_password) = &args.bitcoind_rpc_password {
			self.bitcoind_rpc_password = Some(bitcoind_rpc_password.clone());
		}

		if let Some(secs) = args.jit_offline_timeout_secs {
			self.jit.offline_timeout_secs = secs;
		}

		if let Some(log_level) = &args.log_level {
			self.log_level = Some(log_level.clone());
		}
	}

	fn build(self) -> io::Result<Config> {
		let network = self.network.ok_or_else(|| missing_field_err("network"))?;

		let listening_addr = self
			.listening_address
			.ok_or_else(|| missing_field_err("listening_address"))?
			.parse::<SocketAddr>()
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

		let storage_dir_path =
			self.storage_dir_path.ok_or_else(|| missing_field_err("storage_dir_path"))?;

		let bitcoind_rpc_addr = self
			.bitcoind_rpc_addr
			.map(|addr| {
				addr.parse::<SocketAddr>().map_err(|e| {
					io::Error::new(
						io::ErrorKind::InvalidInput,
						format!("Invalid bitcoind RPC address configured: {}", e),
					)
				})
			})
			.transpose()?;

		let log_level = self
			.log_level
			.map(|level| {
				LevelFilter::from_str(&level).map_err(|e| {
					io::Error::new(
						io::ErrorKind::InvalidInput,
						format!("Invalid log level configured: {}", e),
					)
				})
			})
			.transpose()?
			.unwrap_or(LevelFilter::Info);

		Ok(Config {
			network,
			listening_addr,
			storage_dir_path,
			bitcoind_rpc_addr,
			bitcoind_rpc_user: self.bitcoind_rpc_user,
			bitcoind_rpc_password: self.bitcoind_rpc_password,
			jit: self.jit,
			factory: self.factory,
			log_level,
			log_file_path: self.log_file_path,
		})
	}
}

fn missing_field_err(field: &str) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidInput, format!("Config field `{}` is required.", field))
}

pub fn load_config(args: &ArgsConfig) -> io::Result<Config> {
	let mut builder = ConfigBuilder::default();

	if let Some(path) = &args.config_path {
		let contents = fs::read_to_string(Path::new(path))?;
		let toml: TomlConfig = toml::from_str(&contents)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		builder.merge_toml(toml);
	}

	builder.merge_args(args);
	builder.build()
}
