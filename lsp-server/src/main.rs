use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;
use std::{fs, thread};

use anyhow::Context;
use bitcoin::secp256k1::SecretKey;
use clap::Parser;
use hex::{DisplayHex, FromHex};
use log::{info, warn};

use lsp_server::factory::Factory;
use lsp_server::io::chain::{BitcoindClient, ChainSource};
use lsp_server::io::persist::SqliteStore;
use lsp_server::service::{LspService, REASON_FACTORY_EXPIRED, REASON_NEW_CLIENT};
use lsp_server::util::config::{load_config, ArgsConfig, Config};
use lsp_server::wire::{JsonTransport, MessageTransport};

const DB_FILE: &str = "lsp.db";
const KEY_FILE: &str = "lsp_key.hex";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
	let args = ArgsConfig::parse();
	let config = load_config(&args).context("Invalid configuration")?;

	init_logging(&config)?;

	fs::create_dir_all(&config.storage_dir_path)
		.context("Failed to create storage directory")?;
	let storage_dir = Path::new(&config.storage_dir_path);

	let persister = SqliteStore::open(storage_dir.join(DB_FILE))
		.map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

	let lsp_seckey = load_or_generate_key(&storage_dir.join(KEY_FILE))?;

	let chain = build_chain_source(&config)?;
	if chain.is_none() {
		warn!("No bitcoind RPC configured; funding broadcast and confirmation are disabled");
	}

	let mut service =
		LspService::new(config.jit.clone(), config.network, lsp_seckey, persister, chain);

	let restored = service.reload().map_err(|e| anyhow::anyhow!("Reload failed: {}", e))?;
	info!("Restored {} fallback channel(s) from disk", restored);
	let resumed =
		service.resume_migrations().map_err(|e| anyhow::anyhow!("Resume failed: {}", e))?;
	if resumed > 0 {
		info!("Completed {} interrupted migration(s)", resumed);
	}

	let base_height = service.chain_height().unwrap_or(0);
	let factory =
		Factory::new(0, base_height, config.factory.active_blocks, config.factory.dying_blocks);

	let listener = TcpListener::bind(config.listening_addr)
		.with_context(|| format!("Failed to bind {}", config.listening_addr))?;
	listener.set_nonblocking(true)?;
	info!("Listening for clients on {}", config.listening_addr);

	let mut conns: Vec<Option<JsonTransport<TcpStream, TcpStream>>> = Vec::new();
	conns.resize_with(config.jit.n_channels, || None);

	loop {
		accept_clients(&listener, &mut conns, &mut service, &config);

		let now = chrono::Utc::now().timestamp();
		service.detect_offline_clients(now);

		if let Err(e) = service.check_funding() {
			// Persistence divergence is the one thing we never run past.
			anyhow::bail!("Funding check failed fatally: {}", e);
		}

		let height = service.chain_height().unwrap_or(base_height);
		for client_idx in service.clients_needing_fallback(&factory, height) {
			let conn = match conns[client_idx].as_mut() {
				Some(conn) => conn,
				None => continue,
			};
			let transport: &mut dyn MessageTransport = conn;
			match service.jit_channel_create(
				transport,
				client_idx,
				config.jit.default_funding_sats,
				REASON_FACTORY_EXPIRED,
			) {
				Ok(id) => info!("Opened fallback channel {:#06x} for client {}", id, client_idx),
				Err(e) => {
					warn!("Fallback open for client {} failed: {}", client_idx, e);
					conns[client_idx] = None;
				},
			}
		}

		thread::sleep(TICK_INTERVAL);
	}
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
	let mut builder = env_logger::Builder::new();
	builder.filter_level(config.log_level);
	if let Some(path) = &config.log_file_path {
		let file = fs::File::create(path).context("Failed to create log file")?;
		builder.target(env_logger::Target::Pipe(Box::new(file)));
	}
	builder.init();
	Ok(())
}

fn load_or_generate_key(path: &Path) -> anyhow::Result<SecretKey> {
	if path.exists() {
		let hex = fs::read_to_string(path)?;
		let bytes = Vec::<u8>::from_hex(hex.trim())
			.map_err(|e| anyhow::anyhow!("Corrupt key file: {}", e))?;
		return SecretKey::from_slice(&bytes).map_err(|e| anyhow::anyhow!("Bad key: {}", e));
	}
	let key = SecretKey::new(&mut rand::thread_rng());
	fs::write(path, key.secret_bytes().to_lower_hex_string())?;
	info!("Generated new LSP key at {}", path.display());
	Ok(key)
}

fn build_chain_source(config: &Config) -> anyhow::Result<Option<Box<dyn ChainSource>>> {
	let addr = match config.bitcoind_rpc_addr {
		Some(addr) => addr,
		None => return Ok(None),
	};
	let user = config.bitcoind_rpc_user.clone().context("bitcoind RPC user is required")?;
	let password =
		config.bitcoind_rpc_password.clone().context("bitcoind RPC password is required")?;
	let client = BitcoindClient::new(&format!("http://{}", addr), &user, &password)
		.map_err(|e| anyhow::anyhow!("Failed to connect to bitcoind: {}", e))?;
	Ok(Some(Box::new(client)))
}

fn accept_clients(
	listener: &TcpListener, conns: &mut [Option<JsonTransport<TcpStream, TcpStream>>],
	service: &mut LspService, config: &Config,
) {
	loop {
		let (stream, peer) = match listener.accept() {
			Ok(accepted) => accepted,
			Err(e) if e.kind() == ErrorKind::WouldBlock => return,
			Err(e) => {
				warn!("Failed to accept connection: {}", e);
				return;
			},
		};

		let client_idx = match conns.iter().position(|c| c.is_none()) {
			Some(idx) => idx,
			None => {
				warn!("All client slots occupied, rejecting {}", peer);
				continue;
			},
		};

		if let Err(e) = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)) {
			warn!("Failed to set read timeout for {}: {}", peer, e);
			continue;
		}
		let reader = match stream.try_clone() {
			Ok(reader) => reader,
			Err(e) => {
				warn!("Failed to clone stream for {}: {}", peer, e);
				continue;
			},
		};

		info!("Client {} connected from {}", client_idx, peer);
		conns[client_idx] = Some(JsonTransport::new(reader, stream));
		service.entries[client_idx].touch(chrono::Utc::now().timestamp());

		// A client joining before rotation completes gets a fallback right
		// away rather than waiting for the factory to expire.
		if !service.entries[client_idx].ready && !service.jits.is_active(client_idx) {
			let conn = match conns[client_idx].as_mut() {
				Some(conn) => conn,
				None => continue,
			};
			let transport: &mut dyn MessageTransport = conn;
			match service.jit_channel_create(
				transport,
				client_idx,
				config.jit.default_funding_sats,
				REASON_NEW_CLIENT,
			) {
				Ok(id) => info!("Opened fallback channel {:#06x} for new client", id),
				Err(e) => {
					warn!("Fallback open for new client {} failed: {}", client_idx, e);
					conns[client_idx] = None;
				},
			}
		}
	}
}
