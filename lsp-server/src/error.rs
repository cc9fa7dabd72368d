// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::fmt;

/// An error surfaced by the LSP's channel subsystem.
#[derive(Debug)]
pub struct LspError {
	// The error message containing a generic description of the error condition in English.
	// It is intended for a human audience only and should not be parsed to extract any
	// information programmatically. Client-side code may use it for logging only.
	pub message: String,

	// The error code uniquely identifying an error condition.
	// It is meant to be read and understood programmatically by code that detects/handles
	// errors by type.
	pub code: ErrorCode,
}

impl LspError {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		LspError { code, message: message.into() }
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
	/// A wire message failed to parse or carried an ill-typed or out-of-range field.
	/// The connection is reset; channel state is left unchanged.
	MalformedMessage,

	/// The peer sent an unexpected message type, a bad pubkey, or disconnected
	/// mid-handshake. The channel is rolled back and any partial persistent state removed.
	HandshakeFailed,

	/// The chain backend refused the funding transaction. The channel is not created;
	/// the trigger loop may re-attempt on a later tick.
	FundingBroadcastFailed,

	/// A funding transaction exceeded the maximum confirmation wait.
	ConfirmationTimeout,

	/// A persistence write failed. Fatal: the control loop aborts rather than risk
	/// divergence between in-memory and on-disk state.
	PersistenceError,

	/// Watchtower registration failed. Non-fatal; the channel stays open but unwatched.
	WatchtowerBindError,

	/// The counterparty rejected migration. The channel stays open; retried on the
	/// next rotation.
	MigrationRefused,
}

impl fmt::Display for LspError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?}: {}", self.code, self.message)
	}
}

impl std::error::Error for LspError {}

impl From<rusqlite::Error> for LspError {
	fn from(e: rusqlite::Error) -> Self {
		LspError::new(ErrorCode::PersistenceError, format!("sqlite error: {}", e))
	}
}

impl From<serde_json::Error> for LspError {
	fn from(e: serde_json::Error) -> Self {
		LspError::new(ErrorCode::MalformedMessage, format!("json error: {}", e))
	}
}

impl From<std::io::Error> for LspError {
	fn from(e: std::io::Error) -> Self {
		LspError::new(ErrorCode::MalformedMessage, format!("socket error: {}", e))
	}
}
