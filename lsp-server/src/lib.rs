//! A Lightning-style liquidity provider's just-in-time channel fallback:
//! when the shared factory output can no longer serve a client, the server
//! opens a dedicated on-chain channel for it and later folds that channel's
//! balance back into the next factory.

pub mod channel;
pub mod error;
pub mod factory;
pub mod io;
pub mod jit;
pub mod service;
pub mod util;
pub mod watchtower;
pub mod wire;
