//! Masternode coordination core for Ferrite Coin.
//!
//! Owns the gossip-replicated masternode registry, the Proof-of-Service
//! cross-verification protocol, the per-block payment election and the
//! sync flow control around them. Chain state, the UTXO set, governance
//! and the P2P transport are external collaborators reached through the
//! traits in [`chain`] and the outbound queue in [`net`].

pub mod active;
pub mod chain;
pub mod constants;
pub mod context;
pub mod error;
pub mod net;
pub mod payments;
pub mod pose;
pub mod ranker;
pub mod registry;
pub mod signing;
pub mod store;
pub mod sync;

pub use context::MasternodeContext;
pub use error::{MasternodeError, Result};
