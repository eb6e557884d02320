//! Cryptographic primitives for Ferrite Coin: Ed25519 keypairs, message
//! signing helpers and hashing.

pub mod hash;
pub mod keypair;
pub mod signature;

pub use keypair::FerriteKeyPair;
pub use signature::{sign_message, verify_signature, verify_signature_bytes};
