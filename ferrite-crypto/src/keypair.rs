//! Keypair generation and management for Ferrite Coin.

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;

/// Represents a cryptographic key pair (public and secret key).
pub struct FerriteKeyPair {
    keypair: Keypair,
}

impl FerriteKeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        let keypair = Keypair::generate(&mut csprng);
        FerriteKeyPair { keypair }
    }

    /// Rebuilds a key pair from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, ed25519_dalek::SignatureError> {
        let secret = SecretKey::from_bytes(seed)?;
        let public = PublicKey::from(&secret);
        Ok(FerriteKeyPair { keypair: Keypair { secret, public } })
    }

    /// Returns the public key of this key pair.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public
    }

    /// Raw public key bytes, as stored in masternode records.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }

    /// Signs the given message with the secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }

    /// Verifies the given signature against the message and public key.
    pub fn verify(
        public_key: &PublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        public_key.verify(message, signature)
    }
}

impl std::fmt::Debug for FerriteKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FerriteKeyPair")
            .field("public", &self.keypair.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = FerriteKeyPair::generate();
        let sig = keypair.sign(b"ferrite");
        assert!(FerriteKeyPair::verify(&keypair.public_key(), b"ferrite", &sig).is_ok());
        assert!(FerriteKeyPair::verify(&keypair.public_key(), b"not ferrite", &sig).is_err());
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let a = FerriteKeyPair::from_seed(&[42u8; 32]).unwrap();
        let b = FerriteKeyPair::from_seed(&[42u8; 32]).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
    }
}
