//! Height-gated dual-format signing.
//!
//! Above `sign_hash_threshold` records are signed over their serialization
//! digest; at or below it the legacy human-readable concatenation is
//! signed. Verifiers accept either format during the transition, signers
//! use only the modern one past the threshold. The legacy message layouts
//! live with each record type and are consensus-critical.

use ferrite_crypto::{sign_message, verify_signature_bytes, FerriteKeyPair};
use ferrite_shared_types::{Hash, PublicKeyBytes};

use ferrite_shared_types::masternode::MasternodeParams;

/// Whether the modern (hash) signing format is in force at `tip`.
pub fn use_hash_format(tip: u64, params: &MasternodeParams) -> bool {
    tip > params.sign_hash_threshold
}

/// Signs either the digest or the legacy message depending on the gate.
pub fn sign_dual(
    keypair: &FerriteKeyPair,
    tip: u64,
    digest: &Hash,
    legacy: &[u8],
    params: &MasternodeParams,
) -> Vec<u8> {
    if use_hash_format(tip, params) {
        sign_message(keypair, digest)
    } else {
        sign_message(keypair, legacy)
    }
}

/// Verifies against the modern format first, falling back to the legacy
/// concatenation.
pub fn verify_dual(
    pubkey: &PublicKeyBytes,
    tip: u64,
    digest: &Hash,
    legacy: &[u8],
    signature: &[u8],
    params: &MasternodeParams,
) -> bool {
    if use_hash_format(tip, params) {
        if verify_signature_bytes(pubkey, digest, signature) {
            return true;
        }
        // could be a signature in the old format
        return verify_signature_bytes(pubkey, legacy, signature);
    }
    verify_signature_bytes(pubkey, legacy, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_formats_verify_above_threshold() {
        let params = MasternodeParams::default();
        let tip = params.sign_hash_threshold + 1;
        let keys = FerriteKeyPair::generate();
        let digest = [1u8; 32];
        let legacy = b"legacy-message".to_vec();

        let modern_sig = sign_dual(&keys, tip, &digest, &legacy, &params);
        assert!(verify_dual(&keys.public_key_bytes(), tip, &digest, &legacy, &modern_sig, &params));

        let legacy_sig = sign_message(&keys, &legacy);
        assert!(verify_dual(&keys.public_key_bytes(), tip, &digest, &legacy, &legacy_sig, &params));
    }

    #[test]
    fn below_threshold_only_legacy_verifies() {
        let params = MasternodeParams::default();
        let tip = params.sign_hash_threshold;
        let keys = FerriteKeyPair::generate();
        let digest = [1u8; 32];
        let legacy = b"legacy-message".to_vec();

        let sig = sign_dual(&keys, tip, &digest, &legacy, &params);
        assert!(verify_dual(&keys.public_key_bytes(), tip, &digest, &legacy, &sig, &params));

        let modern_sig = sign_message(&keys, &digest);
        assert!(!verify_dual(&keys.public_key_bytes(), tip, &digest, &legacy, &modern_sig, &params));
    }
}
