//! Signature helpers over raw byte material.

use ed25519_dalek::{PublicKey, Signature, SignatureError, Verifier};

use crate::keypair::FerriteKeyPair;

pub fn sign_message(keypair: &FerriteKeyPair, message: &[u8]) -> Vec<u8> {
    keypair.sign(message).to_bytes().to_vec()
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), SignatureError> {
    public_key.verify(message, signature)
}

/// Verifies a signature where both the key and the signature arrive as raw
/// bytes off the wire. Malformed lengths count as verification failure
/// rather than a distinct error class.
pub fn verify_signature_bytes(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let key = match PublicKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let sig = match Signature::from_bytes(&sig_bytes) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_level_verification() {
        let keypair = FerriteKeyPair::generate();
        let sig = sign_message(&keypair, b"payload");
        assert!(verify_signature_bytes(&keypair.public_key_bytes(), b"payload", &sig));
        assert!(!verify_signature_bytes(&keypair.public_key_bytes(), b"other", &sig));
        assert!(!verify_signature_bytes(&keypair.public_key_bytes(), b"payload", &sig[..63]));
    }
}
