use serde::{Deserialize, Serialize};

pub type PublicKeyBytes = [u8; 32];
pub type SignatureBytes = Vec<u8>;
pub type Hash = [u8; 32];
pub type Script = Vec<u8>;

/// Number of base units per coin.
pub const COIN: u64 = 100_000_000;

pub mod masternode;
pub mod p2p;

/// Represents a reference to a specific transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// The transaction ID (hash) of the transaction containing the output.
    pub txid: [u8; 32],
    /// The index of the output within that transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: [u8; 32], vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// The all-zero outpoint, used on the wire to request a full list.
    pub fn null() -> Self {
        OutPoint { txid: [0u8; 32], vout: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0u8; 32] && self.vout == u32::MAX
    }

    /// Short textual form, `<txid hex>-<vout>`. This exact rendering is part
    /// of the legacy signing format and must not change.
    pub fn to_short_string(&self) -> String {
        format!("{}-{}", hex::encode(self.txid), self.vout)
    }

    pub fn encode_to_vec(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// A single transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// The amount in base units.
    pub value: u64,
    /// The locking script.
    pub script_pubkey: Script,
}

/// Derives the payment script for a collateral public key: a version byte
/// followed by a 20-byte key hash.
pub fn payee_script(pubkey: &PublicKeyBytes) -> Script {
    let digest = blake3::hash(pubkey);
    let mut script = Vec::with_capacity(22);
    script.push(0x00);
    script.push(0x14);
    script.extend_from_slice(&digest.as_bytes()[..20]);
    script
}

/// Textual rendering of a script, used by the legacy vote signing format.
/// Ferrite scripts are opaque byte vectors, rendered as lowercase hex.
pub fn script_asm(script: &[u8]) -> String {
    hex::encode(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outpoint_short_string_is_stable() {
        let op = OutPoint::new([0xab; 32], 3);
        let rendered = op.to_short_string();
        assert!(rendered.starts_with("abab"));
        assert!(rendered.ends_with("-3"));
        assert_eq!(rendered.len(), 64 + 2);
    }

    #[test]
    fn null_outpoint_round_trip() {
        let op = OutPoint::null();
        assert!(op.is_null());
        assert!(!OutPoint::new([0u8; 32], 0).is_null());
    }

    #[test]
    fn payee_script_is_deterministic() {
        let pk = [7u8; 32];
        let a = payee_script(&pk);
        let b = payee_script(&pk);
        assert_eq!(a, b);
        assert_eq!(a.len(), 22);
        assert_ne!(a, payee_script(&[8u8; 32]));
    }
}
