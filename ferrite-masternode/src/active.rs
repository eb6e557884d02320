//! Identity of the locally running masternode, if any.

use std::net::SocketAddr;

use ferrite_crypto::FerriteKeyPair;
use ferrite_shared_types::{OutPoint, PublicKeyBytes};

/// Local masternode identity: the collateral outpoint this node claims and
/// the operator keypair it signs live messages with. Nodes running without
/// a masternode configuration simply have none.
pub struct ActiveMasternode {
    pub outpoint: OutPoint,
    /// The address this node advertises.
    pub service: SocketAddr,
    pub operator_keys: FerriteKeyPair,
}

impl ActiveMasternode {
    pub fn new(outpoint: OutPoint, service: SocketAddr, operator_keys: FerriteKeyPair) -> Self {
        ActiveMasternode { outpoint, service, operator_keys }
    }

    pub fn operator_pubkey(&self) -> PublicKeyBytes {
        self.operator_keys.public_key_bytes()
    }
}
