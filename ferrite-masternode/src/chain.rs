//! Contracts this core consumes from the rest of the node.
//!
//! The host node implements these over its chain storage, UTXO set and
//! governance subsystem; tests use in-memory mocks.

use ferrite_shared_types::{Hash, OutPoint, TxOutput};

/// Read access to the active chain.
pub trait ChainView {
    fn tip_height(&self) -> u64;

    /// Hash of the block at `height` on the active chain, if known.
    fn block_hash(&self, height: u64) -> Option<Hash>;

    /// Reverse lookup; `None` for hashes not on the active chain.
    fn height_of(&self, hash: &Hash) -> Option<u64>;

    fn block_time(&self, height: u64) -> Option<i64>;

    /// Coinbase outputs of the block at `height`, for the last-paid scan.
    fn coinbase_outputs(&self, height: u64) -> Option<Vec<TxOutput>>;

    /// Peer-network-median clock.
    fn adjusted_time(&self) -> i64;

    fn last_checkpoint_height(&self) -> Option<u64>;

    /// Lite nodes skip all masternode-specific validation.
    fn is_lite_mode(&self) -> bool {
        false
    }
}

/// An unspent collateral candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoInfo {
    pub value: u64,
    /// Height of the block that confirmed the output.
    pub height: u64,
}

/// Read access to the UTXO set.
pub trait UtxoView {
    /// `None` for unknown or spent outpoints.
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoInfo>;

    fn confirmations(&self, outpoint: &OutPoint, tip: u64) -> u64 {
        match self.get_utxo(outpoint) {
            Some(info) if info.height <= tip => tip - info.height + 1,
            _ => 0,
        }
    }
}

/// The governance (superblock) subsystem, as far as block validation needs
/// it.
pub trait GovernanceView {
    /// Whether `height` falls on the governance payment schedule at all.
    fn is_governance_block_height(&self, height: u64) -> bool;

    /// Whether an activated trigger exists for `height`.
    fn is_governance_block_triggered(&self, height: u64) -> bool;

    /// Extra coinbase value allowed on governance heights, in base units.
    fn payments_limit(&self, height: u64) -> u64;

    fn is_valid_governance_block(&self, outputs: &[TxOutput], height: u64, block_reward: u64)
        -> bool;
}

/// Default collaborator for nodes running without the governance subsystem.
pub struct NoGovernance;

impl GovernanceView for NoGovernance {
    fn is_governance_block_height(&self, _height: u64) -> bool {
        false
    }

    fn is_governance_block_triggered(&self, _height: u64) -> bool {
        false
    }

    fn payments_limit(&self, _height: u64) -> u64 {
        0
    }

    fn is_valid_governance_block(
        &self,
        _outputs: &[TxOutput],
        _height: u64,
        _block_reward: u64,
    ) -> bool {
        false
    }
}
