//! Deterministic masternode ranking.
//!
//! Every node must arrive at the same ordering from the same registry and
//! chain state, without coordination. The score of a masternode at a block
//! is `H(operator_pubkey || block_hash || H(operator_pubkey || block_hash))`
//! read as a 256-bit big-endian integer; ranks sort by score descending
//! with ties broken by ascending outpoint, which makes the order total.

use primitive_types::U256;

use ferrite_crypto::hash::double_hash256;
use ferrite_shared_types::masternode::Masternode;
use ferrite_shared_types::{Hash, OutPoint, PublicKeyBytes};

use crate::constants::RANK_LOOKBACK;

/// Rank score of one masternode at one block.
pub fn score(operator_pubkey: &PublicKeyBytes, block_hash: &Hash) -> U256 {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(operator_pubkey);
    data.extend_from_slice(block_hash);
    U256::from_big_endian(&double_hash256(&data))
}

/// The block height whose hash ranks events at `event_height`: the fixed
/// coinbase-maturity-plus-one lookback.
pub fn ranking_height(event_height: u64) -> Option<u64> {
    event_height.checked_sub(RANK_LOOKBACK)
}

/// Total ordering of the given entries at `block_hash`, best first.
/// Entries below the protocol floor are excluded.
pub fn order_by_score<'a, I>(entries: I, block_hash: &Hash, min_protocol: u32) -> Vec<&'a Masternode>
where
    I: IntoIterator<Item = &'a Masternode>,
{
    let mut scored: Vec<(U256, &Masternode)> = entries
        .into_iter()
        .filter(|mn| mn.protocol_version >= min_protocol)
        .map(|mn| (score(&mn.operator_pubkey, block_hash), mn))
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.outpoint.cmp(&b.1.outpoint)));
    scored.into_iter().map(|(_, mn)| mn).collect()
}

/// 1-based rank of `outpoint` within [`order_by_score`], if it qualifies.
pub fn rank_of<'a, I>(
    entries: I,
    outpoint: &OutPoint,
    block_hash: &Hash,
    min_protocol: u32,
) -> Option<usize>
where
    I: IntoIterator<Item = &'a Masternode>,
{
    order_by_score(entries, block_hash, min_protocol)
        .iter()
        .position(|mn| &mn.outpoint == outpoint)
        .map(|idx| idx + 1)
}
