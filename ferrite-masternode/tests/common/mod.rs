//! Shared fixtures: in-memory chain/UTXO views and keypair-backed
//! masternode builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;

use ferrite_crypto::FerriteKeyPair;
use ferrite_masternode::chain::{ChainView, UtxoInfo, UtxoView};
use ferrite_masternode::context::MasternodeContext;
use ferrite_masternode::signing;
use ferrite_shared_types::masternode::{
    Masternode, MasternodeBroadcast, MasternodeParams, MasternodePaymentVote, MasternodePing,
    MasternodeState,
};
use ferrite_shared_types::{Hash, OutPoint, Script, TxOutput};

pub struct MockChain {
    pub tip: u64,
    pub time: i64,
    pub coinbases: HashMap<u64, Vec<TxOutput>>,
    pub checkpoint: Option<u64>,
    pub lite: bool,
}

impl MockChain {
    pub fn new(tip: u64, time: i64) -> Self {
        MockChain { tip, time, coinbases: HashMap::new(), checkpoint: None, lite: false }
    }

    pub fn hash_for(height: u64) -> Hash {
        *blake3::hash(format!("ferrite-block-{}", height).as_bytes()).as_bytes()
    }

    pub fn with_coinbase(mut self, height: u64, outputs: Vec<TxOutput>) -> Self {
        self.coinbases.insert(height, outputs);
        self
    }
}

impl ChainView for MockChain {
    fn tip_height(&self) -> u64 {
        self.tip
    }

    fn block_hash(&self, height: u64) -> Option<Hash> {
        (height <= self.tip).then(|| Self::hash_for(height))
    }

    fn height_of(&self, hash: &Hash) -> Option<u64> {
        (0..=self.tip).find(|h| Self::hash_for(*h) == *hash)
    }

    fn block_time(&self, height: u64) -> Option<i64> {
        (height <= self.tip).then(|| self.time - ((self.tip - height) as i64) * 150)
    }

    fn coinbase_outputs(&self, height: u64) -> Option<Vec<TxOutput>> {
        self.coinbases.get(&height).cloned()
    }

    fn adjusted_time(&self) -> i64 {
        self.time
    }

    fn last_checkpoint_height(&self) -> Option<u64> {
        self.checkpoint
    }

    fn is_lite_mode(&self) -> bool {
        self.lite
    }
}

#[derive(Default)]
pub struct MockUtxo {
    pub utxos: HashMap<OutPoint, UtxoInfo>,
}

impl MockUtxo {
    pub fn insert(&mut self, outpoint: OutPoint, value: u64, height: u64) {
        self.utxos.insert(outpoint, UtxoInfo { value, height });
    }

    pub fn spend(&mut self, outpoint: &OutPoint) {
        self.utxos.remove(outpoint);
    }
}

impl UtxoView for MockUtxo {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoInfo> {
        self.utxos.get(outpoint).copied()
    }
}

/// A masternode with real keys, able to sign its own records.
pub struct MnFixture {
    pub collateral_keys: FerriteKeyPair,
    pub operator_keys: FerriteKeyPair,
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
}

impl MnFixture {
    pub fn new(seed: u8) -> Self {
        let collateral_keys = FerriteKeyPair::from_seed(&[seed; 32]).unwrap();
        let operator_keys = FerriteKeyPair::from_seed(&[seed.wrapping_add(64); 32]).unwrap();
        MnFixture {
            collateral_keys,
            operator_keys,
            outpoint: OutPoint::new([seed; 32], 0),
            addr: format!("51.15.{}.{}:9999", seed, seed).parse().unwrap(),
        }
    }

    pub fn with_addr(seed: u8, addr: &str) -> Self {
        let mut fixture = Self::new(seed);
        fixture.addr = addr.parse().unwrap();
        fixture
    }

    pub fn payee_script(&self) -> Script {
        ferrite_shared_types::payee_script(&self.collateral_keys.public_key_bytes())
    }

    /// A registry entry in the given state, bypassing gossip ingestion.
    pub fn entry(&self, sig_time: i64, activation_height: u64, state: MasternodeState) -> Masternode {
        Masternode {
            outpoint: self.outpoint.clone(),
            addr: self.addr,
            collateral_pubkey: self.collateral_keys.public_key_bytes(),
            operator_pubkey: self.operator_keys.public_key_bytes(),
            protocol_version: MasternodeParams::default().protocol_version,
            sig_time,
            activation_height,
            last_ping: None,
            last_paid_primary_height: 0,
            last_paid_primary_time: 0,
            last_paid_secondary_height: 0,
            last_paid_secondary_time: 0,
            pose_ban_score: 0,
            state,
            last_check_time: 0,
            broadcast_signature: Vec::new(),
        }
    }

    pub fn ping(&self, chain: &MockChain, sig_time: i64, params: &MasternodeParams) -> MasternodePing {
        let mut ping = MasternodePing {
            outpoint: self.outpoint.clone(),
            block_hash: MockChain::hash_for(chain.tip),
            sig_time,
            daemon_version: params.client_version,
            sentinel_current: true,
            signature: Vec::new(),
        };
        ping.signature = signing::sign_dual(
            &self.operator_keys,
            chain.tip,
            &ping.signature_hash(),
            &ping.legacy_message(),
            params,
        );
        ping
    }

    pub fn broadcast(
        &self,
        chain: &MockChain,
        sig_time: i64,
        ping_time: i64,
        params: &MasternodeParams,
    ) -> MasternodeBroadcast {
        let mut mnb = MasternodeBroadcast {
            outpoint: self.outpoint.clone(),
            addr: self.addr,
            collateral_pubkey: self.collateral_keys.public_key_bytes(),
            operator_pubkey: self.operator_keys.public_key_bytes(),
            protocol_version: params.protocol_version,
            sig_time,
            last_ping: Some(self.ping(chain, ping_time, params)),
            signature: Vec::new(),
            recovery: false,
        };
        mnb.signature = signing::sign_dual(
            &self.collateral_keys,
            chain.tip,
            &mnb.signature_hash(),
            &mnb.legacy_message(),
            params,
        );
        mnb
    }

    pub fn vote(
        &self,
        height: u64,
        payee: Script,
        chain: &MockChain,
        params: &MasternodeParams,
    ) -> MasternodePaymentVote {
        let mut vote = MasternodePaymentVote::new(self.outpoint.clone(), height, payee);
        vote.signature = signing::sign_dual(
            &self.operator_keys,
            chain.tip,
            &vote.signature_hash(),
            &vote.legacy_message(),
            params,
        );
        vote
    }
}

pub fn misbehaves(events: &[ferrite_shared_types::p2p::NetEvent]) -> Vec<(SocketAddr, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            ferrite_shared_types::p2p::NetEvent::Misbehave(addr, score) => Some((*addr, *score)),
            _ => None,
        })
        .collect()
}

/// A context whose sync state machine reports fully synced.
pub fn synced_context(params: MasternodeParams) -> MasternodeContext {
    let ctx = MasternodeContext::new(params, None);
    ctx.sync.set_blockchain_synced(true, 0);
    ctx.sync.force_finished();
    ctx
}

/// Registers enabled entries for the fixtures, with matching collateral.
pub fn register_all(
    ctx: &MasternodeContext,
    fixtures: &[MnFixture],
    utxo: &mut MockUtxo,
    sig_time: i64,
    activation_height: u64,
) {
    let params = MasternodeParams::default();
    for fixture in fixtures {
        utxo.insert(fixture.outpoint.clone(), params.collateral_amount, activation_height);
        let entry = fixture.entry(sig_time, activation_height, MasternodeState::Enabled);
        ctx.registry.add(entry, utxo).unwrap();
    }
}
