//! Per-block payment election: vote collection, winner selection,
//! own-vote production and block-reward validation.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, error, info, warn};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use ferrite_shared_types::masternode::{
    BlockPayees, Masternode, MasternodeInfo, MasternodeParams, MasternodePaymentVote,
};
use ferrite_shared_types::p2p::{Inv, InvKind, MasternodeMessage, NetEvent, SyncAsset};
use ferrite_shared_types::{Hash, OutPoint, Script, TxOutput};

use crate::active::ActiveMasternode;
use crate::chain::{ChainView, GovernanceView, UtxoView};
use crate::constants::{
    MAX_INV_BATCH, RANK_LOOKBACK, SCHEDULE_LOOKAHEAD, SIGNATURES_REQUIRED, SIGNATURES_TOTAL,
    VOTE_FUTURE_WINDOW, VOTE_LEAD_BLOCKS,
};
use crate::error::{MasternodeError, Result};
use crate::net::NetQueue;
use crate::ranker;
use crate::registry::Registry;
use crate::signing;
use crate::sync::{storage_limit, SyncCoordinator};

/// Persisted form of the election state.
#[derive(Serialize, Deserialize)]
pub struct ElectionDump {
    pub votes: HashMap<Hash, MasternodePaymentVote>,
    pub blocks: BTreeMap<u64, BlockPayees>,
    pub last_votes: HashMap<OutPoint, u64>,
}

/// Runs the election per block height.
///
/// Lock order within the component: `blocks` before `votes`, always, when
/// both are taken.
pub struct PaymentElection {
    params: MasternodeParams,
    net: NetQueue,
    blocks: Mutex<BTreeMap<u64, BlockPayees>>,
    votes: Mutex<HashMap<Hash, MasternodePaymentVote>>,
    last_votes: Mutex<HashMap<OutPoint, u64>>,
    did_not_vote: Mutex<HashMap<OutPoint, u64>>,
    cached_height: AtomicU64,
}

/// Payment enforcement is active only well past the last checkpoint.
pub fn enforce_masternode_payments(
    height: u64,
    chain: &dyn ChainView,
    params: &MasternodeParams,
) -> bool {
    match chain.last_checkpoint_height() {
        Some(checkpoint) => height > checkpoint + params.payments_update_threshold,
        None => false,
    }
}

impl PaymentElection {
    pub fn new(params: MasternodeParams, net: NetQueue) -> Self {
        PaymentElection {
            params,
            net,
            blocks: Mutex::new(BTreeMap::new()),
            votes: Mutex::new(HashMap::new()),
            last_votes: Mutex::new(HashMap::new()),
            did_not_vote: Mutex::new(HashMap::new()),
            cached_height: AtomicU64::new(0),
        }
    }

    pub fn cached_height(&self) -> u64 {
        self.cached_height.load(Ordering::Relaxed)
    }

    pub fn set_cached_height(&self, height: u64) {
        self.cached_height.store(height, Ordering::Relaxed);
    }

    pub fn vote_count(&self) -> usize {
        self.votes.lock().unwrap().len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn has_block(&self, height: u64) -> bool {
        self.blocks.lock().unwrap().contains_key(&height)
    }

    pub fn block_payees(&self, height: u64) -> Option<BlockPayees> {
        self.blocks.lock().unwrap().get(&height).cloned()
    }

    /// Enough stored data to consider the winners list complete.
    pub fn is_enough_data(&self, masternode_count: usize) -> bool {
        let average_votes = (SIGNATURES_TOTAL + SIGNATURES_REQUIRED) / 2;
        let limit = storage_limit(&self.params, masternode_count) as usize;
        self.block_count() > limit && self.vote_count() > limit * average_votes
    }

    fn has_verified_vote(&self, hash: &Hash) -> bool {
        self.votes
            .lock()
            .unwrap()
            .get(hash)
            .map(|v| v.verified)
            .unwrap_or(false)
    }

    /// One authoritative vote per (voter, height); a strictly higher height
    /// from the same voter supersedes, anything else is dropped.
    fn update_last_vote(&self, vote: &MasternodePaymentVote) -> bool {
        let mut last = self.last_votes.lock().unwrap();
        match last.get_mut(&vote.voter_outpoint) {
            Some(previous) => {
                if vote.block_height <= *previous {
                    return false;
                }
                *previous = vote.block_height;
                true
            }
            None => {
                last.insert(vote.voter_outpoint.clone(), vote.block_height);
                true
            }
        }
    }

    /// Stores a vote and indexes it into the per-height tally. The vote
    /// must anchor on a known ranking block.
    fn add_or_update_vote(&self, vote: &MasternodePaymentVote, chain: &dyn ChainView) -> bool {
        let anchor = match ranker::ranking_height(vote.block_height) {
            Some(height) => height,
            None => return false,
        };
        if chain.block_hash(anchor).is_none() {
            return false;
        }

        let hash = vote.hash();
        if self.has_verified_vote(&hash) {
            return false;
        }

        let mut blocks = self.blocks.lock().unwrap();
        let mut votes = self.votes.lock().unwrap();
        let mut stored = vote.clone();
        stored.verified = true;
        votes.insert(hash, stored);
        blocks
            .entry(vote.block_height)
            .or_insert_with(|| BlockPayees::new(vote.block_height))
            .add_vote(vote);
        debug!("election -- vote added, hash={}", hex::encode(hash));
        true
    }

    /// Full ingestion pipeline for an inbound payment vote.
    pub fn process_vote(
        &self,
        from: Option<SocketAddr>,
        vote: MasternodePaymentVote,
        local_is_masternode: bool,
        registry: &Registry,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) -> Result<bool> {
        if !sync.is_list_synced() {
            return Err(MasternodeError::NotSynced);
        }
        let tip = self.cached_height();
        let now = chain.adjusted_time();
        let hash = vote.hash();

        {
            let mut votes = self.votes.lock().unwrap();
            if let Some(existing) = votes.get(&hash) {
                if existing.verified {
                    return Err(MasternodeError::Duplicate);
                }
            }
            // First sighting is stored unverified; the checks below decide.
            let mut stored = vote.clone();
            stored.verified = false;
            votes.insert(hash, stored);
        }

        let limit = storage_limit(&self.params, registry.size());
        if vote.block_height + limit < tip || vote.block_height > tip + VOTE_FUTURE_WINDOW {
            debug!(
                "election -- vote out of range: height={} tip={} limit={}",
                vote.block_height, tip, limit
            );
            return Err(MasternodeError::OutOfRange(format!(
                "vote height {}",
                vote.block_height
            )));
        }

        let voter = match registry.get_info(&vote.voter_outpoint) {
            Some(info) => info,
            None => {
                if let Some(peer) = from {
                    sync.ask_for_mn(peer, &vote.voter_outpoint, now);
                }
                return Err(MasternodeError::UnknownMasternode(vote.voter_outpoint.clone()));
            }
        };
        if voter.protocol_version < self.params.min_protocol_version {
            return Err(MasternodeError::InvalidData(format!(
                "voter protocol {} too old",
                voter.protocol_version
            )));
        }

        // Masternodes verify every vote (they must pick future winners);
        // regular nodes only verify votes for future blocks.
        if local_is_masternode || vote.block_height >= tip {
            let anchor = ranker::ranking_height(vote.block_height)
                .ok_or(MasternodeError::UnknownBlock(0))?;
            let rank = self
                .voter_rank(&vote.voter_outpoint, anchor, registry, chain, sync)?
                .ok_or_else(|| {
                    MasternodeError::UnknownMasternode(vote.voter_outpoint.clone())
                })?;
            if rank > SIGNATURES_TOTAL {
                // Common for masternodes that mistakenly think they are in
                // the top list; only punish clearly bogus future votes.
                if rank > SIGNATURES_TOTAL * 2 && vote.block_height > tip {
                    if let Some(peer) = from {
                        error!(
                            "election -- voter {} is not in the top {} (rank {})",
                            vote.voter_outpoint,
                            SIGNATURES_TOTAL * 2,
                            rank
                        );
                        self.net.push(NetEvent::Misbehave(peer, 20));
                    }
                }
                return Err(MasternodeError::OutOfRange(format!(
                    "voter rank {} above {}",
                    rank, SIGNATURES_TOTAL
                )));
            }
        }

        let chain_tip = chain.tip_height();
        let sig_ok = signing::verify_dual(
            &voter.operator_pubkey,
            chain_tip,
            &vote.signature_hash(),
            &vote.legacy_message(),
            &vote.signature,
            &self.params,
        );
        if !sig_ok {
            // A future-block vote from a synced peer is a protocol
            // violation; an old one may just predate a key rotation.
            if sync.is_list_synced() && vote.block_height > tip {
                if let Some(peer) = from {
                    self.net.push(NetEvent::Misbehave(peer, 20));
                }
            }
            if let Some(peer) = from {
                sync.ask_for_mn(peer, &vote.voter_outpoint, now);
            }
            return Err(MasternodeError::InvalidSignature(format!(
                "payment vote by {}",
                vote.voter_outpoint
            )));
        }

        if !self.update_last_vote(&vote) {
            debug!(
                "election -- masternode {} already voted for height {}",
                vote.voter_outpoint, vote.block_height
            );
            return Err(MasternodeError::Duplicate);
        }

        if self.add_or_update_vote(&vote, chain) {
            self.net
                .push(NetEvent::Relay(MasternodeMessage::PaymentVotePrimary(vote)));
            sync.bump("election vote", now);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn voter_rank(
        &self,
        outpoint: &OutPoint,
        anchor_height: u64,
        registry: &Registry,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) -> Result<Option<usize>> {
        registry.rank_of(outpoint, anchor_height, self.params.min_protocol_version, chain, sync)
    }

    /// Winner for a height with recorded votes: most votes, ties broken by
    /// longest-unpaid then earliest activation.
    pub fn get_best_payee(
        &self,
        height: u64,
        registry: &Registry,
        utxo: &dyn UtxoView,
    ) -> Result<(Script, u64)> {
        let payees = self
            .block_payees(height)
            .ok_or_else(|| MasternodeError::InvalidData(format!("no votes for height {}", height)))?;
        if payees.payees.is_empty() {
            return Err(MasternodeError::InvalidData(format!(
                "no payees for height {}",
                height
            )));
        }

        // Registry info is snapshotted first; the tally lock is never held
        // while the registry lock is taken.
        let by_script: HashMap<Script, (i64, u64, OutPoint)> = registry
            .snapshot()
            .into_iter()
            .map(|mn| {
                (
                    mn.payee_script(),
                    (mn.last_paid_primary_time, mn.activation_height, mn.outpoint),
                )
            })
            .collect();

        let mut best: Option<(usize, i64, u64, Script)> = None;
        for payee in &payees.payees {
            let votes = payee.vote_count();
            let (last_paid, mut activation) = match by_script.get(&payee.script) {
                Some((last_paid, activation, outpoint)) => {
                    let mut height_resolved = *activation;
                    if height_resolved == 0 {
                        height_resolved =
                            utxo.get_utxo(outpoint).map(|u| u.height).unwrap_or(0);
                    }
                    (*last_paid, height_resolved)
                }
                None => (0, 0),
            };
            if activation == 0 {
                activation = u64::MAX;
            }

            let better = match &best {
                None => true,
                Some((best_votes, best_last_paid, best_activation, _)) => {
                    votes > *best_votes
                        || (votes == *best_votes && last_paid < *best_last_paid)
                        || (votes == *best_votes
                            && last_paid == *best_last_paid
                            && activation < *best_activation)
                }
            };
            if better {
                best = Some((votes, last_paid, activation, payee.script.clone()));
            }
        }

        let (_, _, activation, script) = best.expect("non-empty payee list always yields a winner");
        let activation = if activation == u64::MAX { 0 } else { activation };
        Ok((script, activation))
    }

    /// Whether this masternode's payee script already won a recent height;
    /// looks ahead up to eight blocks so vote propagation can settle.
    pub fn is_scheduled(
        &self,
        info: &MasternodeInfo,
        not_height: u64,
        registry: &Registry,
        utxo: &dyn UtxoView,
        sync: &SyncCoordinator,
    ) -> bool {
        if !sync.is_list_synced() {
            return false;
        }
        let payee = info.payee_script();
        let tip = self.cached_height();
        for height in tip..=tip + SCHEDULE_LOOKAHEAD {
            if height == not_height {
                continue;
            }
            if let Ok((script, _)) = self.get_best_payee(height, registry, utxo) {
                if script == payee {
                    return true;
                }
            }
        }
        false
    }

    /// Deterministically selects the primary payee for a future height plus
    /// up to `secondaries_max_count` secondaries, from the oldest-paid
    /// tenth of the eligible network.
    pub fn choose_next_payee(
        &self,
        height: u64,
        filter_sig_time: bool,
        registry: &Registry,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
        sync: &SyncCoordinator,
    ) -> Result<(MasternodeInfo, Vec<MasternodeInfo>, usize)> {
        if !sync.is_winners_synced() {
            // Without the winners list we can't reliably find the next
            // winner anyway.
            return Err(MasternodeError::NotSynced);
        }

        let now = chain.adjusted_time();
        let tip = chain.tip_height();
        let mn_count = registry.count(self.params.min_protocol_version);
        let snapshot = registry.snapshot();

        let mut primaries: Vec<&Masternode> = Vec::new();
        for mn in &snapshot {
            if !mn.is_valid_for_payment() {
                continue;
            }
            if mn.protocol_version < self.params.min_protocol_version {
                continue;
            }
            if self.is_scheduled(&mn.info(), height, registry, utxo, sync) {
                continue;
            }
            // Too new; wait a full cycle.
            if filter_sig_time && mn.sig_time + (mn_count as i64) * 60 > now {
                continue;
            }
            if utxo.confirmations(&mn.outpoint, tip) < mn_count as u64 {
                continue;
            }
            if mn.activation_height == 0 || mn.activation_height > height {
                continue;
            }
            primaries.push(mn);
        }

        let secondary_gate = (mn_count as i64 / self.params.secondaries_max_count.max(1) as i64) * 60;
        let mut secondaries_pool: Vec<&Masternode> = Vec::new();
        for mn in &snapshot {
            if !mn.is_valid_for_payment() {
                continue;
            }
            if mn.protocol_version < self.params.min_protocol_version {
                continue;
            }
            if filter_sig_time && mn.sig_time + secondary_gate > now {
                continue;
            }
            if utxo.confirmations(&mn.outpoint, tip) < mn_count as u64 {
                continue;
            }
            secondaries_pool.push(mn);
        }

        let eligible = primaries.len();
        // While the network upgrades, don't penalize recently restarted
        // nodes: retry once without the signing-time gate.
        if filter_sig_time && eligible < mn_count / 3 {
            debug!("election -- deferring to unfiltered candidate list");
            return self.choose_next_payee(height, false, registry, chain, utxo, sync);
        }

        primaries.sort_by(|a, b| {
            a.last_paid_primary_height
                .cmp(&b.last_paid_primary_height)
                .then(a.activation_height.cmp(&b.activation_height))
                .then(a.outpoint.cmp(&b.outpoint))
        });
        secondaries_pool.sort_by(|a, b| {
            a.last_paid_secondary_height
                .cmp(&b.last_paid_secondary_height)
                .then(a.activation_height.cmp(&b.activation_height))
                .then(a.outpoint.cmp(&b.outpoint))
        });

        let anchor = ranker::ranking_height(height)
            .ok_or(MasternodeError::UnknownBlock(0))?;
        let block_hash = chain
            .block_hash(anchor)
            .ok_or(MasternodeError::UnknownBlock(anchor))?;

        // Score only the oldest tenth of the network and pay the best.
        let tenth = (mn_count / 10).max(1);
        let mut best: Option<&Masternode> = None;
        let mut highest = U256::zero();
        for &mn in primaries.iter().take(tenth) {
            let score = ranker::score(&mn.operator_pubkey, &block_hash);
            if score > highest {
                highest = score;
                best = Some(mn);
            }
        }
        let best = best.ok_or_else(|| {
            MasternodeError::InvalidData("no eligible masternode to pay".into())
        })?;

        let max_secondaries = self.params.secondaries_max_count as usize;
        let sample = if secondaries_pool.is_empty() {
            0
        } else {
            max_secondaries.min(secondaries_pool.len() - 1)
        };
        let mut secondaries = Vec::new();
        for mn in secondaries_pool.iter().take(sample + 1) {
            if mn.outpoint != best.outpoint {
                secondaries.push(mn.info());
            }
            if secondaries.len() == sample {
                break;
            }
        }

        Ok((best.info(), secondaries, eligible))
    }

    /// Produces, signs and gossips our own vote for a future height, when
    /// this node is a top-ranked masternode.
    pub fn produce_vote(
        &self,
        height: u64,
        active: Option<&ActiveMasternode>,
        registry: &Registry,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
        sync: &SyncCoordinator,
    ) -> Result<bool> {
        let active = match active {
            Some(active) => active,
            None => return Ok(false),
        };
        if chain.is_lite_mode() {
            return Ok(false);
        }
        if !sync.is_list_synced() {
            return Err(MasternodeError::NotSynced);
        }

        let anchor = ranker::ranking_height(height)
            .ok_or(MasternodeError::UnknownBlock(0))?;
        let rank = match self.voter_rank(&active.outpoint, anchor, registry, chain, sync)? {
            Some(rank) => rank,
            None => {
                warn!("election -- own masternode unknown, not voting");
                return Ok(false);
            }
        };
        if rank > SIGNATURES_TOTAL {
            debug!(
                "election -- not in the top {} (rank {}), not voting",
                SIGNATURES_TOTAL, rank
            );
            return Ok(false);
        }

        info!(
            "election -- voting for height {} as masternode {}",
            height, active.outpoint
        );
        let (winner, _, _) =
            self.choose_next_payee(height, true, registry, chain, utxo, sync)?;
        let payee = winner.payee_script();
        info!(
            "election -- vote: payee of {} for height {}",
            winner.outpoint, height
        );

        let mut vote = MasternodePaymentVote::new(active.outpoint.clone(), height, payee);
        vote.signature = signing::sign_dual(
            &active.operator_keys,
            chain.tip_height(),
            &vote.signature_hash(),
            &vote.legacy_message(),
            &self.params,
        );

        if self.add_or_update_vote(&vote, chain) {
            self.net
                .push(NetEvent::Relay(MasternodeMessage::PaymentVotePrimary(vote)));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Checks a coinbase against the tally for `height`. With no tally or
    /// no payee reaching the required vote count, any coinbase passes.
    pub fn is_transaction_valid(&self, outputs: &[TxOutput], height: u64) -> bool {
        let payees = match self.block_payees(height) {
            Some(payees) => payees,
            None => return true,
        };

        let max_amount = self.params.primary_payment_max();
        let min_amount = self.params.secondaries_min_amount;

        if payees.max_vote_count() < SIGNATURES_REQUIRED {
            return true;
        }

        let mut possible = Vec::new();
        for payee in &payees.payees {
            if payee.vote_count() < SIGNATURES_REQUIRED {
                continue;
            }
            for output in outputs {
                if output.script_pubkey == payee.script
                    && output.value >= min_amount
                    && output.value <= max_amount
                {
                    debug!("election -- found required payment at height {}", height);
                    return true;
                }
            }
            possible.push(hex::encode(&payee.script));
        }

        error!(
            "election -- missing required payment at height {}, possible payees: {}",
            height,
            possible.join(",")
        );
        false
    }

    /// Bounds the total coinbase value. Unsynced and lite nodes check only
    /// the governance ceiling on governance heights; this early-return is
    /// consensus-relevant and deliberately mirrors the payee check's
    /// unsynced behavior.
    pub fn is_block_value_valid(
        &self,
        outputs: &[TxOutput],
        height: u64,
        block_reward: u64,
        chain: &dyn ChainView,
        gov: &dyn GovernanceView,
        sync: &SyncCoordinator,
    ) -> std::result::Result<(), String> {
        let total: u64 = outputs.iter().map(|o| o.value).sum();
        let reward_met = total <= block_reward;
        let governance_max = block_reward + gov.payments_limit(height);
        let governance_met = total <= governance_max;

        if !sync.is_synced() || chain.is_lite_mode() {
            // Not enough data; at minimum the governance ceiling holds.
            if gov.is_governance_block_height(height) {
                warn!("election -- not enough data, checking governance max bounds only");
                if !governance_met {
                    return Err(format!(
                        "coinbase pays too much at height {} (actual={} vs limit={}), exceeded governance max value",
                        height, total, governance_max
                    ));
                }
                return Ok(());
            }
            if !reward_met {
                return Err(format!(
                    "coinbase pays too much at height {} (actual={} vs limit={}), only regular blocks allowed",
                    height, total, block_reward
                ));
            }
            return Ok(());
        }

        if gov.is_governance_block_triggered(height) {
            if gov.is_valid_governance_block(outputs, height, block_reward) {
                return Ok(());
            }
            error!("election -- invalid governance block at height {}", height);
            return Err(format!("invalid governance block detected at height {}", height));
        }

        if !reward_met {
            return Err(format!(
                "coinbase pays too much at height {} (actual={} vs limit={}), no triggered governance block",
                height, total, block_reward
            ));
        }
        Ok(())
    }

    /// Whether the coinbase pays an acceptable payee for `height`.
    pub fn is_block_payee_valid(
        &self,
        outputs: &[TxOutput],
        height: u64,
        block_reward: u64,
        chain: &dyn ChainView,
        gov: &dyn GovernanceView,
        sync: &SyncCoordinator,
    ) -> bool {
        if !sync.is_synced() || chain.is_lite_mode() {
            // No vote data to check against; accept the longest chain.
            warn!("election -- not enough data, skipping block payee checks");
            return true;
        }

        if gov.is_governance_block_triggered(height) {
            return gov.is_valid_governance_block(outputs, height, block_reward);
        }

        if self.is_transaction_valid(outputs, height) {
            debug!("election -- valid masternode payment at height {}", height);
            return true;
        }

        if enforce_masternode_payments(height, chain, &self.params) {
            return false;
        }
        warn!("election -- payment enforcement inactive, accepting any payee");
        true
    }

    /// Builds the masternode outputs for a coinbase: the primary payment
    /// followed by an equal split of the secondary budget, remainder on the
    /// first secondary. Falls back to the local election when no tally
    /// exists for the height.
    pub fn fill_block_payees(
        &self,
        height: u64,
        registry: &Registry,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
        sync: &SyncCoordinator,
    ) -> Vec<TxOutput> {
        let mut chosen_secondaries: Vec<MasternodeInfo> = Vec::new();

        let (payee, mut activation) = match self.get_best_payee(height, registry, utxo) {
            Ok(result) => result,
            Err(_) => {
                // No winning tally; fill with the locally calculated winner
                // and hope for the best.
                match self.choose_next_payee(height, true, registry, chain, utxo, sync) {
                    Ok((winner, secondaries, _)) => {
                        chosen_secondaries = secondaries;
                        (winner.payee_script(), winner.activation_height)
                    }
                    Err(err) => {
                        error!("election -- failed to detect masternode to pay: {}", err);
                        return Vec::new();
                    }
                }
            }
        };
        if activation == 0 {
            activation = registry.node_activation_height(&payee, utxo);
        }

        let primary_amount = self.params.primary_payment_max();
        let mut secondary_total = self
            .params
            .block_reward_masternode
            .saturating_sub(primary_amount);

        let mut outputs = vec![TxOutput { value: primary_amount, script_pubkey: payee.clone() }];
        info!(
            "election -- masternode payment {} to {} (activation height {})",
            primary_amount,
            hex::encode(&payee),
            activation
        );

        if chosen_secondaries.is_empty() {
            if let Ok((_, secondaries, _)) =
                self.choose_next_payee(height, true, registry, chain, utxo, sync)
            {
                chosen_secondaries = secondaries;
            }
        }
        if chosen_secondaries.is_empty() {
            error!("election -- failed to detect secondary masternodes to pay");
            return outputs;
        }

        let count = chosen_secondaries.len() as u64;
        let change = secondary_total % count;
        secondary_total -= change;
        let per_secondary = secondary_total / count;
        for (index, info) in chosen_secondaries.iter().enumerate() {
            let mut amount = per_secondary;
            if index == 0 {
                amount += change;
            }
            outputs.push(TxOutput { value: amount, script_pubkey: info.payee_script() });
        }
        debug!(
            "election -- found {} secondary masternodes to pay",
            chosen_secondaries.len()
        );
        outputs
    }

    /// Notes which of the expected top voters never voted for `height`.
    pub fn check_block_votes(
        &self,
        height: u64,
        registry: &Registry,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) {
        if !sync.is_winners_synced() {
            return;
        }
        let anchor = match ranker::ranking_height(height) {
            Some(anchor) => anchor,
            None => return,
        };
        let ranked = match registry.ranks(anchor, self.params.min_protocol_version, chain, sync) {
            Ok(ranked) => ranked,
            Err(err) => {
                debug!("election -- check_block_votes skipped: {}", err);
                return;
            }
        };

        let voters: Vec<OutPoint> = {
            let blocks = self.blocks.lock().unwrap();
            let votes = self.votes.lock().unwrap();
            blocks
                .get(&height)
                .map(|payees| {
                    payees
                        .payees
                        .iter()
                        .flat_map(|p| p.vote_hashes.iter())
                        .filter_map(|hash| votes.get(hash))
                        .map(|vote| vote.voter_outpoint.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut missing = 0;
        {
            let mut did_not_vote = self.did_not_vote.lock().unwrap();
            for (rank, mn) in ranked.iter().take(SIGNATURES_TOTAL) {
                if !voters.contains(&mn.outpoint) {
                    *did_not_vote.entry(mn.outpoint.clone()).or_insert(0) += 1;
                    missing += 1;
                    debug!(
                        "election -- expected voter {} (rank {}) has not voted for {}",
                        mn.outpoint, rank, height
                    );
                }
            }
        }
        if missing > 0 {
            debug!(
                "election -- {} expected voters missing for height {}",
                missing, height
            );
        }
    }

    /// Serves verified future votes to a syncing peer, then paces it.
    pub fn sync_payment_votes(&self, peer: SocketAddr, sync: &SyncCoordinator) {
        if !sync.is_winners_synced() {
            return;
        }
        let tip = self.cached_height();
        let invs: Vec<Inv> = {
            let blocks = self.blocks.lock().unwrap();
            let votes = self.votes.lock().unwrap();
            (tip..tip + VOTE_FUTURE_WINDOW)
                .filter_map(|height| blocks.get(&height))
                .flat_map(|payees| payees.payees.iter())
                .flat_map(|payee| payee.vote_hashes.iter())
                .filter(|hash| votes.get(*hash).map(|v| v.verified).unwrap_or(false))
                .map(|hash| Inv::new(InvKind::PaymentVotePrimary, *hash))
                .collect()
        };
        let count = invs.len() as u32;
        if count > 0 {
            self.net.push(NetEvent::Send(peer, MasternodeMessage::Inv(invs)));
        }
        self.net.push(NetEvent::Send(
            peer,
            MasternodeMessage::SyncStatusCount { asset: SyncAsset::WinnersList, count },
        ));
        info!("election -- sent {} votes to peer {}", count, peer);
    }

    /// Requests payment blocks we have no or weak data for, in batches.
    pub fn request_low_data_payment_blocks(
        &self,
        peer: SocketAddr,
        masternode_count: usize,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) {
        if !sync.is_list_synced() {
            return;
        }
        let limit = storage_limit(&self.params, masternode_count);
        let tip = chain.tip_height();
        let average_votes = (SIGNATURES_TOTAL + SIGNATURES_REQUIRED) / 2;

        let mut to_fetch: Vec<Inv> = Vec::new();
        {
            let blocks = self.blocks.lock().unwrap();
            for back in 0..limit {
                let height = match tip.checked_sub(back) {
                    Some(height) => height,
                    None => break,
                };
                if blocks.contains_key(&height) {
                    continue;
                }
                // We have no idea about this block, ask for it.
                if let Some(hash) = chain.block_hash(height) {
                    to_fetch.push(Inv::new(InvKind::PaymentBlockPrimary, hash));
                }
            }
            for (height, payees) in blocks.iter() {
                let mut found = false;
                let mut total_votes = 0;
                for payee in &payees.payees {
                    if payee.vote_count() >= SIGNATURES_REQUIRED {
                        found = true;
                        break;
                    }
                    total_votes += payee.vote_count();
                }
                if found || total_votes >= average_votes {
                    continue;
                }
                if let Some(hash) = chain.block_hash(*height) {
                    to_fetch.push(Inv::new(InvKind::PaymentBlockPrimary, hash));
                }
            }
        }

        for batch in to_fetch.chunks(MAX_INV_BATCH) {
            info!(
                "election -- asking peer {} for {} payment blocks",
                peer,
                batch.len()
            );
            self.net
                .push(NetEvent::Send(peer, MasternodeMessage::GetData(batch.to_vec())));
        }
    }

    /// Serves getdata for vote and payment-block inventory.
    pub fn serve_get_data(&self, peer: SocketAddr, invs: &[Inv], chain: &dyn ChainView) {
        let mut responses = Vec::new();
        {
            let blocks = self.blocks.lock().unwrap();
            let votes = self.votes.lock().unwrap();
            for inv in invs {
                match inv.kind {
                    InvKind::PaymentVotePrimary => {
                        if let Some(vote) = votes.get(&inv.hash) {
                            responses.push(MasternodeMessage::PaymentVotePrimary(vote.clone()));
                        }
                    }
                    InvKind::PaymentBlockPrimary => {
                        let height = match chain.height_of(&inv.hash) {
                            Some(height) => height,
                            None => continue,
                        };
                        if let Some(payees) = blocks.get(&height) {
                            for payee in &payees.payees {
                                for hash in &payee.vote_hashes {
                                    if let Some(vote) = votes.get(hash) {
                                        responses
                                            .push(MasternodeMessage::PaymentVotePrimary(vote.clone()));
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        for message in responses {
            self.net.push(NetEvent::Send(peer, message));
        }
    }

    pub fn has_inv(&self, inv: &Inv) -> bool {
        match inv.kind {
            InvKind::PaymentVotePrimary => self.votes.lock().unwrap().contains_key(&inv.hash),
            _ => false,
        }
    }

    /// Evicts votes older than the storage window.
    pub fn check_and_remove(&self, masternode_count: usize, sync: &SyncCoordinator) {
        if !sync.is_blockchain_synced() {
            return;
        }
        let tip = self.cached_height();
        let limit = storage_limit(&self.params, masternode_count);

        let mut blocks = self.blocks.lock().unwrap();
        let mut votes = self.votes.lock().unwrap();
        let before = votes.len();
        votes.retain(|_, vote| {
            vote.block_height > tip || tip - vote.block_height <= limit
        });
        blocks.retain(|height, _| *height > tip || tip - *height <= limit);
        if before != votes.len() {
            info!(
                "election -- removed {} old payment votes, {} blocks tracked",
                before - votes.len(),
                blocks.len()
            );
        }
    }

    /// Per-tip pipeline: account for missing votes on the block about to be
    /// decided and cast our own vote ten blocks out.
    pub fn updated_block_tip(
        &self,
        height: u64,
        active: Option<&ActiveMasternode>,
        registry: &Registry,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
        sync: &SyncCoordinator,
    ) {
        self.set_cached_height(height);
        debug!("election -- cached height {}", height);

        let future = height + VOTE_LEAD_BLOCKS;
        self.check_block_votes(future - 1, registry, chain, sync);
        if let Err(err) = self.produce_vote(future, active, registry, chain, utxo, sync) {
            debug!("election -- no vote produced for {}: {}", future, err);
        }
    }

    pub fn dump(&self) -> ElectionDump {
        let blocks = self.blocks.lock().unwrap();
        let votes = self.votes.lock().unwrap();
        let last_votes = self.last_votes.lock().unwrap();
        ElectionDump {
            votes: votes.clone(),
            blocks: blocks.clone(),
            last_votes: last_votes.clone(),
        }
    }

    pub fn restore(&self, dump: ElectionDump) {
        let mut blocks = self.blocks.lock().unwrap();
        let mut votes = self.votes.lock().unwrap();
        let mut last_votes = self.last_votes.lock().unwrap();
        *blocks = dump.blocks;
        *votes = dump.votes;
        *last_votes = dump.last_votes;
        info!(
            "election -- restored {} votes across {} blocks",
            votes.len(),
            blocks.len()
        );
    }
}
