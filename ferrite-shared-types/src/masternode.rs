//! Masternode data model: registry entries, gossip records and the
//! consensus parameters that govern them.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{payee_script, script_asm, Hash, OutPoint, PublicKeyBytes, Script, SignatureBytes, COIN};

/// Consensus-level masternode parameters. Defaults are mainnet values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasternodeParams {
    /// Required collateral amount, in base units.
    pub collateral_amount: u64,
    /// Confirmations the collateral UTXO needs before a broadcast is accepted.
    pub min_confirmations: u64,
    /// Per-entry liveness classification runs at most this often.
    pub check_seconds: i64,
    /// Minimum interval between pings from one masternode.
    pub min_ping_seconds: i64,
    /// A masternode that has not pinged within this window is expired.
    pub expiration_seconds: i64,
    /// Past this window the masternode needs a fresh announce to recover.
    pub new_start_required_seconds: i64,
    /// Maximum age of a sentinel-current flag before the entry degrades.
    pub sentinel_ping_max_seconds: i64,
    /// Ban score ceiling; reaching it puts the entry into `PoseBan`.
    pub pose_ban_max_score: i32,
    /// Protocol floor for payment eligibility and broadcast acceptance.
    pub min_protocol_version: u32,
    /// Above this chain height signatures are made over serialization
    /// hashes; at or below it the legacy string format is used.
    pub sign_hash_threshold: u64,
    /// Maximum number of secondary payees per block.
    pub secondaries_max_count: u64,
    /// Minimum amount any single masternode payment may carry, in base units.
    pub secondaries_min_amount: u64,
    /// Total masternode share of the block reward, in base units.
    pub block_reward_masternode: u64,
    /// Payment enforcement starts this many blocks past the last checkpoint.
    pub payments_update_threshold: u64,
    /// Vote retention is `max(masternode_count * storage_coeff, min_blocks_to_store)`.
    pub storage_coeff: f64,
    pub min_blocks_to_store: u64,
    /// Local daemon version, compared against versions advertised in pings.
    pub client_version: u32,
    /// Protocol version this node advertises.
    pub protocol_version: u32,
}

impl Default for MasternodeParams {
    fn default() -> Self {
        Self {
            collateral_amount: 10_000 * COIN,
            min_confirmations: 15,
            check_seconds: 5,
            min_ping_seconds: 600,
            expiration_seconds: 3_900,
            new_start_required_seconds: 10_800,
            sentinel_ping_max_seconds: 3_600,
            pose_ban_max_score: 5,
            min_protocol_version: 70_020,
            sign_hash_threshold: 150_000,
            secondaries_max_count: 20,
            secondaries_min_amount: COIN / 4,
            block_reward_masternode: 20 * COIN,
            payments_update_threshold: 100,
            storage_coeff: 1.25,
            min_blocks_to_store: 5_000,
            client_version: 4_000_000,
            protocol_version: 70_021,
        }
    }
}

impl MasternodeParams {
    /// Largest amount the primary payee may receive: the masternode share
    /// minus the minimum owed to a full set of secondaries.
    pub fn primary_payment_max(&self) -> u64 {
        self.block_reward_masternode
            .saturating_sub(self.secondaries_min_amount * self.secondaries_max_count)
    }
}

/// Liveness state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasternodeState {
    PreEnabled,
    Enabled,
    Expired,
    OutpointSpent,
    NewStartRequired,
    PoseBan,
    SentinelPingExpired,
}

impl MasternodeState {
    /// States a recovery reply may legitimately report for an entry that is
    /// about to be restarted without a fresh announce.
    pub fn valid_for_auto_start(self) -> bool {
        matches!(
            self,
            MasternodeState::Enabled
                | MasternodeState::PreEnabled
                | MasternodeState::Expired
                | MasternodeState::SentinelPingExpired
        )
    }
}

impl std::fmt::Display for MasternodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MasternodeState::PreEnabled => "PRE_ENABLED",
            MasternodeState::Enabled => "ENABLED",
            MasternodeState::Expired => "EXPIRED",
            MasternodeState::OutpointSpent => "OUTPOINT_SPENT",
            MasternodeState::NewStartRequired => "NEW_START_REQUIRED",
            MasternodeState::PoseBan => "POSE_BAN",
            MasternodeState::SentinelPingExpired => "SENTINEL_PING_EXPIRED",
        };
        f.write_str(s)
    }
}

/// Periodic liveness proof signed by the operator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasternodePing {
    pub outpoint: OutPoint,
    /// A recent block hash, anchoring the ping to the signer's chain view.
    pub block_hash: Hash,
    pub sig_time: i64,
    pub daemon_version: u32,
    pub sentinel_current: bool,
    pub signature: SignatureBytes,
}

impl MasternodePing {
    /// Content hash; keyed on the outpoint and signing time only, so a
    /// re-relayed ping deduplicates regardless of transport framing.
    pub fn hash(&self) -> Hash {
        content_hash(&(&self.outpoint, self.sig_time))
    }

    pub fn signature_hash(&self) -> Hash {
        content_hash(&(&self.outpoint, &self.block_hash, self.sig_time))
    }

    pub fn legacy_message(&self) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.outpoint.to_short_string(),
            hex::encode(self.block_hash),
            self.sig_time
        )
        .into_bytes()
    }

    /// Whether the ping is too old to matter at all.
    pub fn is_expired(&self, now: i64, params: &MasternodeParams) -> bool {
        now - self.sig_time > params.new_start_required_seconds
    }
}

/// Self-signed registration/refresh record for a masternode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasternodeBroadcast {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub collateral_pubkey: PublicKeyBytes,
    pub operator_pubkey: PublicKeyBytes,
    pub protocol_version: u32,
    pub sig_time: i64,
    pub last_ping: Option<MasternodePing>,
    pub signature: SignatureBytes,
    /// Set locally when the broadcast is a quorum-approved recovery reply;
    /// never serialized onto the wire.
    #[serde(skip)]
    pub recovery: bool,
}

/// Content hash of a broadcast, computable from a registry entry as well.
pub fn broadcast_hash(outpoint: &OutPoint, collateral_pubkey: &PublicKeyBytes, sig_time: i64) -> Hash {
    content_hash(&(outpoint, collateral_pubkey, sig_time))
}

impl MasternodeBroadcast {
    /// Content hash; keyed on outpoint, collateral key and signing time.
    pub fn hash(&self) -> Hash {
        broadcast_hash(&self.outpoint, &self.collateral_pubkey, self.sig_time)
    }

    pub fn signature_hash(&self) -> Hash {
        content_hash(&(
            self.addr.to_string(),
            self.sig_time,
            &self.collateral_pubkey,
            &self.operator_pubkey,
            self.protocol_version,
        ))
    }

    pub fn legacy_message(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            hex::encode(self.collateral_pubkey),
            hex::encode(self.operator_pubkey),
            self.protocol_version
        )
        .into_bytes()
    }

    /// Builds the registry entry announced by this broadcast.
    pub fn into_masternode(&self) -> Masternode {
        Masternode {
            outpoint: self.outpoint.clone(),
            addr: self.addr,
            collateral_pubkey: self.collateral_pubkey,
            operator_pubkey: self.operator_pubkey,
            protocol_version: self.protocol_version,
            sig_time: self.sig_time,
            activation_height: 0,
            last_ping: self.last_ping.clone(),
            last_paid_primary_height: 0,
            last_paid_primary_time: 0,
            last_paid_secondary_height: 0,
            last_paid_secondary_time: 0,
            pose_ban_score: 0,
            state: MasternodeState::PreEnabled,
            last_check_time: 0,
            broadcast_signature: self.signature.clone(),
        }
    }
}

/// Off-chain proof that an advertised address is controlled by the claimed
/// operator key. Travels in three phase shapes: request (no signatures),
/// reply (`sig1` only) and broadcast (both signatures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasternodeVerification {
    pub addr: SocketAddr,
    pub nonce: u32,
    pub block_height: u64,
    pub sig1: SignatureBytes,
    pub sig2: SignatureBytes,
    pub outpoint1: OutPoint,
    pub outpoint2: OutPoint,
}

impl MasternodeVerification {
    pub fn request(addr: SocketAddr, nonce: u32, block_height: u64) -> Self {
        MasternodeVerification {
            addr,
            nonce,
            block_height,
            sig1: Vec::new(),
            sig2: Vec::new(),
            outpoint1: OutPoint::null(),
            outpoint2: OutPoint::null(),
        }
    }

    pub fn hash(&self) -> Hash {
        content_hash(&(self.addr.to_string(), self.nonce, self.block_height))
    }

    /// Digest bound by the verified node's operator key: "my IP is addr".
    pub fn signature_hash1(&self, block_hash: &Hash) -> Hash {
        content_hash(&(self.addr.to_string(), self.nonce, block_hash))
    }

    /// Digest countersigned by the witness, binding both outpoints.
    pub fn signature_hash2(&self, block_hash: &Hash) -> Hash {
        content_hash(&(
            self.addr.to_string(),
            self.nonce,
            block_hash,
            &self.outpoint1,
            &self.outpoint2,
        ))
    }

    pub fn legacy_message1(&self, block_hash: &Hash) -> Vec<u8> {
        format!("{}{}{}", self.addr, self.nonce, hex::encode(block_hash)).into_bytes()
    }

    pub fn legacy_message2(&self, block_hash: &Hash) -> Vec<u8> {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.nonce,
            hex::encode(block_hash),
            self.outpoint1.to_short_string(),
            self.outpoint2.to_short_string()
        )
        .into_bytes()
    }
}

/// A top-ranked masternode's vote on who the coinbase of a future block
/// must pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasternodePaymentVote {
    pub voter_outpoint: OutPoint,
    pub block_height: u64,
    pub payee: Script,
    pub signature: SignatureBytes,
    /// Set once the signature has been checked against a known operator key;
    /// unverified stored votes are re-validated before use.
    #[serde(default)]
    pub verified: bool,
}

impl MasternodePaymentVote {
    pub fn new(voter_outpoint: OutPoint, block_height: u64, payee: Script) -> Self {
        MasternodePaymentVote {
            voter_outpoint,
            block_height,
            payee,
            signature: Vec::new(),
            verified: false,
        }
    }

    /// Content hash; intentionally excludes the signature so equivalent
    /// votes deduplicate.
    pub fn hash(&self) -> Hash {
        content_hash(&(&self.payee, self.block_height, &self.voter_outpoint))
    }

    pub fn signature_hash(&self) -> Hash {
        content_hash(&(&self.voter_outpoint, self.block_height, &self.payee))
    }

    /// Legacy signing string: `outpoint_short || height_decimal || payee_asm`.
    /// The concatenation order is consensus-critical.
    pub fn legacy_message(&self) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.voter_outpoint.to_short_string(),
            self.block_height,
            script_asm(&self.payee)
        )
        .into_bytes()
    }
}

/// One payee in a per-height tally, with the votes backing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasternodePayee {
    pub script: Script,
    pub vote_hashes: Vec<Hash>,
}

impl MasternodePayee {
    pub fn new(script: Script, vote_hash: Hash) -> Self {
        MasternodePayee { script, vote_hashes: vec![vote_hash] }
    }

    pub fn vote_count(&self) -> usize {
        self.vote_hashes.len()
    }
}

/// All payees that received votes for one block height.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockPayees {
    pub height: u64,
    pub payees: Vec<MasternodePayee>,
}

impl BlockPayees {
    pub fn new(height: u64) -> Self {
        BlockPayees { height, payees: Vec::new() }
    }

    pub fn add_vote(&mut self, vote: &MasternodePaymentVote) {
        let vote_hash = vote.hash();
        for payee in &mut self.payees {
            if payee.script == vote.payee {
                if !payee.vote_hashes.contains(&vote_hash) {
                    payee.vote_hashes.push(vote_hash);
                }
                return;
            }
        }
        self.payees.push(MasternodePayee::new(vote.payee.clone(), vote_hash));
    }

    pub fn max_vote_count(&self) -> usize {
        self.payees.iter().map(|p| p.vote_count()).max().unwrap_or(0)
    }

    pub fn has_payee_with_votes(&self, script: &[u8], required: usize) -> bool {
        self.payees
            .iter()
            .any(|p| p.vote_count() >= required && p.script == script)
    }
}

/// A full registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Masternode {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    /// Authorises registration and receives payments.
    pub collateral_pubkey: PublicKeyBytes,
    /// Signs live messages: pings, verifications, payment votes.
    pub operator_pubkey: PublicKeyBytes,
    pub protocol_version: u32,
    /// Signing time of the most recent accepted broadcast.
    pub sig_time: i64,
    /// Height at which the collateral UTXO confirmed; 0 until resolved.
    pub activation_height: u64,
    pub last_ping: Option<MasternodePing>,
    pub last_paid_primary_height: u64,
    pub last_paid_primary_time: i64,
    pub last_paid_secondary_height: u64,
    pub last_paid_secondary_time: i64,
    /// Saturating in `[-pose_ban_max_score, pose_ban_max_score]`; negative
    /// values are the immunity window granted to verified entries.
    pub pose_ban_score: i32,
    pub state: MasternodeState,
    pub last_check_time: i64,
    /// Collateral-key signature of the last accepted broadcast, kept so the
    /// announce record can be reconstructed for serving and recovery.
    pub broadcast_signature: SignatureBytes,
}

impl Masternode {
    pub fn payee_script(&self) -> Script {
        payee_script(&self.collateral_pubkey)
    }

    pub fn is_enabled(&self) -> bool {
        self.state == MasternodeState::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.state == MasternodeState::PreEnabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == MasternodeState::PoseBan
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == MasternodeState::NewStartRequired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.state == MasternodeState::OutpointSpent
    }

    /// An entry is PoSe-verified once its ban score sits at the negative
    /// ceiling.
    pub fn is_pose_verified(&self, params: &MasternodeParams) -> bool {
        self.pose_ban_score <= -params.pose_ban_max_score
    }

    pub fn is_valid_for_payment(&self) -> bool {
        self.is_enabled()
    }

    pub fn increase_pose_ban_score(&mut self, params: &MasternodeParams) {
        self.pose_ban_score = (self.pose_ban_score + 1).min(params.pose_ban_max_score);
        if self.pose_ban_score >= params.pose_ban_max_score {
            self.state = MasternodeState::PoseBan;
        }
    }

    pub fn decrease_pose_ban_score(&mut self, params: &MasternodeParams) {
        self.pose_ban_score = (self.pose_ban_score - 1).max(-params.pose_ban_max_score);
    }

    pub fn pose_ban(&mut self, params: &MasternodeParams) {
        self.pose_ban_score = params.pose_ban_max_score;
        self.state = MasternodeState::PoseBan;
    }

    pub fn is_pinged_within(&self, seconds: i64, at: i64) -> bool {
        match &self.last_ping {
            Some(ping) => at - ping.sig_time < seconds,
            None => false,
        }
    }

    /// Liveness classification. Rate-limited to once per
    /// `params.check_seconds` unless forced; `outpoint_spent` is the
    /// caller's UTXO lookup result.
    pub fn check(&mut self, now: i64, outpoint_spent: bool, force: bool, params: &MasternodeParams) {
        if !force && now - self.last_check_time < params.check_seconds {
            return;
        }
        self.last_check_time = now;

        if self.is_outpoint_spent() {
            return;
        }
        if outpoint_spent {
            self.state = MasternodeState::OutpointSpent;
            return;
        }

        if self.pose_ban_score >= params.pose_ban_max_score {
            self.state = MasternodeState::PoseBan;
            return;
        }

        // A freshly announced masternode gets one ping interval of grace
        // before liveness is enforced.
        let wait_for_ping = now - self.sig_time < params.min_ping_seconds;
        if !wait_for_ping {
            if !self.is_pinged_within(params.new_start_required_seconds, now) {
                self.state = MasternodeState::NewStartRequired;
                return;
            }
            if !self.is_pinged_within(params.expiration_seconds, now) {
                self.state = MasternodeState::Expired;
                return;
            }
            if let Some(ping) = &self.last_ping {
                if !ping.sentinel_current && now - ping.sig_time > params.sentinel_ping_max_seconds {
                    self.state = MasternodeState::SentinelPingExpired;
                    return;
                }
            }
        }

        self.state = if self.last_ping.is_none() {
            MasternodeState::PreEnabled
        } else {
            MasternodeState::Enabled
        };
    }

    pub fn info(&self) -> MasternodeInfo {
        MasternodeInfo {
            outpoint: self.outpoint.clone(),
            addr: self.addr,
            collateral_pubkey: self.collateral_pubkey,
            operator_pubkey: self.operator_pubkey,
            protocol_version: self.protocol_version,
            sig_time: self.sig_time,
            activation_height: self.activation_height,
            last_paid_primary_height: self.last_paid_primary_height,
            last_paid_primary_time: self.last_paid_primary_time,
            last_paid_secondary_height: self.last_paid_secondary_height,
            state: self.state,
        }
    }

    /// Content hash of this entry's announce record.
    pub fn broadcast_hash(&self) -> Hash {
        broadcast_hash(&self.outpoint, &self.collateral_pubkey, self.sig_time)
    }

    /// Reconstructs the announce record for this entry, for list serving
    /// and recovery.
    pub fn to_broadcast(&self) -> MasternodeBroadcast {
        MasternodeBroadcast {
            outpoint: self.outpoint.clone(),
            addr: self.addr,
            collateral_pubkey: self.collateral_pubkey,
            operator_pubkey: self.operator_pubkey,
            protocol_version: self.protocol_version,
            sig_time: self.sig_time,
            last_ping: self.last_ping.clone(),
            signature: self.broadcast_signature.clone(),
            recovery: false,
        }
    }
}

/// Lightweight snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasternodeInfo {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub collateral_pubkey: PublicKeyBytes,
    pub operator_pubkey: PublicKeyBytes,
    pub protocol_version: u32,
    pub sig_time: i64,
    pub activation_height: u64,
    pub last_paid_primary_height: u64,
    pub last_paid_primary_time: i64,
    pub last_paid_secondary_height: u64,
    pub state: MasternodeState,
}

impl MasternodeInfo {
    pub fn payee_script(&self) -> Script {
        payee_script(&self.collateral_pubkey)
    }
}

fn content_hash<T: Serialize>(value: &T) -> Hash {
    let bytes = bincode::serialize(value).unwrap_or_default();
    *blake3::hash(&bytes).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry() -> Masternode {
        Masternode {
            outpoint: OutPoint::new([1u8; 32], 0),
            addr: "10.1.2.3:9999".parse().unwrap(),
            collateral_pubkey: [2u8; 32],
            operator_pubkey: [3u8; 32],
            protocol_version: 70_021,
            sig_time: 1_000,
            activation_height: 10,
            last_ping: None,
            last_paid_primary_height: 0,
            last_paid_primary_time: 0,
            last_paid_secondary_height: 0,
            last_paid_secondary_time: 0,
            pose_ban_score: 0,
            state: MasternodeState::PreEnabled,
            last_check_time: 0,
            broadcast_signature: Vec::new(),
        }
    }

    fn ping_at(sig_time: i64) -> MasternodePing {
        MasternodePing {
            outpoint: OutPoint::new([1u8; 32], 0),
            block_hash: [9u8; 32],
            sig_time,
            daemon_version: 4_000_000,
            sentinel_current: true,
            signature: Vec::new(),
        }
    }

    #[test]
    fn ban_score_saturates_and_bans() {
        let params = MasternodeParams::default();
        let mut mn = test_entry();
        for _ in 0..params.pose_ban_max_score + 3 {
            mn.increase_pose_ban_score(&params);
        }
        assert_eq!(mn.pose_ban_score, params.pose_ban_max_score);
        assert!(mn.is_pose_banned());
    }

    #[test]
    fn verified_entry_sits_at_negative_ceiling() {
        let params = MasternodeParams::default();
        let mut mn = test_entry();
        for _ in 0..params.pose_ban_max_score * 2 {
            mn.decrease_pose_ban_score(&params);
        }
        assert_eq!(mn.pose_ban_score, -params.pose_ban_max_score);
        assert!(mn.is_pose_verified(&params));
    }

    #[test]
    fn check_classifies_liveness() {
        let params = MasternodeParams::default();
        let mut mn = test_entry();

        // Fresh broadcast, no ping yet: pre-enabled within the grace window.
        mn.check(mn.sig_time + 10, false, true, &params);
        assert_eq!(mn.state, MasternodeState::PreEnabled);

        // Recent ping: enabled.
        mn.last_ping = Some(ping_at(2_000));
        mn.check(2_100, false, true, &params);
        assert_eq!(mn.state, MasternodeState::Enabled);

        // Ping older than the expiration window: expired.
        mn.check(2_000 + params.expiration_seconds + 1, false, true, &params);
        assert_eq!(mn.state, MasternodeState::Expired);

        // Past the new-start window: needs a fresh announce.
        mn.check(2_000 + params.new_start_required_seconds + 1, false, true, &params);
        assert_eq!(mn.state, MasternodeState::NewStartRequired);

        // Spent collateral wins over everything.
        mn.check(2_200, true, true, &params);
        assert_eq!(mn.state, MasternodeState::OutpointSpent);
    }

    #[test]
    fn check_is_rate_limited() {
        let params = MasternodeParams::default();
        let mut mn = test_entry();
        mn.last_ping = Some(ping_at(2_000));
        mn.check(2_100, false, true, &params);
        assert_eq!(mn.state, MasternodeState::Enabled);

        // Within the rate-limit window nothing changes even if inputs did.
        mn.check(2_100 + params.check_seconds - 1, true, false, &params);
        assert_eq!(mn.state, MasternodeState::Enabled);
    }

    #[test]
    fn vote_hash_excludes_signature() {
        let mut a = MasternodePaymentVote::new(OutPoint::new([5u8; 32], 1), 200, vec![1, 2, 3]);
        let mut b = a.clone();
        a.signature = vec![0xaa; 64];
        b.signature = vec![0xbb; 64];
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn legacy_vote_message_layout() {
        let vote = MasternodePaymentVote::new(OutPoint::new([0u8; 32], 7), 1234, vec![0xde, 0xad]);
        let msg = String::from_utf8(vote.legacy_message()).unwrap();
        let expected = format!("{}1234dead", OutPoint::new([0u8; 32], 7).to_short_string());
        assert_eq!(msg, expected);
    }
}
