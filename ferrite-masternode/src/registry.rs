//! The masternode registry: the `outpoint -> Masternode` map, gossip
//! record ingestion, liveness tracking and recovery.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use ferrite_shared_types::masternode::{
    broadcast_hash, Masternode, MasternodeBroadcast, MasternodeInfo, MasternodeParams,
    MasternodePing,
};
use ferrite_shared_types::p2p::{Inv, InvKind, MasternodeMessage, NetEvent, SyncAsset};
use ferrite_shared_types::{Hash, OutPoint, Script};

use crate::active::ActiveMasternode;
use crate::chain::{ChainView, UtxoView};
use crate::constants::{
    MNB_RECOVERY_MAX_ASK_ENTRIES, MNB_RECOVERY_QUORUM_REQUIRED, MNB_RECOVERY_QUORUM_TOTAL,
    MNB_RECOVERY_RETRY_SECONDS, MNB_RECOVERY_WAIT_SECONDS, PENDING_REQUEST_TIMEOUT_SECONDS,
    PING_MAX_BLOCK_DEPTH, PRIMARY_PAYMENT_POSITION,
};
use crate::error::{MasternodeError, Result};
use crate::net::NetQueue;
use crate::ranker;
use crate::signing;
use crate::sync::{is_routable, SyncCoordinator};

/// Persisted form of the registry.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryDump {
    pub masternodes: HashMap<OutPoint, Masternode>,
    pub seen_broadcasts: HashMap<Hash, (i64, MasternodeBroadcast)>,
    pub seen_pings: HashMap<Hash, MasternodePing>,
    pub last_sentinel_ping_time: i64,
}

struct RegistryInner {
    masternodes: HashMap<OutPoint, Masternode>,
    /// Content-addressed broadcasts with first-seen times.
    seen_broadcasts: HashMap<Hash, (i64, MasternodeBroadcast)>,
    seen_pings: HashMap<Hash, MasternodePing>,
    /// Outstanding recovery requests: broadcast hash -> (deadline, peers asked).
    recovery_requests: HashMap<Hash, (i64, HashSet<SocketAddr>)>,
    recovery_replies: HashMap<Hash, Vec<MasternodeBroadcast>>,
    /// Broadcast fetches waiting for a connection slot.
    scheduled_requests: Vec<(SocketAddr, Hash)>,
    pending_requests: HashMap<SocketAddr, (i64, HashSet<Hash>, bool)>,
    cached_height: u64,
    last_sentinel_ping_time: i64,
    last_paid_scan_height: u64,
    masternodes_added: bool,
    masternodes_removed: bool,
    warned_daemon_version: bool,
}

/// Owns the masternode map and every cache derived from gossip. All state
/// sits behind one mutex; external collaborators are passed per call.
pub struct Registry {
    params: MasternodeParams,
    net: NetQueue,
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new(params: MasternodeParams, net: NetQueue) -> Self {
        Registry {
            params,
            net,
            inner: Mutex::new(RegistryInner {
                masternodes: HashMap::new(),
                seen_broadcasts: HashMap::new(),
                seen_pings: HashMap::new(),
                recovery_requests: HashMap::new(),
                recovery_replies: HashMap::new(),
                scheduled_requests: Vec::new(),
                pending_requests: HashMap::new(),
                cached_height: 0,
                last_sentinel_ping_time: 0,
                last_paid_scan_height: 0,
                masternodes_added: false,
                masternodes_removed: false,
                warned_daemon_version: false,
            }),
        }
    }

    pub fn params(&self) -> &MasternodeParams {
        &self.params
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().masternodes.len()
    }

    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.inner.lock().unwrap().masternodes.contains_key(outpoint)
    }

    pub fn cached_height(&self) -> u64 {
        self.inner.lock().unwrap().cached_height
    }

    /// Adds a new entry, resolving the activation height from the UTXO set
    /// when the broadcast did not carry one.
    pub fn add(&self, mut mn: Masternode, utxo: &dyn UtxoView) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.masternodes.contains_key(&mn.outpoint) {
            error!(
                "registry -- not adding masternode {} (already exists), {} now",
                mn.outpoint,
                inner.masternodes.len()
            );
            return Err(MasternodeError::Duplicate);
        }
        if mn.activation_height == 0 {
            if let Some(info) = utxo.get_utxo(&mn.outpoint) {
                mn.activation_height = info.height;
            }
        }
        info!(
            "registry -- adding masternode {} addr={}, {} now",
            mn.outpoint,
            mn.addr,
            inner.masternodes.len() + 1
        );
        inner.masternodes.insert(mn.outpoint.clone(), mn);
        inner.masternodes_added = true;
        Ok(())
    }

    pub fn find(&self, outpoint: &OutPoint) -> Option<Masternode> {
        self.inner.lock().unwrap().masternodes.get(outpoint).cloned()
    }

    pub fn get_info(&self, outpoint: &OutPoint) -> Option<MasternodeInfo> {
        self.inner.lock().unwrap().masternodes.get(outpoint).map(|mn| mn.info())
    }

    pub fn get_info_by_operator_key(&self, pubkey: &[u8; 32]) -> Option<MasternodeInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .masternodes
            .values()
            .find(|mn| &mn.operator_pubkey == pubkey)
            .map(|mn| mn.info())
    }

    pub fn get_info_by_payee(&self, payee: &[u8]) -> Option<MasternodeInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .masternodes
            .values()
            .find(|mn| mn.payee_script() == payee)
            .map(|mn| mn.info())
    }

    /// Activation height for a payee script, falling back to the UTXO set
    /// when the entry never resolved one.
    pub fn node_activation_height(&self, payee: &[u8], utxo: &dyn UtxoView) -> u64 {
        let info = match self.get_info_by_payee(payee) {
            Some(info) => info,
            None => return 0,
        };
        if info.activation_height != 0 {
            return info.activation_height;
        }
        utxo.get_utxo(&info.outpoint).map(|u| u.height).unwrap_or(0)
    }

    pub fn count(&self, min_protocol: u32) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .masternodes
            .values()
            .filter(|mn| mn.protocol_version >= min_protocol)
            .count()
    }

    pub fn count_enabled(&self, min_protocol: u32) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .masternodes
            .values()
            .filter(|mn| mn.protocol_version >= min_protocol && mn.is_enabled())
            .count()
    }

    /// Cloned view of every entry.
    pub fn snapshot(&self) -> Vec<Masternode> {
        self.inner.lock().unwrap().masternodes.values().cloned().collect()
    }

    /// Runs a closure over the entry map; the PoSe verifier mutates ban
    /// scores through this.
    pub(crate) fn with_map_mut<R>(
        &self,
        f: impl FnOnce(&mut HashMap<OutPoint, Masternode>) -> R,
    ) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.masternodes)
    }

    pub fn pose_ban(&self, outpoint: &OutPoint) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.masternodes.get_mut(outpoint) {
            Some(mn) => {
                mn.pose_ban(&self.params);
                true
            }
            None => {
                error!("registry -- pose_ban: masternode {} not found", outpoint);
                false
            }
        }
    }

    pub fn update_sentinel_ping_time(&self, now: i64) {
        self.inner.lock().unwrap().last_sentinel_ping_time = now;
    }

    pub fn is_sentinel_ping_active(&self, now: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        now - inner.last_sentinel_ping_time <= self.params.sentinel_ping_max_seconds
    }

    pub fn updated_block_tip(&self, height: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.cached_height = height;
        debug!("registry -- cached height {}", height);
    }

    /// Whether entries were added/removed since the flags were last taken.
    pub fn take_dirty_flags(&self) -> (bool, bool) {
        let mut inner = self.inner.lock().unwrap();
        let flags = (inner.masternodes_added, inner.masternodes_removed);
        inner.masternodes_added = false;
        inner.masternodes_removed = false;
        flags
    }

    /// Deterministic total ordering of the registry at `height`, best rank
    /// first. Fails rather than answering partially for unknown blocks.
    pub fn ranks(
        &self,
        height: u64,
        min_protocol: u32,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) -> Result<Vec<(usize, Masternode)>> {
        if !sync.is_list_synced() {
            return Err(MasternodeError::NotSynced);
        }
        let block_hash = chain
            .block_hash(height)
            .ok_or(MasternodeError::UnknownBlock(height))?;
        let inner = self.inner.lock().unwrap();
        let ordered = ranker::order_by_score(inner.masternodes.values(), &block_hash, min_protocol);
        Ok(ordered
            .into_iter()
            .enumerate()
            .map(|(idx, mn)| (idx + 1, mn.clone()))
            .collect())
    }

    pub fn rank_of(
        &self,
        outpoint: &OutPoint,
        height: u64,
        min_protocol: u32,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) -> Result<Option<usize>> {
        if !sync.is_list_synced() {
            return Err(MasternodeError::NotSynced);
        }
        let block_hash = chain
            .block_hash(height)
            .ok_or(MasternodeError::UnknownBlock(height))?;
        let inner = self.inner.lock().unwrap();
        Ok(ranker::rank_of(inner.masternodes.values(), outpoint, &block_hash, min_protocol))
    }

    /// Classifies the liveness of every entry. Each entry internally
    /// rate-limits itself to one classification per check interval.
    pub fn check(&self, chain: &dyn ChainView, utxo: &dyn UtxoView) {
        let now = chain.adjusted_time();
        let mut inner = self.inner.lock().unwrap();
        let outpoints: Vec<OutPoint> = inner.masternodes.keys().cloned().collect();
        for outpoint in outpoints {
            let spent = utxo.get_utxo(&outpoint).is_none();
            if let Some(mn) = inner.masternodes.get_mut(&outpoint) {
                mn.check(now, spent, false, &self.params);
            }
        }
    }

    /// Maintenance pass: evicts spent entries, drives broadcast recovery
    /// for entries stuck in `NewStartRequired`, and ages the seen caches.
    pub fn check_and_remove(
        &self,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
        sync: &SyncCoordinator,
    ) {
        if !sync.is_list_synced() {
            warn!("registry -- check_and_remove skipped, list not synced");
            return;
        }

        self.check(chain, utxo);
        let now = chain.adjusted_time();

        // Evict spent entries and collect recovery candidates.
        let mut candidates: Vec<(OutPoint, Hash)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let spent: Vec<OutPoint> = inner
                .masternodes
                .values()
                .filter(|mn| mn.is_outpoint_spent())
                .map(|mn| mn.outpoint.clone())
                .collect();
            for outpoint in spent {
                if let Some(mn) = inner.masternodes.remove(&outpoint) {
                    info!(
                        "registry -- removing masternode {} ({}), {} now",
                        outpoint,
                        mn.state,
                        inner.masternodes.len()
                    );
                    let hash = mn.broadcast_hash();
                    inner.seen_broadcasts.remove(&hash);
                    inner.masternodes_removed = true;
                    sync.forget_outpoint(&outpoint);
                }
            }

            if sync.is_synced() {
                for mn in inner.masternodes.values() {
                    if !mn.is_new_start_required() {
                        continue;
                    }
                    let hash = mn.broadcast_hash();
                    if inner.recovery_requests.contains_key(&hash) {
                        continue;
                    }
                    candidates.push((mn.outpoint.clone(), hash));
                    if candidates.len() >= MNB_RECOVERY_MAX_ASK_ENTRIES {
                        break;
                    }
                }
            }
        }

        // Ask ranked peers for the missing broadcasts. The ranking height is
        // randomized so successive rounds spread over different peers.
        if !candidates.is_empty() {
            let tip = self.cached_height();
            let random_height = rand::thread_rng().gen_range(0..=tip.max(1));
            if let Ok(ranked) =
                self.ranks(random_height, self.params.min_protocol_version, chain, sync)
            {
                let mut inner = self.inner.lock().unwrap();
                for (outpoint, hash) in candidates {
                    let mut requested: HashSet<SocketAddr> = HashSet::new();
                    for (_, mn) in &ranked {
                        if requested.len() >= MNB_RECOVERY_QUORUM_TOTAL {
                            break;
                        }
                        // Re-asking a peer we asked recently risks a ban.
                        if sync.was_entry_asked(&outpoint, mn.addr, now) {
                            continue;
                        }
                        requested.insert(mn.addr);
                        inner.scheduled_requests.push((mn.addr, hash));
                    }
                    if !requested.is_empty() {
                        info!("registry -- recovery initiated, masternode={}", outpoint);
                        inner
                            .recovery_requests
                            .insert(hash, (now + MNB_RECOVERY_WAIT_SECONDS, requested));
                    }
                }
            }
        }

        // Tally recovery replies whose deadline passed.
        let ready: Vec<(Hash, Vec<MasternodeBroadcast>)> = {
            let mut inner = self.inner.lock().unwrap();
            let expired: Vec<Hash> = inner
                .recovery_replies
                .keys()
                .filter(|hash| {
                    inner
                        .recovery_requests
                        .get(*hash)
                        .map(|(deadline, _)| *deadline < now)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            expired
                .into_iter()
                .filter_map(|hash| inner.recovery_replies.remove(&hash).map(|r| (hash, r)))
                .collect()
        };
        for (hash, replies) in ready {
            if replies.len() >= MNB_RECOVERY_QUORUM_REQUIRED {
                info!(
                    "registry -- reprocessing recovered broadcast, masternode={}",
                    replies[0].outpoint
                );
                let mut mnb = replies[0].clone();
                mnb.recovery = true;
                if let Err(err) = self.update_from_broadcast(None, mnb, chain, utxo, sync, None) {
                    warn!("registry -- recovery reprocess failed: {}", err);
                }
            }
            debug!("registry -- dropping recovery replies for {}", hex::encode(hash));
        }

        // Age out bookkeeping.
        {
            let params = self.params.clone();
            let mut inner = self.inner.lock().unwrap();
            inner
                .recovery_requests
                .retain(|_, (deadline, _)| now - *deadline <= MNB_RECOVERY_RETRY_SECONDS);
            inner.seen_pings.retain(|_, ping| !ping.is_expired(now, &params));
            // NOTE: seen broadcasts are cleaned on updates, not here.
        }
        sync.maintenance(now);

        let (_, removed) = self.take_dirty_flags();
        if removed {
            debug!("registry -- masternodes removed during maintenance");
        }
    }

    fn simple_check(
        &self,
        mnb: &MasternodeBroadcast,
        now: i64,
        tip: u64,
    ) -> std::result::Result<(), (MasternodeError, u32)> {
        if mnb.sig_time > now + 60 * 60 {
            return Err((
                MasternodeError::OutOfRange(format!(
                    "broadcast signed too far in the future: {}",
                    mnb.sig_time
                )),
                1,
            ));
        }
        if mnb.protocol_version < self.params.min_protocol_version {
            return Err((
                MasternodeError::InvalidData(format!(
                    "obsolete broadcast protocol {}",
                    mnb.protocol_version
                )),
                0,
            ));
        }
        if let Some(ping) = &mnb.last_ping {
            if ping.outpoint != mnb.outpoint {
                return Err((
                    MasternodeError::InvalidData("embedded ping outpoint mismatch".into()),
                    33,
                ));
            }
            if ping.sig_time > now + 60 * 60 {
                return Err((
                    MasternodeError::OutOfRange("embedded ping signed in the future".into()),
                    1,
                ));
            }
        }
        let ok = signing::verify_dual(
            &mnb.collateral_pubkey,
            tip,
            &mnb.signature_hash(),
            &mnb.legacy_message(),
            &mnb.signature,
            &self.params,
        );
        if !ok {
            return Err((
                MasternodeError::InvalidSignature(format!("broadcast for {}", mnb.outpoint)),
                100,
            ));
        }
        Ok(())
    }

    fn check_outpoint(
        &self,
        mnb: &MasternodeBroadcast,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
    ) -> Result<u64> {
        let info = utxo
            .get_utxo(&mnb.outpoint)
            .ok_or_else(|| MasternodeError::UtxoMismatch("collateral not found or spent".into()))?;
        if info.value != self.params.collateral_amount {
            return Err(MasternodeError::UtxoMismatch(format!(
                "collateral value {} != {}",
                info.value, self.params.collateral_amount
            )));
        }
        let confirmations = utxo.confirmations(&mnb.outpoint, chain.tip_height());
        if confirmations < self.params.min_confirmations {
            return Err(MasternodeError::UtxoMismatch(format!(
                "collateral has {} confirmations, {} required",
                confirmations, self.params.min_confirmations
            )));
        }
        Ok(info.height)
    }

    /// Broadcast ingestion: dedup, validation, insert-or-update, relay.
    /// Applying the same broadcast twice is a no-op.
    pub fn update_from_broadcast(
        &self,
        from: Option<SocketAddr>,
        mnb: MasternodeBroadcast,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
        sync: &SyncCoordinator,
        active: Option<&ActiveMasternode>,
    ) -> Result<bool> {
        let now = chain.adjusted_time();
        let tip = chain.tip_height();
        let hash = mnb.hash();
        debug!("registry -- broadcast for masternode {}", mnb.outpoint);

        {
            let mut inner = self.inner.lock().unwrap();

            if !mnb.recovery {
                if let Some((first_seen, seen_mnb)) = inner.seen_broadcasts.get(&hash).cloned() {
                    // Fewer than two ping intervals before the entry turns
                    // non-recoverable: keep the sync timer alive.
                    if now - first_seen
                        > self.params.new_start_required_seconds - self.params.min_ping_seconds * 2
                    {
                        if let Some(entry) = inner.seen_broadcasts.get_mut(&hash) {
                            entry.0 = now;
                        }
                        sync.bump("registry seen broadcast", now);
                    }
                    if let Some(peer) = from {
                        let is_reply = inner
                            .recovery_requests
                            .get(&hash)
                            .map(|(deadline, asked)| now < *deadline && asked.contains(&peer))
                            .unwrap_or(false);
                        if is_reply {
                            // One reply per asked peer.
                            if let Some((_, asked)) = inner.recovery_requests.get_mut(&hash) {
                                asked.remove(&peer);
                            }
                            let newer = match (&mnb.last_ping, &seen_mnb.last_ping) {
                                (Some(new), Some(old)) => new.sig_time > old.sig_time,
                                (Some(_), None) => true,
                                _ => false,
                            };
                            if newer {
                                let mut probe = mnb.into_masternode();
                                probe.check(now, false, true, &self.params);
                                if probe.state.valid_for_auto_start() {
                                    debug!(
                                        "registry -- good recovery reply for {} from {}",
                                        mnb.outpoint, peer
                                    );
                                    inner.recovery_replies.entry(hash).or_default().push(mnb);
                                }
                            }
                        }
                    }
                    return Err(MasternodeError::Duplicate);
                }
            }
            inner.seen_broadcasts.insert(hash, (now, mnb.clone()));
        }

        if let Err((err, score)) = self.simple_check(&mnb, now, tip) {
            if score > 0 {
                if let Some(peer) = from {
                    self.net.push(NetEvent::Misbehave(peer, score));
                }
            }
            warn!("registry -- broadcast rejected for {}: {}", mnb.outpoint, err);
            return Err(err);
        }

        let mut relay = true;
        {
            let mut inner = self.inner.lock().unwrap();
            let existing = inner.masternodes.get(&mnb.outpoint).cloned();

            if let Some(prev) = existing {
                if mnb.collateral_pubkey != prev.collateral_pubkey {
                    if let Some(peer) = from {
                        self.net.push(NetEvent::Misbehave(peer, 33));
                    }
                    return Err(MasternodeError::InvalidData(
                        "collateral key changed for existing outpoint".into(),
                    ));
                }
                if mnb.sig_time <= prev.sig_time && !mnb.recovery {
                    return Err(MasternodeError::Duplicate);
                }
                let old_hash = prev.broadcast_hash();
                if let Some(entry) = inner.masternodes.get_mut(&mnb.outpoint) {
                    entry.addr = mnb.addr;
                    entry.operator_pubkey = mnb.operator_pubkey;
                    entry.protocol_version = mnb.protocol_version;
                    entry.sig_time = mnb.sig_time;
                    entry.last_ping = mnb.last_ping.clone();
                    entry.broadcast_signature = mnb.signature.clone();
                    entry.check(now, false, true, &self.params);
                }
                if old_hash != hash {
                    inner.seen_broadcasts.remove(&old_hash);
                }
            } else {
                drop(inner);
                let activation_height = self.check_outpoint(&mnb, chain, utxo)?;
                inner = self.inner.lock().unwrap();
                let mut mn = mnb.into_masternode();
                mn.activation_height = activation_height;
                mn.check(now, false, true, &self.params);
                info!(
                    "registry -- new masternode {} sig_time={} addr={}",
                    mn.outpoint, mn.sig_time, mn.addr
                );
                inner.masternodes.insert(mn.outpoint.clone(), mn);
                inner.masternodes_added = true;
            }

            // Our own broadcast coming back means we were remotely activated.
            if let Some(active) = active {
                if mnb.operator_pubkey == active.operator_pubkey() {
                    if let Some(entry) = inner.masternodes.get_mut(&mnb.outpoint) {
                        entry.pose_ban_score = -self.params.pose_ban_max_score;
                    }
                    if mnb.protocol_version == self.params.protocol_version {
                        info!("registry -- got own masternode entry, remotely activated");
                    } else {
                        warn!(
                            "registry -- own broadcast carries protocol {}, ours is {}; re-activate this masternode",
                            mnb.protocol_version, self.params.protocol_version
                        );
                        relay = false;
                    }
                }
            }
        }

        sync.bump("registry new broadcast", now);
        if relay {
            let mut out = mnb;
            out.recovery = false;
            self.net.push(NetEvent::Relay(MasternodeMessage::Announce(out)));
        }
        Ok(relay)
    }

    /// Ping ingestion: dedup, anchoring and signature checks, then update
    /// the entry's liveness.
    pub fn process_ping(
        &self,
        from: Option<SocketAddr>,
        ping: MasternodePing,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) -> Result<()> {
        let now = chain.adjusted_time();
        let tip = chain.tip_height();
        let hash = ping.hash();

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.seen_pings.contains_key(&hash) {
                return Err(MasternodeError::Duplicate);
            }
            inner.seen_pings.insert(hash, ping.clone());
            debug!("registry -- new ping from masternode {}", ping.outpoint);

            if ping.sentinel_current {
                inner.last_sentinel_ping_time = now;
            }
        }

        if ping.sig_time > now + 60 * 60 {
            if let Some(peer) = from {
                self.net.push(NetEvent::Misbehave(peer, 1));
            }
            return Err(MasternodeError::OutOfRange("ping signed in the future".into()));
        }

        // The anchoring block must be known and near the tip.
        match chain.height_of(&ping.block_hash) {
            None => {
                debug!("registry -- ping from {} anchors unknown block", ping.outpoint);
                return Err(MasternodeError::InvalidData("unknown ping block".into()));
            }
            Some(height) if height + PING_MAX_BLOCK_DEPTH < tip => {
                return Err(MasternodeError::OutOfRange("ping anchored too deep".into()));
            }
            _ => {}
        }

        let entry = match self.find(&ping.outpoint) {
            Some(entry) => entry,
            None => {
                if let Some(peer) = from {
                    sync.ask_for_mn(peer, &ping.outpoint, now);
                }
                return Err(MasternodeError::UnknownMasternode(ping.outpoint.clone()));
            }
        };

        // Too late, a fresh announce is required.
        if entry.is_new_start_required() {
            debug!("registry -- ping for {} needs new announce first", ping.outpoint);
            return Err(MasternodeError::OutOfRange("new announce required".into()));
        }

        // Not an update if we have a ping nearly as fresh already.
        if entry.is_pinged_within(self.params.min_ping_seconds - 60, ping.sig_time) {
            return Err(MasternodeError::Duplicate);
        }

        let ok = signing::verify_dual(
            &entry.operator_pubkey,
            tip,
            &ping.signature_hash(),
            &ping.legacy_message(),
            &ping.signature,
            &self.params,
        );
        if !ok {
            if let Some(peer) = from {
                self.net.push(NetEvent::Misbehave(peer, 33));
            }
            return Err(MasternodeError::InvalidSignature(format!(
                "ping for {}",
                ping.outpoint
            )));
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(mn) = inner.masternodes.get_mut(&ping.outpoint) {
                mn.last_ping = Some(ping.clone());
                mn.check(now, false, true, &self.params);
            }
            // Keep the cached broadcast's embedded ping current.
            let mnb_hash = broadcast_hash(&entry.outpoint, &entry.collateral_pubkey, entry.sig_time);
            if let Some((_, seen_mnb)) = inner.seen_broadcasts.get_mut(&mnb_hash) {
                seen_mnb.last_ping = Some(ping.clone());
            }
        }

        sync.bump("registry ping", now);
        self.net.push(NetEvent::Relay(MasternodeMessage::Ping(ping)));
        Ok(())
    }

    /// Serves a list request: the null outpoint asks for everything.
    pub fn process_get_list(
        &self,
        peer: SocketAddr,
        outpoint: OutPoint,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) {
        if !sync.is_synced() {
            debug!("registry -- list request before sync finished, ignoring");
            return;
        }
        let now = chain.adjusted_time();

        if outpoint.is_null() {
            if is_routable(&peer) && !sync.allow_full_list_request(peer, now) {
                warn!("registry -- peer {} asked for the list too often", peer);
                self.net.push(NetEvent::Misbehave(peer, 34));
                return;
            }
            let invs = {
                let mut inner = self.inner.lock().unwrap();
                let entries: Vec<Masternode> = inner.masternodes.values().cloned().collect();
                let mut invs = Vec::new();
                for mn in entries {
                    if !is_routable(&mn.addr) {
                        continue;
                    }
                    // Send regardless of state, peers need it to verify old votes.
                    Self::push_list_invs(&mut inner, &mn, now, &mut invs);
                }
                invs
            };
            let count = invs.len() / 2;
            self.net.push(NetEvent::Send(peer, MasternodeMessage::Inv(invs)));
            self.net.push(NetEvent::Send(
                peer,
                MasternodeMessage::SyncStatusCount {
                    asset: SyncAsset::MasternodeList,
                    count: count as u32,
                },
            ));
            debug!("registry -- sent {} masternode invs to {}", count, peer);
        } else {
            let invs = {
                let mut inner = self.inner.lock().unwrap();
                match inner.masternodes.get(&outpoint).cloned() {
                    Some(mn) if is_routable(&mn.addr) => {
                        let mut invs = Vec::new();
                        Self::push_list_invs(&mut inner, &mn, now, &mut invs);
                        invs
                    }
                    _ => Vec::new(),
                }
            };
            if !invs.is_empty() {
                self.net.push(NetEvent::Send(peer, MasternodeMessage::Inv(invs)));
                debug!("registry -- sent masternode entry {} to {}", outpoint, peer);
            }
        }
    }

    fn push_list_invs(
        inner: &mut RegistryInner,
        mn: &Masternode,
        now: i64,
        invs: &mut Vec<Inv>,
    ) {
        let mnb = mn.to_broadcast();
        let mnb_hash = mnb.hash();
        invs.push(Inv::new(InvKind::MasternodeAnnounce, mnb_hash));
        inner.seen_broadcasts.entry(mnb_hash).or_insert((now, mnb));
        if let Some(ping) = &mn.last_ping {
            let ping_hash = ping.hash();
            invs.push(Inv::new(InvKind::MasternodePing, ping_hash));
            inner.seen_pings.entry(ping_hash).or_insert_with(|| ping.clone());
        }
    }

    /// Serves getdata for announce and ping inventory.
    pub fn serve_get_data(&self, peer: SocketAddr, invs: &[Inv]) {
        let mut responses = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            for inv in invs {
                match inv.kind {
                    InvKind::MasternodeAnnounce => {
                        if let Some((_, mnb)) = inner.seen_broadcasts.get(&inv.hash) {
                            responses.push(MasternodeMessage::Announce(mnb.clone()));
                        }
                    }
                    InvKind::MasternodePing => {
                        if let Some(ping) = inner.seen_pings.get(&inv.hash) {
                            responses.push(MasternodeMessage::Ping(ping.clone()));
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

    /// Inventory hashes we already hold, to avoid re-requesting them.
    pub fn has_inv(&self, inv: &Inv) -> bool {
        let inner = self.inner.lock().unwrap();
        match inv.kind {
            InvKind::MasternodeAnnounce => inner.seen_broadcasts.contains_key(&inv.hash),
            InvKind::MasternodePing => inner.seen_pings.contains_key(&inv.hash),
            _ => false,
        }
    }

    /// Moves one scheduled recovery group into the pending pool and drives
    /// dispatch/timeout of pending fetches.
    pub fn process_pending_broadcast_requests(&self, now: i64) {
        let dispatch: Vec<(SocketAddr, Vec<Inv>)> = {
            let mut inner = self.inner.lock().unwrap();

            // Group the scheduled requests for one address, like the
            // connection scheduler does.
            inner.scheduled_requests.sort();
            if let Some((addr, _)) = inner.scheduled_requests.first().cloned() {
                let mut hashes = HashSet::new();
                inner.scheduled_requests.retain(|(a, h)| {
                    if *a == addr {
                        hashes.insert(*h);
                        false
                    } else {
                        true
                    }
                });
                if !inner.pending_requests.contains_key(&addr) {
                    inner.pending_requests.insert(addr, (now, hashes, false));
                }
            }

            let mut out = Vec::new();
            inner.pending_requests.retain(|addr, (added, hashes, dispatched)| {
                if !*dispatched {
                    let invs = hashes
                        .iter()
                        .map(|h| Inv::new(InvKind::MasternodeAnnounce, *h))
                        .collect();
                    out.push((*addr, invs));
                    *dispatched = true;
                }
                now - *added <= PENDING_REQUEST_TIMEOUT_SECONDS
            });
            out
        };

        for (addr, invs) in dispatch {
            debug!("registry -- fetching {} broadcasts from {}", invs.len(), addr);
            self.net
                .push(NetEvent::Connect(addr, MasternodeMessage::GetData(invs)));
        }
    }

    /// Walks the chain backwards mapping coinbase outputs at the known
    /// payment positions onto entries' last-paid bookkeeping. Only forward
    /// progress is recorded.
    pub fn update_last_paid(
        &self,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
        has_payment_block: &dyn Fn(u64) -> bool,
        storage_limit: u64,
    ) {
        if chain.is_lite_mode() {
            return;
        }
        if !sync.is_winners_synced() {
            debug!("registry -- last-paid scan skipped, winners not synced");
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.masternodes.is_empty() {
            return;
        }

        let tip = inner.cached_height;
        let max_back = if inner.last_paid_scan_height == 0 {
            storage_limit
        } else {
            tip.saturating_sub(inner.last_paid_scan_height) + 1
        };

        let mn_count = inner
            .masternodes
            .values()
            .filter(|mn| mn.protocol_version >= self.params.min_protocol_version)
            .count();

        let payee_index: HashMap<Script, OutPoint> = inner
            .masternodes
            .values()
            .map(|mn| (mn.payee_script(), mn.outpoint.clone()))
            .collect();

        debug!(
            "registry -- last-paid scan: tip={} max_back={} entries={}",
            tip, max_back, mn_count
        );

        let max_secondary = self.params.secondaries_max_count as usize;
        for back in 0..max_back {
            let height = match tip.checked_sub(back) {
                Some(h) => h,
                None => break,
            };
            // Tiny networks have no reliable vote data; scan unconditionally.
            if mn_count > 2 && !has_payment_block(height) {
                continue;
            }
            let outputs = match chain.coinbase_outputs(height) {
                Some(outputs) => outputs,
                None => continue,
            };
            if outputs.len() < PRIMARY_PAYMENT_POSITION + 1 {
                continue;
            }
            let time = chain.block_time(height).unwrap_or(0);

            for (position, output) in outputs.iter().enumerate().skip(PRIMARY_PAYMENT_POSITION) {
                let outpoint = match payee_index.get(&output.script_pubkey) {
                    Some(outpoint) => outpoint,
                    None => continue,
                };
                let mn = match inner.masternodes.get_mut(outpoint) {
                    Some(mn) => mn,
                    None => continue,
                };
                if position == PRIMARY_PAYMENT_POSITION {
                    if mn.last_paid_primary_height < height {
                        mn.last_paid_primary_height = height;
                        mn.last_paid_primary_time = time;
                    }
                } else if position <= PRIMARY_PAYMENT_POSITION + max_secondary
                    && mn.last_paid_secondary_height < height
                {
                    mn.last_paid_secondary_height = height;
                    mn.last_paid_secondary_time = time;
                }
            }
        }

        inner.last_paid_scan_height = tip;
    }

    /// Emits the daemon-version advisory once at least half the known
    /// masternodes advertise something newer than we run.
    pub fn warn_daemon_updates(&self, sync: &SyncCoordinator) {
        let mut inner = self.inner.lock().unwrap();
        if inner.warned_daemon_version || inner.masternodes.is_empty() {
            return;
        }
        if !sync.is_list_synced() {
            return;
        }

        let total = inner.masternodes.len();
        let updated = inner
            .masternodes
            .values()
            .filter(|mn| {
                mn.last_ping
                    .as_ref()
                    .map(|p| p.daemon_version > self.params.client_version)
                    .unwrap_or(false)
            })
            .count();

        if updated < total / 2 {
            return;
        }

        let warning = if updated != total {
            format!(
                "Warning: At least {} of {} masternodes are running on a newer software version. Please check latest releases, you might need to update too.",
                updated, total
            )
        } else {
            format!(
                "Warning: Every masternode (out of {} known ones) is running on a newer software version. Please check latest releases, it's very likely that you missed a major/critical update.",
                total
            )
        };
        warn!("registry -- {}", warning);
        self.net.push(NetEvent::Warning(warning));
        inner.warned_daemon_version = true;
    }

    pub fn dump(&self) -> RegistryDump {
        let inner = self.inner.lock().unwrap();
        RegistryDump {
            masternodes: inner.masternodes.clone(),
            seen_broadcasts: inner.seen_broadcasts.clone(),
            seen_pings: inner.seen_pings.clone(),
            last_sentinel_ping_time: inner.last_sentinel_ping_time,
        }
    }

    pub fn restore(&self, dump: RegistryDump) {
        let mut inner = self.inner.lock().unwrap();
        inner.masternodes = dump.masternodes;
        inner.seen_broadcasts = dump.seen_broadcasts;
        inner.seen_pings = dump.seen_pings;
        inner.last_sentinel_ping_time = dump.last_sentinel_ping_time;
        info!("registry -- restored {} masternodes", inner.masternodes.len());
    }
}
