//! Proof-of-Service: active cross-verification that advertised addresses
//! are controlled by the claimed operator keys, and demotion of
//! equivocators sharing one address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use log::{debug, info, warn};
use rand::Rng;

use ferrite_shared_types::masternode::{Masternode, MasternodeParams, MasternodeVerification};
use ferrite_shared_types::p2p::{MasternodeMessage, NetEvent};
use ferrite_shared_types::{Hash, OutPoint};

use crate::active::ActiveMasternode;
use crate::chain::ChainView;
use crate::constants::{
    MAX_POSE_BLOCKS, MAX_POSE_CONNECTIONS, MAX_POSE_RANK, PENDING_REQUEST_TIMEOUT_SECONDS,
};
use crate::net::NetQueue;
use crate::registry::Registry;
use crate::signing;
use crate::sync::SyncCoordinator;

const FULFILLED_REQUEST: &str = "mnv-request";
const FULFILLED_REPLY: &str = "mnv-reply";
const FULFILLED_DONE: &str = "mnv-done";

struct PoSeInner {
    /// Challenges waiting for a connection slot, keyed by target address.
    pending_requests: HashMap<SocketAddr, (i64, MasternodeVerification, bool)>,
    /// Challenges actually sent, so replies can be matched.
    asked: HashMap<SocketAddr, MasternodeVerification>,
    seen: HashMap<Hash, MasternodeVerification>,
}

/// Drives the verification rounds and the three-phase verify exchange.
pub struct PoSeVerifier {
    params: MasternodeParams,
    net: NetQueue,
    inner: Mutex<PoSeInner>,
}

impl PoSeVerifier {
    pub fn new(params: MasternodeParams, net: NetQueue) -> Self {
        PoSeVerifier {
            params,
            net,
            inner: Mutex::new(PoSeInner {
                pending_requests: HashMap::new(),
                asked: HashMap::new(),
                seen: HashMap::new(),
            }),
        }
    }

    /// Groups (pre-)enabled entries by address; wherever a group already has
    /// a PoSe-verified member, everyone else in the group takes a ban point.
    /// With no verified member nothing happens; repeated rounds converge.
    pub fn check_same_addr(&self, registry: &Registry, sync: &SyncCoordinator) {
        if !sync.is_synced() {
            debug!("pose -- same-addr check skipped, not synced");
            return;
        }
        let params = self.params.clone();
        registry.with_map_mut(|map| {
            if map.is_empty() {
                return;
            }
            let to_ban: Vec<OutPoint> = {
                let mut sorted: Vec<&Masternode> = map.values().collect();
                sorted.sort_by(|a, b| a.addr.cmp(&b.addr).then(a.outpoint.cmp(&b.outpoint)));

                let mut bans = Vec::new();
                let mut prev: Option<&Masternode> = None;
                let mut verified: Option<OutPoint> = None;
                for mn in sorted {
                    if !mn.is_enabled() && !mn.is_pre_enabled() {
                        continue;
                    }
                    match prev {
                        None => {
                            verified = mn.is_pose_verified(&params).then(|| mn.outpoint.clone());
                        }
                        Some(previous) if mn.addr == previous.addr => {
                            if verified.is_some() {
                                // Another masternode with this IP is verified,
                                // ban this one.
                                bans.push(mn.outpoint.clone());
                            } else if mn.is_pose_verified(&params) {
                                // This one is verified, ban the earlier ones.
                                bans.push(previous.outpoint.clone());
                                verified = Some(mn.outpoint.clone());
                            }
                        }
                        Some(_) => {
                            verified = mn.is_pose_verified(&params).then(|| mn.outpoint.clone());
                        }
                    }
                    prev = Some(mn);
                }
                bans
            };

            for outpoint in to_ban {
                if let Some(mn) = map.get_mut(&outpoint) {
                    mn.increase_pose_ban_score(&params);
                    debug!(
                        "pose -- same-addr ban score for {} now {}",
                        outpoint, mn.pose_ban_score
                    );
                }
            }
        });
    }

    /// One verification round: if we rank in the top `MAX_POSE_RANK`,
    /// challenge a strided window of unverified entries below us.
    pub fn do_full_verification_step(
        &self,
        active: Option<&ActiveMasternode>,
        registry: &Registry,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) {
        let active = match active {
            Some(active) => active,
            None => return,
        };
        if !sync.is_synced() {
            return;
        }
        let tip = chain.tip_height();
        if tip == 0 {
            return;
        }
        let ranked =
            match registry.ranks(tip - 1, self.params.min_protocol_version, chain, sync) {
                Ok(ranked) => ranked,
                Err(err) => {
                    debug!("pose -- verification round skipped: {}", err);
                    return;
                }
            };

        let mut my_rank = None;
        for (rank, mn) in &ranked {
            if *rank > MAX_POSE_RANK {
                info!(
                    "pose -- must be in top {} to send verify requests",
                    MAX_POSE_RANK
                );
                return;
            }
            if mn.outpoint == active.outpoint {
                my_rank = Some(*rank);
                info!(
                    "pose -- found self at rank {}/{}, verifying up to {} masternodes",
                    rank,
                    ranked.len(),
                    MAX_POSE_CONNECTIONS
                );
                break;
            }
        }
        // List too short, or this masternode is not enabled.
        let my_rank = match my_rank {
            Some(rank) => rank,
            None => return,
        };

        let now = chain.adjusted_time();
        let mut index = MAX_POSE_RANK + my_rank - 1;
        let mut sent = 0;
        while index < ranked.len() {
            let (rank, mn) = &ranked[index];
            if mn.is_pose_verified(&self.params) || mn.is_pose_banned() {
                debug!(
                    "pose -- skipping already judged masternode {} at {}",
                    mn.outpoint, mn.addr
                );
                index += MAX_POSE_CONNECTIONS;
                continue;
            }
            info!(
                "pose -- verifying masternode {} rank {}/{} addr {}",
                mn.outpoint,
                rank,
                ranked.len(),
                mn.addr
            );
            if self.send_verify_request(mn.addr, tip - 1, now, sync) {
                sent += 1;
                if sent >= MAX_POSE_CONNECTIONS {
                    break;
                }
            }
            index += MAX_POSE_CONNECTIONS;
        }
        debug!("pose -- sent verification requests to {} masternodes", sent);
    }

    /// Schedules a challenge to `addr` unless one went out recently.
    pub fn send_verify_request(
        &self,
        addr: SocketAddr,
        height: u64,
        now: i64,
        sync: &SyncCoordinator,
    ) -> bool {
        if sync.has_fulfilled(addr, FULFILLED_REQUEST, now) {
            info!("pose -- too many verify requests for {}, skipping", addr);
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_requests.contains_key(&addr) {
            return false;
        }
        let nonce = rand::thread_rng().gen_range(0..999_999u32);
        let mnv = MasternodeVerification::request(addr, nonce, height);
        info!("pose -- verifying node using nonce {} addr={}", nonce, addr);
        inner.pending_requests.insert(addr, (now, mnv, false));
        true
    }

    /// Dispatches scheduled challenges and expires stale ones.
    pub fn process_pending_requests(&self, now: i64, sync: &SyncCoordinator) {
        let mut dispatch = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let mut asked_updates = Vec::new();
            inner
                .pending_requests
                .retain(|addr, (added, mnv, dispatched)| {
                    if !*dispatched {
                        dispatch.push((*addr, mnv.clone()));
                        asked_updates.push((*addr, mnv.clone()));
                        *dispatched = true;
                    }
                    if now - *added > PENDING_REQUEST_TIMEOUT_SECONDS {
                        debug!("pose -- abandoned verify request to {}", addr);
                        return false;
                    }
                    true
                });
            for (addr, mnv) in asked_updates {
                inner.asked.insert(addr, mnv);
            }
        }
        for (addr, mnv) in dispatch {
            sync.add_fulfilled(addr, FULFILLED_REQUEST, now);
            self.net
                .push(NetEvent::Connect(addr, MasternodeMessage::Verify(mnv)));
        }
    }

    /// Phase 1: somebody asked us to prove we control our address.
    pub fn send_verify_reply(
        &self,
        peer: SocketAddr,
        mut mnv: MasternodeVerification,
        active: Option<&ActiveMasternode>,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) {
        let active = match active {
            Some(active) => active,
            None => {
                // A malicious node might be probing with our IP; do not ban.
                warn!("pose -- asked to verify but this node is not a masternode");
                return;
            }
        };
        let now = chain.adjusted_time();
        if sync.has_fulfilled(peer, FULFILLED_REPLY, now) {
            warn!("pose -- peer {} already asked for a verify reply recently", peer);
            self.net.push(NetEvent::Misbehave(peer, 20));
            return;
        }
        let block_hash = match chain.block_hash(mnv.block_height) {
            Some(hash) => hash,
            None => {
                info!(
                    "pose -- can't reply to verify for unknown block height {}",
                    mnv.block_height
                );
                return;
            }
        };

        let tip = chain.tip_height();
        mnv.sig1 = signing::sign_dual(
            &active.operator_keys,
            tip,
            &mnv.signature_hash1(&block_hash),
            &mnv.legacy_message1(&block_hash),
            &self.params,
        );

        self.net.push(NetEvent::Send(peer, MasternodeMessage::Verify(mnv)));
        sync.add_fulfilled(peer, FULFILLED_REPLY, now);
    }

    /// Phase 2: a reply to a challenge we sent. Exactly one registry entry
    /// at the peer's address must verify `sig1`; it gets credited, every
    /// other entry claiming that address takes a ban point, and if we are a
    /// masternode ourselves we countersign and gossip the result.
    pub fn process_verify_reply(
        &self,
        peer: SocketAddr,
        mnv: MasternodeVerification,
        active: Option<&ActiveMasternode>,
        registry: &Registry,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) {
        let now = chain.adjusted_time();

        if !sync.has_fulfilled(peer, FULFILLED_REQUEST, now) {
            warn!("pose -- unsolicited verify reply from {}", peer);
            self.net.push(NetEvent::Misbehave(peer, 20));
            return;
        }
        let ours = {
            let inner = self.inner.lock().unwrap();
            inner.asked.get(&peer).cloned()
        };
        let ours = match ours {
            Some(ours) => ours,
            None => {
                warn!("pose -- we never challenged {}", peer);
                self.net.push(NetEvent::Misbehave(peer, 20));
                return;
            }
        };
        if ours.nonce != mnv.nonce {
            warn!(
                "pose -- wrong nonce from {}: requested={} received={}",
                peer, ours.nonce, mnv.nonce
            );
            self.net.push(NetEvent::Misbehave(peer, 20));
            return;
        }
        if ours.block_height != mnv.block_height {
            warn!(
                "pose -- wrong block height from {}: requested={} received={}",
                peer, ours.block_height, mnv.block_height
            );
            self.net.push(NetEvent::Misbehave(peer, 20));
            return;
        }
        let block_hash = match chain.block_hash(mnv.block_height) {
            Some(hash) => hash,
            None => return,
        };
        if sync.has_fulfilled(peer, FULFILLED_DONE, now) {
            warn!("pose -- already verified {} recently", peer);
            self.net.push(NetEvent::Misbehave(peer, 20));
            return;
        }

        let tip = chain.tip_height();
        let params = self.params.clone();
        let hash1 = mnv.signature_hash1(&block_hash);
        let legacy1 = mnv.legacy_message1(&block_hash);

        let (real, to_ban) = registry.with_map_mut(|map| {
            let mut real: Option<Masternode> = None;
            let mut to_ban: Vec<OutPoint> = Vec::new();
            for mn in map.values_mut() {
                if mn.addr != peer {
                    continue;
                }
                let found = signing::verify_dual(
                    &mn.operator_pubkey,
                    tip,
                    &hash1,
                    &legacy1,
                    &mnv.sig1,
                    &params,
                );
                if found {
                    if !mn.is_pose_verified(&params) {
                        mn.decrease_pose_ban_score(&params);
                    }
                    real = Some(mn.clone());
                } else {
                    to_ban.push(mn.outpoint.clone());
                }
            }
            (real, to_ban)
        });

        let real = match real {
            Some(real) => real,
            None => {
                // Nobody at this address could produce the signature; the
                // peer is gaming the exchange somehow.
                warn!("pose -- no real masternode found for addr {}", peer);
                self.net.push(NetEvent::Misbehave(peer, 20));
                return;
            }
        };
        info!(
            "pose -- verified real masternode {} for addr {}",
            real.outpoint, peer
        );
        sync.add_fulfilled(peer, FULFILLED_DONE, now);

        // Countersign as witness; only an activated masternode may gossip it.
        if let Some(active) = active {
            let mut broadcast = mnv.clone();
            broadcast.addr = real.addr;
            broadcast.outpoint1 = real.outpoint.clone();
            broadcast.outpoint2 = active.outpoint.clone();
            broadcast.sig2 = signing::sign_dual(
                &active.operator_keys,
                tip,
                &broadcast.signature_hash2(&block_hash),
                &broadcast.legacy_message2(&block_hash),
                &self.params,
            );
            {
                let mut inner = self.inner.lock().unwrap();
                inner.asked.insert(peer, broadcast.clone());
                inner.seen.insert(broadcast.hash(), broadcast.clone());
            }
            self.net
                .push(NetEvent::Relay(MasternodeMessage::Verify(broadcast)));
        }

        if !to_ban.is_empty() {
            let count = to_ban.len();
            let params = self.params.clone();
            registry.with_map_mut(|map| {
                for outpoint in to_ban {
                    if let Some(mn) = map.get_mut(&outpoint) {
                        mn.increase_pose_ban_score(&params);
                        debug!(
                            "pose -- ban score for fake masternode {} now {}",
                            outpoint, mn.pose_ban_score
                        );
                    }
                }
            });
            debug!("pose -- score increased for {} fake masternodes at {}", count, peer);
        }
    }

    /// Phase 3: a fully signed verification gossiped by a witness.
    pub fn process_verify_broadcast(
        &self,
        peer: SocketAddr,
        mnv: MasternodeVerification,
        registry: &Registry,
        chain: &dyn ChainView,
        sync: &SyncCoordinator,
    ) {
        {
            let mut inner = self.inner.lock().unwrap();
            let hash = mnv.hash();
            if inner.seen.contains_key(&hash) {
                return;
            }
            inner.seen.insert(hash, mnv.clone());
        }
        let tip = chain.tip_height();
        if mnv.block_height < tip.saturating_sub(MAX_POSE_BLOCKS) {
            debug!(
                "pose -- outdated verification: current block {}, verification block {}",
                tip, mnv.block_height
            );
            return;
        }
        if mnv.outpoint1 == mnv.outpoint2 {
            // Cheating by verifying oneself earns the maximum penalty.
            warn!(
                "pose -- verification with identical outpoints {} from {}",
                mnv.outpoint1, peer
            );
            self.net.push(NetEvent::Misbehave(peer, 100));
            return;
        }
        let block_hash = match chain.block_hash(mnv.block_height) {
            Some(hash) => hash,
            None => return,
        };
        let witness_rank = match registry.rank_of(
            &mnv.outpoint2,
            mnv.block_height,
            self.params.min_protocol_version,
            chain,
            sync,
        ) {
            Ok(Some(rank)) => rank,
            _ => {
                info!("pose -- can't calculate rank for witness {}", mnv.outpoint2);
                return;
            }
        };
        if witness_rank > MAX_POSE_RANK {
            info!(
                "pose -- witness {} is not in top {} (rank {})",
                mnv.outpoint2, MAX_POSE_RANK, witness_rank
            );
            self.net.push(NetEvent::Misbehave(peer, 20));
            return;
        }

        let params = self.params.clone();
        let hash1 = mnv.signature_hash1(&block_hash);
        let legacy1 = mnv.legacy_message1(&block_hash);
        let hash2 = mnv.signature_hash2(&block_hash);
        let legacy2 = mnv.legacy_message2(&block_hash);

        let verified = registry.with_map_mut(|map| {
            let target = match map.get(&mnv.outpoint1) {
                Some(mn) => mn.clone(),
                None => {
                    info!("pose -- can't find masternode1 {}", mnv.outpoint1);
                    return None;
                }
            };
            let witness = match map.get(&mnv.outpoint2) {
                Some(mn) => mn.clone(),
                None => {
                    info!("pose -- can't find masternode2 {}", mnv.outpoint2);
                    return None;
                }
            };
            if target.addr != mnv.addr {
                info!(
                    "pose -- address {} does not match {} for {}",
                    mnv.addr, target.addr, mnv.outpoint1
                );
                return None;
            }
            let sig1_ok = signing::verify_dual(
                &target.operator_pubkey,
                tip,
                &hash1,
                &legacy1,
                &mnv.sig1,
                &params,
            );
            let sig2_ok = signing::verify_dual(
                &witness.operator_pubkey,
                tip,
                &hash2,
                &legacy2,
                &mnv.sig2,
                &params,
            );
            if !sig1_ok || !sig2_ok {
                return Some(Err(()));
            }

            if let Some(mn) = map.get_mut(&mnv.outpoint1) {
                if !mn.is_pose_verified(&params) {
                    mn.decrease_pose_ban_score(&params);
                }
            }
            // Everyone else claiming this address is an impostor.
            let mut banned = 0;
            for mn in map.values_mut() {
                if mn.addr != mnv.addr || mn.outpoint == mnv.outpoint1 {
                    continue;
                }
                mn.increase_pose_ban_score(&params);
                banned += 1;
            }
            Some(Ok(banned))
        });

        match verified {
            Some(Ok(banned)) => {
                debug!(
                    "pose -- verified masternode {} for addr {}, {} impostors penalized",
                    mnv.outpoint1, mnv.addr, banned
                );
                self.net.push(NetEvent::Relay(MasternodeMessage::Verify(mnv)));
            }
            Some(Err(())) => {
                info!("pose -- bad signature in verification from {}", peer);
                self.net.push(NetEvent::Misbehave(peer, 20));
            }
            None => {}
        }
    }

    /// Ages the verification caches relative to the tip.
    pub fn cleanup(&self, tip: u64) {
        let cutoff = tip.saturating_sub(MAX_POSE_BLOCKS);
        let mut inner = self.inner.lock().unwrap();
        inner.seen.retain(|_, mnv| mnv.block_height >= cutoff);
        inner.asked.retain(|_, mnv| mnv.block_height >= cutoff);
    }
}
