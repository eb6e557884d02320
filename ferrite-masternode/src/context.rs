//! The single value wiring the masternode components together.
//!
//! Handlers and the scheduler receive a [`MasternodeContext`] instead of
//! reaching for process-wide state; everything mutable lives inside the
//! components it belongs to.

use std::net::SocketAddr;
use std::path::Path;

use log::{debug, warn};

use ferrite_shared_types::masternode::MasternodeParams;
use ferrite_shared_types::p2p::{Inv, MasternodeMessage, NetEvent};

use crate::active::ActiveMasternode;
use crate::chain::{ChainView, UtxoView};
use crate::error::{MasternodeError, Result};
use crate::net::NetQueue;
use crate::payments::{ElectionDump, PaymentElection};
use crate::pose::PoSeVerifier;
use crate::registry::{Registry, RegistryDump};
use crate::store;
use crate::sync::SyncCoordinator;

const REGISTRY_CACHE_FILE: &str = "mncache.dat";
const ELECTION_CACHE_FILE: &str = "mnpayments.dat";

pub struct MasternodeContext {
    pub params: MasternodeParams,
    pub registry: Registry,
    pub election: PaymentElection,
    pub verifier: PoSeVerifier,
    pub sync: SyncCoordinator,
    /// Present when this node runs as a masternode.
    pub active: Option<ActiveMasternode>,
    net: NetQueue,
}

impl MasternodeContext {
    pub fn new(params: MasternodeParams, active: Option<ActiveMasternode>) -> Self {
        let net = NetQueue::new();
        MasternodeContext {
            registry: Registry::new(params.clone(), net.clone()),
            election: PaymentElection::new(params.clone(), net.clone()),
            verifier: PoSeVerifier::new(params.clone(), net.clone()),
            sync: SyncCoordinator::new(params.clone(), net.clone()),
            params,
            active,
            net,
        }
    }

    /// Outbound effects accumulated since the last drain. The transport
    /// performs them; nothing here blocks.
    pub fn drain_net_events(&self) -> Vec<NetEvent> {
        self.net.drain()
    }

    /// Classifies and dispatches one inbound wire message. Each payload
    /// mutates exactly one component's state.
    pub fn handle_message(
        &self,
        peer: SocketAddr,
        message: MasternodeMessage,
        chain: &dyn ChainView,
        utxo: &dyn UtxoView,
    ) {
        if chain.is_lite_mode() {
            debug!("context -- lite mode, masternode messages disabled");
            return;
        }
        match message {
            MasternodeMessage::Announce(mnb) => {
                if !self.sync.is_blockchain_synced() {
                    return;
                }
                let outpoint = mnb.outpoint.clone();
                match self.registry.update_from_broadcast(
                    Some(peer),
                    mnb,
                    chain,
                    utxo,
                    &self.sync,
                    self.active.as_ref(),
                ) {
                    Ok(_) | Err(MasternodeError::Duplicate) => {}
                    Err(err) => debug!("context -- broadcast from {} dropped: {}", outpoint, err),
                }
            }
            MasternodeMessage::Ping(ping) => {
                if !self.sync.is_blockchain_synced() {
                    return;
                }
                let outpoint = ping.outpoint.clone();
                match self.registry.process_ping(Some(peer), ping, chain, &self.sync) {
                    Ok(()) | Err(MasternodeError::Duplicate) => {}
                    Err(err) => debug!("context -- ping from {} dropped: {}", outpoint, err),
                }
            }
            MasternodeMessage::GetList(outpoint) => {
                self.registry.process_get_list(peer, outpoint, chain, &self.sync);
            }
            MasternodeMessage::Verify(mnv) => {
                if !self.sync.is_list_synced() {
                    return;
                }
                if mnv.sig1.is_empty() {
                    // Someone asked us to verify the IP we are using.
                    self.verifier.send_verify_reply(
                        peer,
                        mnv,
                        self.active.as_ref(),
                        chain,
                        &self.sync,
                    );
                } else if mnv.sig2.is_empty() {
                    self.verifier.process_verify_reply(
                        peer,
                        mnv,
                        self.active.as_ref(),
                        &self.registry,
                        chain,
                        &self.sync,
                    );
                } else {
                    self.verifier.process_verify_broadcast(
                        peer,
                        mnv,
                        &self.registry,
                        chain,
                        &self.sync,
                    );
                }
            }
            MasternodeMessage::PaymentSync => {
                if !self.sync.is_synced() {
                    return;
                }
                let now = chain.adjusted_time();
                if self.sync.has_fulfilled(peer, "mnget", now) {
                    warn!("context -- peer {} asked for payment sync too often", peer);
                    self.net.push(NetEvent::Misbehave(peer, 20));
                    return;
                }
                self.sync.add_fulfilled(peer, "mnget", now);
                self.election.sync_payment_votes(peer, &self.sync);
            }
            MasternodeMessage::PaymentVotePrimary(vote) => {
                let voter = vote.voter_outpoint.clone();
                match self.election.process_vote(
                    Some(peer),
                    vote,
                    self.active.is_some(),
                    &self.registry,
                    chain,
                    &self.sync,
                ) {
                    Ok(_) | Err(MasternodeError::Duplicate) => {}
                    Err(err) => debug!("context -- vote from {} dropped: {}", voter, err),
                }
            }
            MasternodeMessage::PaymentVoteSecondary(_) => {
                // Reserved message class: decoded, never processed.
            }
            MasternodeMessage::SyncStatusCount { asset, count } => {
                self.sync
                    .process_sync_status_count(peer, asset, count, chain.adjusted_time());
            }
            MasternodeMessage::Inv(invs) => {
                let unknown: Vec<Inv> = invs
                    .into_iter()
                    .filter(|inv| !self.registry.has_inv(inv) && !self.election.has_inv(inv))
                    .collect();
                if !unknown.is_empty() {
                    self.net.push(NetEvent::Send(peer, MasternodeMessage::GetData(unknown)));
                }
            }
            MasternodeMessage::GetData(invs) => {
                self.registry.serve_get_data(peer, &invs);
                self.election.serve_get_data(peer, &invs, chain);
            }
        }
    }

    /// Per-block pipeline: cache refresh, duplicate-address policing, the
    /// last-paid scan, vote accounting and our own vote for `tip + 10`.
    pub fn on_block_tip(&self, height: u64, chain: &dyn ChainView, utxo: &dyn UtxoView) {
        self.registry.updated_block_tip(height);
        self.verifier.check_same_addr(&self.registry, &self.sync);

        let limit = crate::sync::storage_limit(&self.params, self.registry.size());
        self.registry
            .update_last_paid(chain, &self.sync, &|h| self.election.has_block(h), limit);

        self.election.updated_block_tip(
            height,
            self.active.as_ref(),
            &self.registry,
            chain,
            utxo,
            &self.sync,
        );
    }

    /// Periodic maintenance driven by the node scheduler.
    pub fn tick(&self, peers: &[SocketAddr], chain: &dyn ChainView, utxo: &dyn UtxoView) {
        let now = chain.adjusted_time();
        self.sync.process_tick(now, peers);

        // Once the winners list is in, backfill weak payment blocks from
        // each peer, one sweep per peer per interval.
        if self.sync.is_winners_synced() {
            for peer in peers {
                if self.sync.has_fulfilled(*peer, "mnw-lowdata", now) {
                    continue;
                }
                self.sync.add_fulfilled(*peer, "mnw-lowdata", now);
                self.election.request_low_data_payment_blocks(
                    *peer,
                    self.registry.size(),
                    chain,
                    &self.sync,
                );
            }
        }

        self.registry.check_and_remove(chain, utxo, &self.sync);
        self.election.check_and_remove(self.registry.size(), &self.sync);
        self.verifier.do_full_verification_step(
            self.active.as_ref(),
            &self.registry,
            chain,
            &self.sync,
        );
        self.verifier.process_pending_requests(now, &self.sync);
        self.registry.process_pending_broadcast_requests(now);
        self.verifier.cleanup(chain.tip_height());
        self.registry.warn_daemon_updates(&self.sync);
    }

    /// A new peer connected; start syncing from it if appropriate.
    pub fn on_peer_connected(&self, peer: SocketAddr, chain: &dyn ChainView) {
        self.sync.dseg_update(peer, chain.adjusted_time());
    }

    /// Writes the registry and election caches under `dir`.
    pub fn save_caches(&self, dir: &Path) -> Result<()> {
        store::save(
            &dir.join(REGISTRY_CACHE_FILE),
            &store::registry_magic(),
            &self.registry.dump(),
        )?;
        store::save(
            &dir.join(ELECTION_CACHE_FILE),
            &store::election_magic(),
            &self.election.dump(),
        )?;
        Ok(())
    }

    /// Restores both caches. Any format or checksum mismatch surfaces as a
    /// `Storage` error; the caller should then start from a fresh sync.
    pub fn load_caches(&self, dir: &Path) -> Result<()> {
        let registry: RegistryDump =
            store::load(&dir.join(REGISTRY_CACHE_FILE), &store::registry_magic())?;
        self.registry.restore(registry);
        let election: ElectionDump =
            store::load(&dir.join(ELECTION_CACHE_FILE), &store::election_magic())?;
        self.election.restore(election);
        Ok(())
    }
}
