//! Request/response flow control: who asked whom for what, when a retry
//! is allowed, and how far along the initial masternode sync is.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use log::{debug, info, warn};

use ferrite_shared_types::masternode::MasternodeParams;
use ferrite_shared_types::p2p::{MasternodeMessage, NetEvent, SyncAsset};
use ferrite_shared_types::OutPoint;

use crate::constants::{DSEG_UPDATE_SECONDS, SYNC_TIMEOUT_SECONDS};
use crate::net::NetQueue;

/// Progression of the initial masternode sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPhase {
    /// Waiting for the blockchain itself.
    Waiting,
    /// Fetching the masternode list.
    List,
    /// Fetching payment winners.
    Winners,
    Finished,
}

struct SyncInner {
    phase: SyncPhase,
    blockchain_synced: bool,
    last_bump: i64,
    /// Peers that asked us for the full list, with re-ask deadlines.
    asked_us_for_list: HashMap<SocketAddr, i64>,
    /// Peers we asked for the full list.
    we_asked_for_list: HashMap<SocketAddr, i64>,
    /// Targeted per-outpoint asks, keyed by squashed peer address.
    we_asked_for_entry: HashMap<OutPoint, HashMap<SocketAddr, i64>>,
    /// Generic fulfilled-request store (verify-request, payment sync, ...).
    fulfilled: HashMap<(SocketAddr, &'static str), i64>,
}

/// Coordinates sync progression and rate limits the chatter around it.
pub struct SyncCoordinator {
    params: MasternodeParams,
    net: NetQueue,
    inner: std::sync::Mutex<SyncInner>,
}

/// Multiple ports on one host count as one peer for rate limiting.
pub fn squash_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip(), 0)
}

/// Private and loopback addresses are neither served nor dialed.
pub fn is_routable(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => {
            !(ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified())
        }
        IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_unspecified()),
    }
}

/// Vote retention window in blocks for the current network size.
pub fn storage_limit(params: &MasternodeParams, masternode_count: usize) -> u64 {
    let scaled = (masternode_count as f64 * params.storage_coeff) as u64;
    scaled.max(params.min_blocks_to_store)
}

impl SyncCoordinator {
    pub fn new(params: MasternodeParams, net: NetQueue) -> Self {
        SyncCoordinator {
            params,
            net,
            inner: std::sync::Mutex::new(SyncInner {
                phase: SyncPhase::Waiting,
                blockchain_synced: false,
                last_bump: 0,
                asked_us_for_list: HashMap::new(),
                we_asked_for_list: HashMap::new(),
                we_asked_for_entry: HashMap::new(),
                fulfilled: HashMap::new(),
            }),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.lock().unwrap().phase
    }

    pub fn is_blockchain_synced(&self) -> bool {
        self.inner.lock().unwrap().blockchain_synced
    }

    pub fn set_blockchain_synced(&self, synced: bool, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        if synced && !inner.blockchain_synced {
            info!("sync -- blockchain reported synced, starting masternode list sync");
            inner.last_bump = now;
        }
        inner.blockchain_synced = synced;
        if !synced {
            inner.phase = SyncPhase::Waiting;
        }
    }

    /// The masternode list itself is usable.
    pub fn is_list_synced(&self) -> bool {
        self.inner.lock().unwrap().phase > SyncPhase::List
    }

    /// The winners list is usable.
    pub fn is_winners_synced(&self) -> bool {
        self.inner.lock().unwrap().phase > SyncPhase::Winners
    }

    pub fn is_synced(&self) -> bool {
        self.inner.lock().unwrap().phase == SyncPhase::Finished
    }

    /// Records sync progress; resets the per-phase inactivity timeout.
    pub fn bump(&self, reason: &str, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_bump = now;
        debug!("sync -- bumped by {}", reason);
    }

    fn advance(inner: &mut SyncInner, now: i64) {
        inner.phase = match inner.phase {
            SyncPhase::Waiting => SyncPhase::List,
            SyncPhase::List => SyncPhase::Winners,
            SyncPhase::Winners => SyncPhase::Finished,
            SyncPhase::Finished => SyncPhase::Finished,
        };
        inner.last_bump = now;
        info!("sync -- advanced to {:?}", inner.phase);
    }

    pub fn reset(&self, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.phase = SyncPhase::Waiting;
        inner.last_bump = now;
        warn!("sync -- reset to {:?}", inner.phase);
    }

    /// Used by tests and by nodes restored from a trusted snapshot.
    pub fn force_finished(&self) {
        self.inner.lock().unwrap().phase = SyncPhase::Finished;
    }

    /// Drives the sync state machine and emits data requests to peers.
    pub fn process_tick(&self, now: i64, peers: &[SocketAddr]) {
        let requests: Vec<(SocketAddr, MasternodeMessage)> = {
            let mut inner = self.inner.lock().unwrap();
            match inner.phase {
                SyncPhase::Waiting => {
                    if inner.blockchain_synced {
                        Self::advance(&mut inner, now);
                    }
                    Vec::new()
                }
                SyncPhase::List | SyncPhase::Winners => {
                    // No new data for a while means the asset is as synced
                    // as the network will get it.
                    if now - inner.last_bump > SYNC_TIMEOUT_SECONDS {
                        Self::advance(&mut inner, now);
                        return;
                    }
                    let want_list = inner.phase == SyncPhase::List;
                    let mut out = Vec::new();
                    for peer in peers {
                        if !is_routable(peer) {
                            continue;
                        }
                        let squashed = squash_addr(*peer);
                        if want_list {
                            let entry = inner.we_asked_for_list.entry(squashed).or_insert(0);
                            if *entry <= now {
                                *entry = now + DSEG_UPDATE_SECONDS;
                                out.push((*peer, MasternodeMessage::GetList(OutPoint::null())));
                            }
                        } else {
                            let key = (squashed, "mnget-sent");
                            let expiry = inner.fulfilled.entry(key).or_insert(0);
                            if *expiry <= now {
                                *expiry = now + DSEG_UPDATE_SECONDS;
                                out.push((*peer, MasternodeMessage::PaymentSync));
                            }
                        }
                    }
                    out
                }
                SyncPhase::Finished => Vec::new(),
            }
        };

        for (peer, message) in requests {
            self.net.push(NetEvent::Send(peer, message));
        }
    }

    /// Pacing signal from a peer that finished serving one asset.
    pub fn process_sync_status_count(&self, peer: SocketAddr, asset: SyncAsset, count: u32, now: i64) {
        debug!("sync -- ssc from {}: {:?} count={}", peer, asset, count);
        self.bump("sync status count", now);
    }

    /// Outbound full-list request towards a newly connected peer.
    pub fn dseg_update(&self, peer: SocketAddr, now: i64) {
        if !is_routable(&peer) {
            debug!("sync -- not asking local peer {} for the list", peer);
            return;
        }
        let squashed = squash_addr(peer);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(deadline) = inner.we_asked_for_list.get(&squashed) {
                if now < *deadline {
                    debug!("sync -- already asked {} for the list, skipping", squashed);
                    return;
                }
            }
            inner.we_asked_for_list.insert(squashed, now + DSEG_UPDATE_SECONDS);
        }
        self.net.push(NetEvent::Send(peer, MasternodeMessage::GetList(OutPoint::null())));
        info!("sync -- asked {} for the masternode list", peer);
    }

    /// Rate-gates an inbound full-list request. Returns false when the peer
    /// violated the interval (the caller penalizes it).
    pub fn allow_full_list_request(&self, peer: SocketAddr, now: i64) -> bool {
        let squashed = squash_addr(peer);
        let mut inner = self.inner.lock().unwrap();
        if let Some(deadline) = inner.asked_us_for_list.get(&squashed) {
            if now < *deadline {
                return false;
            }
        }
        inner.asked_us_for_list.insert(squashed, now + DSEG_UPDATE_SECONDS);
        true
    }

    /// Targeted ask for one missing masternode entry, at most once per
    /// interval per (outpoint, squashed peer).
    pub fn ask_for_mn(&self, peer: SocketAddr, outpoint: &OutPoint, now: i64) {
        let squashed = squash_addr(peer);
        {
            let mut inner = self.inner.lock().unwrap();
            let asks = inner.we_asked_for_entry.entry(outpoint.clone()).or_default();
            if let Some(deadline) = asks.get(&squashed) {
                if now < *deadline {
                    debug!("sync -- recently asked {} for {}, skipping", squashed, outpoint);
                    return;
                }
                info!("sync -- asking {} for missing masternode {} again", squashed, outpoint);
            } else {
                debug!("sync -- asking {} for missing masternode {}", squashed, outpoint);
            }
            asks.insert(squashed, now + DSEG_UPDATE_SECONDS);
        }
        self.net.push(NetEvent::Send(peer, MasternodeMessage::GetList(outpoint.clone())));
    }

    /// Whether we already asked `addr` for this outpoint recently; used to
    /// avoid bans while picking recovery peers.
    pub fn was_entry_asked(&self, outpoint: &OutPoint, addr: SocketAddr, now: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .we_asked_for_entry
            .get(outpoint)
            .and_then(|asks| asks.get(&squash_addr(addr)))
            .map(|deadline| now < *deadline)
            .unwrap_or(false)
    }

    pub fn forget_outpoint(&self, outpoint: &OutPoint) {
        self.inner.lock().unwrap().we_asked_for_entry.remove(outpoint);
    }

    pub fn has_fulfilled(&self, peer: SocketAddr, key: &'static str, now: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .fulfilled
            .get(&(squash_addr(peer), key))
            .map(|expiry| now < *expiry)
            .unwrap_or(false)
    }

    pub fn add_fulfilled(&self, peer: SocketAddr, key: &'static str, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.fulfilled.insert((squash_addr(peer), key), now + DSEG_UPDATE_SECONDS);
    }

    /// Expires all TTL bookkeeping.
    pub fn maintenance(&self, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.asked_us_for_list.retain(|_, deadline| *deadline > now);
        inner.we_asked_for_list.retain(|_, deadline| *deadline > now);
        inner.we_asked_for_entry.retain(|_, asks| {
            asks.retain(|_, deadline| *deadline > now);
            !asks.is_empty()
        });
        inner.fulfilled.retain(|_, expiry| *expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> SyncCoordinator {
        SyncCoordinator::new(MasternodeParams::default(), NetQueue::new())
    }

    #[test]
    fn full_list_requests_are_rate_limited_per_host() {
        let sync = coordinator();
        let peer_a: SocketAddr = "51.15.1.1:9999".parse().unwrap();
        let peer_b: SocketAddr = "51.15.1.1:10001".parse().unwrap();

        assert!(sync.allow_full_list_request(peer_a, 1_000));
        // Different port, same host: still limited.
        assert!(!sync.allow_full_list_request(peer_b, 1_000));
        assert!(sync.allow_full_list_request(peer_a, 1_000 + DSEG_UPDATE_SECONDS + 1));
    }

    #[test]
    fn targeted_asks_squash_ports() {
        let sync = coordinator();
        let outpoint = OutPoint::new([1u8; 32], 0);
        let peer_a: SocketAddr = "51.15.1.2:9999".parse().unwrap();
        let peer_b: SocketAddr = "51.15.1.2:19999".parse().unwrap();

        sync.ask_for_mn(peer_a, &outpoint, 1_000);
        sync.ask_for_mn(peer_b, &outpoint, 1_001);
        // Only the first ask went out.
        let events = sync.net.drain();
        assert_eq!(events.len(), 1);
        assert!(sync.was_entry_asked(&outpoint, peer_b, 1_002));
    }

    #[test]
    fn phase_machine_advances_on_timeout() {
        let sync = coordinator();
        assert_eq!(sync.phase(), SyncPhase::Waiting);
        sync.set_blockchain_synced(true, 0);
        sync.process_tick(0, &[]);
        assert_eq!(sync.phase(), SyncPhase::List);
        assert!(!sync.is_list_synced());

        sync.process_tick(SYNC_TIMEOUT_SECONDS + 1, &[]);
        assert_eq!(sync.phase(), SyncPhase::Winners);
        assert!(sync.is_list_synced());

        sync.process_tick(2 * SYNC_TIMEOUT_SECONDS + 2, &[]);
        assert!(sync.is_synced());
        assert!(sync.is_winners_synced());
    }

    #[test]
    fn rfc1918_is_not_routable() {
        assert!(!is_routable(&"10.0.0.1:9999".parse().unwrap()));
        assert!(!is_routable(&"192.168.1.1:9999".parse().unwrap()));
        assert!(!is_routable(&"127.0.0.1:9999".parse().unwrap()));
        assert!(is_routable(&"51.15.1.1:9999".parse().unwrap()));
    }

    #[test]
    fn storage_limit_has_floor() {
        let params = MasternodeParams::default();
        assert_eq!(storage_limit(&params, 10), params.min_blocks_to_store);
        let big = storage_limit(&params, 10_000);
        assert_eq!(big, (10_000f64 * params.storage_coeff) as u64);
    }
}
