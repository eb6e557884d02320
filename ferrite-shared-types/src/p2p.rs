//! Wire-level message types for the masternode subsystem.
//!
//! The transport layer frames and routes these; the coordination core only
//! classifies payloads and emits [`NetEvent`]s for the transport to drain.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::masternode::{
    MasternodeBroadcast, MasternodePaymentVote, MasternodePing, MasternodeVerification,
};
use crate::{Hash, OutPoint};

/// Sync assets announced in `SyncStatusCount` pacing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAsset {
    MasternodeList,
    WinnersList,
}

/// Inventory object classes for masternode data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvKind {
    MasternodeAnnounce,
    MasternodePing,
    PaymentVotePrimary,
    PaymentBlockPrimary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash,
}

impl Inv {
    pub fn new(kind: InvKind, hash: Hash) -> Self {
        Inv { kind, hash }
    }
}

/// Every masternode-subsystem message that crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasternodeMessage {
    /// Full broadcast record, gossiped and served on request.
    Announce(MasternodeBroadcast),
    /// Signed liveness proof.
    Ping(MasternodePing),
    /// List request; the null outpoint asks for the full list.
    GetList(OutPoint),
    /// Verification in one of its three phase shapes.
    Verify(MasternodeVerification),
    /// Request for payment votes covering upcoming blocks. A legacy 32-bit
    /// count payload is tolerated and discarded by the handler.
    PaymentSync,
    PaymentVotePrimary(MasternodePaymentVote),
    /// Reserved: decoded and dropped without penalty.
    PaymentVoteSecondary(MasternodePaymentVote),
    SyncStatusCount { asset: SyncAsset, count: u32 },
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
}

impl MasternodeMessage {
    pub fn command(&self) -> &'static str {
        match self {
            MasternodeMessage::Announce(_) => "mnb",
            MasternodeMessage::Ping(_) => "mnp",
            MasternodeMessage::GetList(_) => "dseg",
            MasternodeMessage::Verify(_) => "mnv",
            MasternodeMessage::PaymentSync => "mnget",
            MasternodeMessage::PaymentVotePrimary(_) => "mnw",
            MasternodeMessage::PaymentVoteSecondary(_) => "mnws",
            MasternodeMessage::SyncStatusCount { .. } => "ssc",
            MasternodeMessage::Inv(_) => "inv",
            MasternodeMessage::GetData(_) => "getdata",
        }
    }
}

/// Outbound effects produced by the handlers. Components push these onto a
/// shared queue; the transport drains the queue after every call into the
/// core, so no component lock is ever held across real I/O.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// Gossip to all connected peers.
    Relay(MasternodeMessage),
    /// Directed send to one peer.
    Send(SocketAddr, MasternodeMessage),
    /// Ask the transport to open (or reuse) a connection to a masternode
    /// address and deliver the message once connected.
    Connect(SocketAddr, MasternodeMessage),
    /// Penalize a misbehaving peer.
    Misbehave(SocketAddr, u32),
    /// User-visible advisory (daemon version warnings and the like).
    Warning(String),
}
