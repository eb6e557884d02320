//! Protocol constants for the masternode subsystem.

/// Minimum interval between full-list requests to (or from) one peer.
pub const DSEG_UPDATE_SECONDS: i64 = 3 * 60 * 60;

/// How many broadcast-recovery requests may be started per maintenance pass.
pub const MNB_RECOVERY_MAX_ASK_ENTRIES: usize = 10;

/// Number of ranked peers asked for a missing broadcast.
pub const MNB_RECOVERY_QUORUM_TOTAL: usize = 10;

/// Distinct good replies needed before a recovered broadcast is reprocessed.
pub const MNB_RECOVERY_QUORUM_REQUIRED: usize = 6;

/// How long to wait for recovery replies before tallying them.
pub const MNB_RECOVERY_WAIT_SECONDS: i64 = 60;

/// A failed recovery may be retried after this long.
pub const MNB_RECOVERY_RETRY_SECONDS: i64 = 3 * 60 * 60;

/// Only nodes ranked this high send verification requests, and only
/// witnesses ranked this high are accepted.
pub const MAX_POSE_RANK: usize = 10;

/// Verification requests dispatched per round, also the rank step between
/// chosen targets.
pub const MAX_POSE_CONNECTIONS: usize = 10;

/// Verifications older than this many blocks are dropped.
pub const MAX_POSE_BLOCKS: u64 = 576;

/// Number of top-ranked masternodes eligible to vote per block.
pub const SIGNATURES_TOTAL: usize = 10;

/// Votes agreeing on one payee that constitute a win.
pub const SIGNATURES_REQUIRED: usize = 6;

/// Coinbase maturity; rank queries look back `COINBASE_MATURITY + 1` blocks.
pub const COINBASE_MATURITY: u64 = 100;

/// Fixed lookback from an event height to its ranking block.
pub const RANK_LOOKBACK: u64 = COINBASE_MATURITY + 1;

/// Votes are accepted up to this many blocks past the current tip.
pub const VOTE_FUTURE_WINDOW: u64 = 20;

/// Own votes target the block this far past the tip.
pub const VOTE_LEAD_BLOCKS: u64 = 10;

/// Scheduling lookahead used to avoid double-paying one masternode.
pub const SCHEDULE_LOOKAHEAD: u64 = 8;

/// Pending outbound connections are abandoned after this long.
pub const PENDING_REQUEST_TIMEOUT_SECONDS: i64 = 15;

/// Coinbase output index of the primary masternode payment; secondaries
/// occupy the following `secondaries_max_count` positions.
pub const PRIMARY_PAYMENT_POSITION: usize = 6;

/// Maximum inventory entries per getdata batch.
pub const MAX_INV_BATCH: usize = 50_000;

/// A sync phase with no progress for this long is assumed complete.
pub const SYNC_TIMEOUT_SECONDS: i64 = 30;

/// Pings anchored more than this many blocks behind the tip are stale.
pub const PING_MAX_BLOCK_DEPTH: u64 = 24;
