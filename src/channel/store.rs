use std::net::SocketAddr;

use secp256k1::PublicKey;

use crate::chain::{OutPoint, ShortChannelId, Transaction};
use crate::store::StoreError;

use super::types::{
    ChannelCloseSummary, CommitDiff, Commitment, ForwardingPackage, OpenChannel,
};

/// The durable channel state contract. The store owns every channel record;
/// callers hold an `OpenChannel` as an opaque handle and hand it back per
/// operation, which refreshes the in-memory copy alongside the durable one.
///
/// Each mutation is applied atomically: concurrent readers observe either
/// the pre- or the post-state of an operation, never a mix.
pub trait ChannelStateStore {
    /// Persist a freshly created channel as pending open. The broadcast
    /// height is recorded so a restarted node can resume watching for the
    /// funding confirmation.
    fn sync_pending(
        &self,
        channel: &mut OpenChannel,
        addr: SocketAddr,
        broadcast_height: u32,
    ) -> Result<(), StoreError>;

    /// Promote a pending channel to open, recording where the funding
    /// transaction confirmed. Applying the same location twice is a no-op;
    /// a different location fails.
    fn mark_as_open(
        &self,
        channel: &mut OpenChannel,
        location: ShortChannelId,
    ) -> Result<(), StoreError>;

    /// Reload the confirmed location into a handle that may have been cached
    /// by another subsystem before `mark_as_open` ran elsewhere.
    fn refresh_short_chan_id(&self, channel: &mut OpenChannel) -> Result<(), StoreError>;

    fn fetch_open_channels(&self, node: &PublicKey) -> Result<Vec<OpenChannel>, StoreError>;

    fn fetch_pending_channels(&self) -> Result<Vec<OpenChannel>, StoreError>;

    fn fetch_all_channels(&self) -> Result<Vec<OpenChannel>, StoreError>;

    /// Channels whose commitment has been broadcast but not yet confirmed.
    fn fetch_waiting_close_channels(&self) -> Result<Vec<OpenChannel>, StoreError>;

    fn fetch_closed_channels(
        &self,
        pending_only: bool,
    ) -> Result<Vec<ChannelCloseSummary>, StoreError>;

    /// Replace the local broadcastable commitment. The incoming height must
    /// be exactly one above the current height (or zero on the first write).
    fn update_commitment(
        &self,
        channel: &mut OpenChannel,
        commitment: Commitment,
    ) -> Result<(), StoreError>;

    /// Stage a newly signed commitment for the counterparty. Only one diff
    /// may be staged at a time.
    fn append_remote_commit_chain(
        &self,
        channel: &mut OpenChannel,
        diff: CommitDiff,
    ) -> Result<(), StoreError>;

    /// The currently staged commit diff, if any.
    fn remote_commit_chain_tip(&self, channel: &OpenChannel) -> Result<CommitDiff, StoreError>;

    /// On receipt of the counterparty's revocation: promote the staged diff
    /// to the current remote commitment, push the prior one into the
    /// revocation log keyed by its height, clear the staged slot and record
    /// the forwarding package of now locked-in updates.
    fn advance_commit_chain_tail(
        &self,
        channel: &mut OpenChannel,
        fwd_pkg: ForwardingPackage,
    ) -> Result<(), StoreError>;

    /// A revoked past commitment, used to construct the justice transaction
    /// after a breach.
    fn find_previous_state(
        &self,
        channel: &OpenChannel,
        height: u64,
    ) -> Result<Commitment, StoreError>;

    /// The newest entry of the revocation log.
    fn revocation_log_tail(&self, channel: &OpenChannel) -> Result<Commitment, StoreError>;

    /// Latest durable local commitment height.
    fn commitment_height(&self, channel: &OpenChannel) -> Result<u64, StoreError>;

    /// Transition the channel to waiting-close, persisting the closing
    /// transaction for later rebroadcast.
    fn mark_commitment_broadcasted(
        &self,
        channel: &mut OpenChannel,
        close_tx: Transaction,
    ) -> Result<(), StoreError>;

    fn broadcasted_commitment(&self, channel: &OpenChannel) -> Result<Transaction, StoreError>;

    /// Hot-swap the counterparty's next revocation point after it revoked a
    /// state.
    fn insert_next_revocation(
        &self,
        channel: &mut OpenChannel,
        revocation: PublicKey,
    ) -> Result<(), StoreError>;

    /// Terminal: delete the open channel record, leaving only the close
    /// summary behind. The funding outpoint is never reused.
    fn close_channel(
        &self,
        channel: &OpenChannel,
        summary: ChannelCloseSummary,
    ) -> Result<(), StoreError>;

    /// Move a close summary from pending to fully closed once all funds are
    /// back in the wallet.
    fn mark_chan_fully_closed(&self, chan_point: &OutPoint) -> Result<(), StoreError>;
}
