use std::net::SocketAddr;

use bitflags::bitflags;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::chain::{Atoms, Hash256, MilliAtoms, OutPoint, ShortChannelId, Transaction};
use crate::serde_utils::SliceHex;

use super::revocation::{RevocationProducer, RevocationStore};

bitflags! {
    /// How the channel was negotiated. Single funder channels carry the whole
    /// capacity on the initiator side; tweakless channels use a static remote
    /// payment key.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ChannelType: u8 {
        const SINGLE_FUNDER = 0;
        const DUAL_FUNDER = 1;
        const TWEAKLESS = 1 << 1;
    }

    /// Live status bits of an open channel.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ChannelStatus: u8 {
        const DEFAULT = 0;
        /// The channel is out of sync and no further updates are accepted.
        const BORKED = 1;
        /// A commitment transaction has been broadcast, the channel is
        /// waiting for it to confirm.
        const COMMIT_BROADCASTED = 1 << 1;
    }
}

macro_rules! bits_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u8(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bits = u8::deserialize(deserializer)?;
                Ok($ty::from_bits_truncate(bits))
            }
        }
    };
}

bits_serde!(ChannelType);
bits_serde!(ChannelStatus);

/// Limits a party imposes on the other side of the channel.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChannelConstraints {
    pub dust_limit: Atoms,
    pub max_pending_amount: MilliAtoms,
    pub chan_reserve: Atoms,
    pub min_htlc: MilliAtoms,
    pub max_accepted_htlcs: u16,
    pub csv_delay: u16,
}

/// Locates a key within the wallet's derivation tree, so a restored node can
/// re-derive it without storing private material.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KeyLocator {
    pub family: u32,
    pub index: u32,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub pub_key: PublicKey,
    pub key_locator: KeyLocator,
}

/// Per-side channel parameters: limits plus the five base points the
/// commitment scripts are built from.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    pub constraints: ChannelConstraints,
    pub multi_sig_key: KeyDescriptor,
    pub revocation_base_point: KeyDescriptor,
    pub payment_base_point: KeyDescriptor,
    pub delay_base_point: KeyDescriptor,
    pub htlc_base_point: KeyDescriptor,
}

/// An in-flight payment leg as it appears on a commitment transaction.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Htlc {
    pub signature: Vec<u8>,
    pub incoming: bool,
    pub amount: MilliAtoms,
    pub payment_hash: Hash256,
    /// Absolute block height after which the sender can reclaim the HTLC.
    pub refund_timeout: u32,
    /// Output position on the commitment transaction, -1 for dust.
    pub output_index: i32,
    pub log_index: u64,
    pub htlc_index: u64,
    #[serde_as(as = "SliceHex")]
    pub onion_blob: Vec<u8>,
}

impl Htlc {
    pub fn is_dust(&self) -> bool {
        self.output_index < 0
    }
}

/// A snapshot of one side's commitment transaction at a given height.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Commitment {
    pub commit_height: u64,
    pub local_log_index: u64,
    pub local_htlc_index: u64,
    pub remote_log_index: u64,
    pub remote_htlc_index: u64,
    pub local_balance: MilliAtoms,
    pub remote_balance: MilliAtoms,
    pub commit_fee: Atoms,
    pub fee_per_kb: Atoms,
    pub commit_tx: Transaction,
    pub commit_sig: Vec<u8>,
    pub htlcs: Vec<Htlc>,
}

/// Identifies the incoming leg of a forwarded HTLC: which channel it arrived
/// on and its htlc index there.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct CircuitKey {
    pub chan_id: ShortChannelId,
    pub htlc_id: u64,
}

impl ::core::fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "({}, {})", self.chan_id, self.htlc_id)
    }
}

/// A single entry of the channel update log, replayed to the switch when a
/// commitment locks in.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogUpdate {
    pub log_index: u64,
    pub update_msg: UpdateMsg,
}

/// The subset of wire updates a commitment can carry. The framing layer owns
/// the full message set, the store only needs to replay these.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpdateMsg {
    AddHtlc {
        htlc_id: u64,
        amount: MilliAtoms,
        payment_hash: Hash256,
        expiry: u32,
        #[serde_as(as = "SliceHex")]
        onion_blob: Vec<u8>,
    },
    SettleHtlc {
        htlc_id: u64,
        pre_image: Hash256,
    },
    FailHtlc {
        htlc_id: u64,
        reason: Vec<u8>,
    },
}

/// The counterparty's commitment signature message, kept verbatim so it can
/// be retransmitted on reconnect.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommitSigMsg {
    pub chan_id: Hash256,
    pub commit_sig: Vec<u8>,
    pub htlc_sigs: Vec<Vec<u8>>,
}

/// A commitment extended to the counterparty but not yet revoked: the
/// candidate commitment, the signature message that covers it, the log
/// updates that produced it and the circuits it opened or closed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitDiff {
    pub commitment: Commitment,
    pub commit_sig: CommitSigMsg,
    pub log_updates: Vec<LogUpdate>,
    pub opened_circuit_keys: Vec<CircuitKey>,
    pub closed_circuit_keys: Vec<CircuitKey>,
}

/// Log updates considered locked-in after the counterparty revoked, handed
/// to the switch for forwarding. Delivery is the switch's responsibility;
/// the store only guarantees the package survives a crash.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardingPackage {
    pub source: ShortChannelId,
    pub height: u64,
    pub adds: Vec<LogUpdate>,
    pub settle_fails: Vec<LogUpdate>,
}

impl ForwardingPackage {
    pub fn new(
        source: ShortChannelId,
        height: u64,
        adds: Vec<LogUpdate>,
        settle_fails: Vec<LogUpdate>,
    ) -> Self {
        Self {
            source,
            height,
            adds,
            settle_fails,
        }
    }
}

/// How a channel left the open state.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseType {
    CooperativeClose,
    LocalForceClose,
    RemoteForceClose,
    BreachClose,
    FundingCanceled,
    Abandoned,
}

/// What remains of a channel after its open state is deleted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelCloseSummary {
    pub chan_point: OutPoint,
    pub short_chan_id: ShortChannelId,
    pub chain_hash: Hash256,
    pub closing_txid: Hash256,
    pub remote_pub: PublicKey,
    pub capacity: Atoms,
    pub close_height: u32,
    pub settled_balance: Atoms,
    pub time_locked_balance: Atoms,
    pub close_type: CloseType,
    /// Still waiting for our funds to be swept back on chain.
    pub is_pending: bool,
}

/// Persistent state of a single channel. Plain data: the store owns the
/// durable copy, callers hold this as a handle and pass it back per
/// operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OpenChannel {
    pub chan_type: ChannelType,
    pub chain_hash: Hash256,
    pub funding_outpoint: OutPoint,
    pub short_channel_id: ShortChannelId,
    pub is_pending: bool,
    pub is_initiator: bool,
    pub status: ChannelStatus,
    pub funding_broadcast_height: u32,
    pub num_confs_required: u16,
    pub identity_pub: PublicKey,
    pub remote_address: Option<SocketAddr>,
    pub capacity: Atoms,
    pub total_matoms_sent: MilliAtoms,
    pub total_matoms_received: MilliAtoms,
    pub local_chan_cfg: ChannelConfig,
    pub remote_chan_cfg: ChannelConfig,
    pub local_commitment: Commitment,
    pub remote_commitment: Commitment,
    pub remote_current_revocation: Option<PublicKey>,
    pub remote_next_revocation: Option<PublicKey>,
    pub revocation_producer: RevocationProducer,
    pub revocation_store: RevocationStore,
}

impl OpenChannel {
    /// The confirmed location of the channel, zero while pending.
    pub fn short_chan_id(&self) -> ShortChannelId {
        self.short_channel_id
    }
}
