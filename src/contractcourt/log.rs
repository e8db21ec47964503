use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{Hash256, PublishError};
use crate::channel::{ChannelError, CommitOutputResolution, Htlc, HtlcResolutions};
use crate::store::StoreError;

use super::resolvers::ContractResolver;

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("channel is already in the process of being force closed")]
    AlreadyForceClosed,
    #[error("no contract resolutions logged for channel")]
    NoResolutions,
    #[error("arbitrator log failure: {0}")]
    Log(String),
    #[error("failed to publish transaction: {0}")]
    Publish(#[from] PublishError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

/// The persisted position of a channel arbitrator. Transitions follow the
/// arrows of `is_valid_transition`; every transition is committed to the
/// arbitrator log before the machine acts on it, so a restarted node
/// replays from the last durable state.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArbitratorState {
    /// The channel is operating normally off-chain.
    Default,
    /// A decision to go on chain was made; the commitment is about to be
    /// signed and published.
    BroadcastCommit,
    /// Our commitment transaction is in flight, awaiting confirmation.
    CommitmentBroadcasted,
    /// Some commitment confirmed on chain; resolutions are being prepared.
    ContractClosed,
    /// Per-output resolvers are sweeping the remaining contracts.
    WaitingFullResolution,
    /// Every output is swept or abandoned; only the close summary remains.
    FullyResolved,
}

impl ArbitratorState {
    pub fn is_valid_transition(&self, next: ArbitratorState) -> bool {
        use ArbitratorState::*;
        match (self, next) {
            (_, FullyResolved) => true,
            (Default, BroadcastCommit) | (Default, ContractClosed) => true,
            (BroadcastCommit, CommitmentBroadcasted) | (BroadcastCommit, ContractClosed) => true,
            (CommitmentBroadcasted, ContractClosed) => true,
            (ContractClosed, WaitingFullResolution) => true,
            (prev, next) => *prev == next,
        }
    }
}

impl ::core::fmt::Display for ArbitratorState {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        let name = match self {
            ArbitratorState::Default => "Default",
            ArbitratorState::BroadcastCommit => "BroadcastCommit",
            ArbitratorState::CommitmentBroadcasted => "CommitmentBroadcasted",
            ArbitratorState::ContractClosed => "ContractClosed",
            ArbitratorState::WaitingFullResolution => "WaitingFullResolution",
            ArbitratorState::FullyResolved => "FullyResolved",
        };
        write!(f, "{}", name)
    }
}

/// Which commitment transaction an HTLC set belongs to. At any instant up
/// to three commitments are valid: ours, the counterparty's, and the
/// counterparty's unrevoked pending one.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum HtlcSetKey {
    Local,
    Remote,
    RemotePending,
}

/// The HTLC activity across all commitments that could confirm, and, once
/// one does, which one it was.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CommitSet {
    pub conf_commit_key: Option<HtlcSetKey>,
    pub htlc_sets: HashMap<HtlcSetKey, Vec<Htlc>>,
}

impl CommitSet {
    pub fn is_empty(&self) -> bool {
        self.htlc_sets.values().all(|set| set.is_empty())
    }

    /// The HTLCs carried by the commitment that actually confirmed.
    pub fn confirmed_htlcs(&self) -> &[Htlc] {
        self.conf_commit_key
            .as_ref()
            .and_then(|key| self.htlc_sets.get(key))
            .map(|set| set.as_slice())
            .unwrap_or(&[])
    }
}

/// The full set of resolutions for a closed channel, logged before any
/// resolver acts so a restart can rebuild the sweep plan.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ContractResolutions {
    pub commit_hash: Hash256,
    pub commit_resolution: Option<CommitOutputResolution>,
    pub htlc_resolutions: HtlcResolutions,
}

impl ContractResolutions {
    pub fn is_empty(&self) -> bool {
        self.commit_resolution.is_none() && self.htlc_resolutions.is_empty()
    }
}

/// Durable backing of a channel arbitrator. One instance per channel,
/// scoped to the channel's funding outpoint.
pub trait ArbitratorLog: Send + Sync {
    fn current_state(&self) -> Result<ArbitratorState, ContractError>;

    fn commit_state(&self, state: ArbitratorState) -> Result<(), ContractError>;

    fn fetch_unresolved_contracts(&self) -> Result<Vec<ContractResolver>, ContractError>;

    fn insert_unresolved_contracts(
        &self,
        resolvers: &[ContractResolver],
    ) -> Result<(), ContractError>;

    /// Replace a resolver with its successor, e.g. a contest resolver
    /// transforming into a timeout resolver.
    fn swap_contract(
        &self,
        old: &ContractResolver,
        new: &ContractResolver,
    ) -> Result<(), ContractError>;

    fn resolve_contract(&self, resolver: &ContractResolver) -> Result<(), ContractError>;

    fn log_contract_resolutions(
        &self,
        resolutions: &ContractResolutions,
    ) -> Result<(), ContractError>;

    fn fetch_contract_resolutions(&self) -> Result<ContractResolutions, ContractError>;

    fn insert_confirmed_commit_set(&self, commit_set: &CommitSet) -> Result<(), ContractError>;

    fn fetch_confirmed_commit_set(&self) -> Result<Option<CommitSet>, ContractError>;

    /// Remove every trace of the arbitrator once the channel is fully
    /// resolved.
    fn wipe_history(&self) -> Result<(), ContractError>;
}
