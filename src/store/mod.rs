mod schema;
#[allow(clippy::module_inception)]
mod store;

use thiserror::Error;

pub use store::{deserialize_from, serialize_to_vec, ChannelArbitratorLog, Store};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Db(String),
    #[error("malformed record: {0}")]
    Corrupt(String),
    #[error("channel not found")]
    ChannelNotFound,
    #[error("no pending commit diff staged")]
    NoPendingCommit,
    #[error("an unrevoked commit diff is already staged")]
    PendingCommitExists,
    #[error("no revocation log entry at the requested height")]
    NoRevocationLogFound,
    #[error("no close summary recorded for channel")]
    NoCloseSummary,
    #[error("no broadcasted commitment recorded for channel")]
    NoBroadcastedCommitment,
    #[error("commitment height {new} does not follow current height {current}")]
    CommitHeightOutOfOrder { current: u64, new: u64 },
    #[error("channel already marked open at a different location")]
    AlreadyOpen,
}

#[cfg(test)]
mod tests;
