pub mod machine;
pub mod revocation;
pub mod store;
pub mod types;

pub use machine::{
    build_commitment, commitment_point, force_close_summary, ChannelError, ChannelMachine,
    CommitOutputResolution, HtlcResolutions, IncomingHtlcResolution, LocalForceCloseSummary,
    MachineState, OutgoingHtlcResolution,
};
pub use revocation::{
    RevocationError, RevocationProducer, RevocationStore, MAX_REVOCATION_INDEX,
};
pub use store::ChannelStateStore;
pub use types::{
    ChannelCloseSummary, ChannelConfig, ChannelConstraints, ChannelStatus, ChannelType,
    CircuitKey, CloseType, CommitDiff, CommitSigMsg, Commitment, ForwardingPackage, Htlc,
    KeyDescriptor, KeyLocator, LogUpdate, OpenChannel, UpdateMsg,
};

#[cfg(test)]
mod tests;
