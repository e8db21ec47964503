pub mod arbitrator;
pub mod chain_arbitrator;
pub mod chain_watcher;
pub mod log;
pub mod resolvers;

pub use arbitrator::{
    BreachRetribution, ChainEventSubscription, ChannelArbitrator, ChannelArbitratorConfig,
    ContractSignals, ContractUpdate, CooperativeCloseInfo, ForceCloseReq,
    LocalUnilateralCloseInfo, RemoteUnilateralCloseInfo, ResolverReport,
};
pub use chain_arbitrator::{ChainArbitrator, ChainArbitratorConfig};
pub use chain_watcher::{ChainWatcher, ChannelWallet};
pub use log::{
    ArbitratorLog, ArbitratorState, CommitSet, ContractError, ContractResolutions, HtlcSetKey,
};
pub use resolvers::{
    ContractResolver, FailureReason, IncubationRequest, ResolutionMsg, ResolverKind,
};

#[cfg(test)]
mod tests;
