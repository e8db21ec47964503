mod notifier;
mod types;

pub use notifier::{ChainNotifier, PublishError, TxPublisher};
pub use types::{
    sha256, Atoms, BlockEpoch, Hash256, MilliAtoms, OutPoint, ShortChannelId, SpendDetail,
    Transaction, TxConfirmation, TxIn, TxOut,
};
