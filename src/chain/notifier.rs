use thiserror::Error;
use tokio::sync::mpsc;

use super::types::{BlockEpoch, Hash256, OutPoint, SpendDetail, Transaction, TxConfirmation};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// An input of the published transaction is already spent by a
    /// transaction in the mempool or a block. The arbitrator treats this as
    /// success: a commitment is in flight either way.
    #[error("transaction double spends a watched input")]
    DoubleSpend,
    #[error("chain backend rejected transaction: {0}")]
    Rpc(String),
}

/// Chain event source the core subscribes to. Implemented by the chain
/// backend of the outer daemon; tests provide a mock.
pub trait ChainNotifier: Send + Sync {
    /// Stream of new best blocks.
    fn register_block_epochs(&self) -> mpsc::Receiver<BlockEpoch>;

    /// Notification for the first transaction spending the given outpoint.
    fn register_spend(&self, outpoint: &OutPoint) -> mpsc::Receiver<SpendDetail>;

    /// Notification for the given transaction reaching `num_confs`
    /// confirmations.
    fn register_confirmation(&self, txid: Hash256, num_confs: u32)
        -> mpsc::Receiver<TxConfirmation>;
}

/// Hands signed transactions to the chain backend for broadcast.
pub trait TxPublisher: Send + Sync {
    fn publish_tx(&self, tx: &Transaction) -> Result<(), PublishError>;
}
