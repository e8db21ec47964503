///
/// +--------------+------------------------------+-----------------------------+
/// | KeyPrefix::  | Key::                        | Value::                     |
/// +--------------+------------------------------+-----------------------------+
/// | 0            | NodePub | OutPoint           | OpenChannel                 |
/// | 1            | OutPoint                     | NodePub                     |
/// | 2            | OutPoint                     | Broadcasted commitment tx   |
/// | 3            | OutPoint                     | CommitDiff                  |
/// | 4            | OutPoint | CommitHeight      | Revoked Commitment          |
/// | 5            | OutPoint | Height            | ForwardingPackage           |
/// | 8            | OutPoint                     | ChannelCloseSummary         |
/// | 32           | InvoiceNum                   | Invoice                     |
/// | 33           | PaymentHash                  | InvoiceNum                  |
/// | 34           | -                            | InvoiceNum counter          |
/// | 35           | AddIndex                     | InvoiceNum                  |
/// | 36           | -                            | AddIndex counter            |
/// | 37           | SettleIndex                  | InvoiceNum                  |
/// | 38           | -                            | SettleIndex counter         |
/// | 64           | OutPoint                     | ArbitratorState             |
/// | 65           | OutPoint                     | ContractResolutions         |
/// | 66           | OutPoint | ResolverKey       | ContractResolver            |
/// | 67           | OutPoint                     | Confirmed CommitSet         |
/// +--------------+------------------------------+-----------------------------+
///
/// All integer key components are big-endian so lexicographic iteration
/// follows numeric order.
pub(crate) const OPEN_CHANNEL_PREFIX: u8 = 0;
pub(crate) const CHANNEL_NODE_INDEX_PREFIX: u8 = 1;
pub(crate) const BROADCASTED_COMMITMENT_PREFIX: u8 = 2;
pub(crate) const COMMIT_DIFF_PREFIX: u8 = 3;
pub(crate) const REVOCATION_LOG_PREFIX: u8 = 4;
pub(crate) const FWD_PACKAGE_PREFIX: u8 = 5;
pub(crate) const CLOSED_CHANNEL_PREFIX: u8 = 8;
pub(crate) const INVOICE_PREFIX: u8 = 32;
pub(crate) const INVOICE_HASH_INDEX_PREFIX: u8 = 33;
pub(crate) const INVOICE_NUM_COUNTER_PREFIX: u8 = 34;
pub(crate) const INVOICE_ADD_INDEX_PREFIX: u8 = 35;
pub(crate) const INVOICE_ADD_COUNTER_PREFIX: u8 = 36;
pub(crate) const INVOICE_SETTLE_INDEX_PREFIX: u8 = 37;
pub(crate) const INVOICE_SETTLE_COUNTER_PREFIX: u8 = 38;
pub(crate) const ARBITRATOR_STATE_PREFIX: u8 = 64;
pub(crate) const RESOLUTIONS_PREFIX: u8 = 65;
pub(crate) const RESOLVER_PREFIX: u8 = 66;
pub(crate) const COMMIT_SET_PREFIX: u8 = 67;
