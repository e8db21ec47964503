use thiserror::Error;

use crate::channel::CircuitKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvoiceError {
    #[error("invoice with payment hash already exists")]
    DuplicateInvoice,
    #[error("unable to locate invoice")]
    InvoiceNotFound,
    #[error("memo exceeds the maximum length of {0} bytes")]
    MemoTooLarge(usize),
    #[error("receipt exceeds the maximum length of {0} bytes")]
    ReceiptTooLarge(usize),
    #[error("payment request exceeds the maximum length of {0} bytes")]
    PaymentRequestTooLarge(usize),
    #[error("invoice already settled")]
    AlreadySettled,
    #[error("invoice already canceled")]
    AlreadyCanceled,
    #[error("htlc {0} already exists on invoice")]
    DuplicateHtlc(CircuitKey),
    #[error("unknown htlc {0}")]
    UnknownHtlc(CircuitKey),
    #[error("only accepted htlcs can be canceled")]
    HtlcNotAccepted,
    #[error("settling requires the payment pre-image")]
    PreimageRequired,
    #[error("pre-image does not match the invoice payment hash")]
    PreimageMismatch,
    #[error("malformed invoice record: {0}")]
    Corrupt(String),
}
