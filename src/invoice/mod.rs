mod errors;
mod invoice;
mod registry;
pub mod store;

pub use errors::InvoiceError;
pub use invoice::{
    deserialize_invoice, serialize_invoice, ContractState, ContractTerm, HtlcState, Invoice,
    InvoiceHtlc, MAX_MEMO_SIZE, MAX_PAYMENT_REQUEST_SIZE, MAX_RECEIPT_SIZE,
};
pub use registry::{apply_invoice_update, HtlcAcceptDesc, InvoiceUpdateDesc, UpdateResult};
pub use store::{InvoiceQuery, InvoiceSlice, InvoiceStore};
