use crate::chain::Hash256;

use super::errors::InvoiceError;
use super::invoice::Invoice;
use super::registry::InvoiceUpdateDesc;

/// A query over the invoice add-index event series.
#[derive(Copy, Clone, Debug, Default)]
pub struct InvoiceQuery {
    /// Add index to start from. In forward order results begin strictly
    /// after this index; in reverse order strictly before it, with zero
    /// meaning "start from the newest invoice".
    pub index_offset: u64,
    /// Maximum number of invoices to return.
    pub num_max_invoices: u64,
    /// Only return invoices that have not settled.
    pub pending_only: bool,
    /// Walk the add index backwards from the offset.
    pub reversed: bool,
}

/// The response to an invoice query, with the boundary indices a caller
/// needs to resume paging.
#[derive(Clone, Debug, Default)]
pub struct InvoiceSlice {
    pub invoices: Vec<Invoice>,
    pub first_index_offset: u64,
    pub last_index_offset: u64,
}

/// The invoice registry contract. Implemented by the node's store; every
/// mutation runs inside one storage transaction.
pub trait InvoiceStore {
    /// Insert a new invoice keyed by its payment hash. Duplicate hashes are
    /// rejected, size bounds enforced, and the next add index (starting at
    /// 1) is assigned and returned. The handed-in invoice is updated with
    /// the assigned index.
    fn add_invoice(
        &self,
        invoice: &mut Invoice,
        payment_hash: Hash256,
    ) -> Result<u64, InvoiceError>;

    fn lookup_invoice(&self, payment_hash: &Hash256) -> Result<Invoice, InvoiceError>;

    /// Atomic read-modify-write. The callback sees a snapshot of the
    /// current invoice and returns a descriptor of the changes to apply;
    /// it must not touch the registry itself. Returns the updated invoice.
    fn update_invoice(
        &self,
        payment_hash: &Hash256,
        callback: &dyn Fn(&Invoice) -> Result<InvoiceUpdateDesc, InvoiceError>,
    ) -> Result<Invoice, InvoiceError>;

    /// All invoices with an add index strictly greater than the given one.
    /// An index of zero is a no-op and returns nothing.
    fn invoices_added_since(&self, add_index: u64) -> Result<Vec<Invoice>, InvoiceError>;

    /// All settled invoices with a settle index strictly greater than the
    /// given one. An index of zero is a no-op and returns nothing.
    fn invoices_settled_since(&self, settle_index: u64) -> Result<Vec<Invoice>, InvoiceError>;

    fn query_invoices(&self, query: InvoiceQuery) -> Result<InvoiceSlice, InvoiceError>;

    /// Every invoice in the store, optionally restricted to unsettled ones.
    fn fetch_all_invoices(&self, pending_only: bool) -> Result<Vec<Invoice>, InvoiceError>;
}
