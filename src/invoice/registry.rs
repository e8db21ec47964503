use std::collections::BTreeMap;

use crate::chain::{Hash256, MilliAtoms};
use crate::channel::CircuitKey;

use super::errors::InvoiceError;
use super::invoice::{ContractState, HtlcState, Invoice, InvoiceHtlc};

/// A newly accepted HTLC paying to an invoice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcAcceptDesc {
    pub amount: MilliAtoms,
    pub accept_height: u32,
    pub expiry_height: u32,
}

/// The changes an update callback wants applied to an invoice. HTLC map
/// entries: absent circuit keys are untouched, a `None` value cancels the
/// HTLC, a `Some` value adds it.
#[derive(Clone, Debug)]
pub struct InvoiceUpdateDesc {
    pub state: ContractState,
    pub htlcs: BTreeMap<CircuitKey, Option<HtlcAcceptDesc>>,
    /// Mandatory exactly when transitioning to Settled.
    pub pre_image: Option<Hash256>,
}

/// Outcome of applying an update descriptor.
pub struct UpdateResult {
    pub invoice: Invoice,
    /// The invoice transitioned to Settled in this update and consumed the
    /// offered settle index.
    pub settled: bool,
}

/// Apply an update descriptor to an invoice. Pure with respect to storage:
/// the store runs this inside its transaction and persists the result, so
/// the descriptor callback itself can never re-enter the registry.
pub fn apply_invoice_update(
    mut invoice: Invoice,
    payment_hash: &Hash256,
    update: InvoiceUpdateDesc,
    settle_index_hint: u64,
    now_ns: u64,
) -> Result<UpdateResult, InvoiceError> {
    let pre_update_state = invoice.terms.state;

    if pre_update_state != update.state && pre_update_state.is_terminal() {
        return Err(match pre_update_state {
            ContractState::Settled => InvoiceError::AlreadySettled,
            _ => InvoiceError::AlreadyCanceled,
        });
    }

    invoice.terms.state = update.state;

    for (key, htlc_update) in update.htlcs {
        match htlc_update {
            // A missing descriptor cancels the htlc.
            None => {
                let htlc = invoice
                    .htlcs
                    .get_mut(&key)
                    .ok_or(InvoiceError::UnknownHtlc(key))?;
                if htlc.state != HtlcState::Accepted {
                    return Err(InvoiceError::HtlcNotAccepted);
                }
                htlc.state = HtlcState::Canceled;
                htlc.resolve_time_ns = now_ns;
                invoice.amt_paid -= htlc.amount;
            }
            Some(desc) => {
                if invoice.htlcs.contains_key(&key) {
                    return Err(InvoiceError::DuplicateHtlc(key));
                }
                let state = if pre_update_state == ContractState::Settled {
                    HtlcState::Settled
                } else {
                    HtlcState::Accepted
                };
                let resolve_time_ns = if state == HtlcState::Settled { now_ns } else { 0 };
                invoice.amt_paid += desc.amount;
                invoice.htlcs.insert(
                    key,
                    InvoiceHtlc {
                        amount: desc.amount,
                        accept_height: desc.accept_height,
                        accept_time_ns: now_ns,
                        resolve_time_ns,
                        expiry_height: desc.expiry_height,
                        state,
                    },
                );
            }
        }
    }

    let mut settled = false;
    if pre_update_state != invoice.terms.state && invoice.terms.state == ContractState::Settled {
        let pre_image = update.pre_image.ok_or(InvoiceError::PreimageRequired)?;
        if Hash256::hash(pre_image) != *payment_hash {
            return Err(InvoiceError::PreimageMismatch);
        }
        invoice.terms.payment_pre_image = pre_image;

        for htlc in invoice.htlcs.values_mut() {
            if htlc.state != HtlcState::Accepted {
                continue;
            }
            htlc.state = HtlcState::Settled;
            htlc.resolve_time_ns = now_ns;
        }

        invoice.settle_index = settle_index_hint;
        invoice.settle_time_ns = now_ns;
        settled = true;
    }

    Ok(UpdateResult { invoice, settled })
}
