use std::collections::BTreeMap;

use crate::chain::{Hash256, ShortChannelId};
use crate::channel::CircuitKey;
use crate::invoice::{
    ContractState, HtlcAcceptDesc, HtlcState, Invoice, InvoiceError, InvoiceQuery, InvoiceStore,
    InvoiceUpdateDesc, MAX_MEMO_SIZE,
};
use crate::store::Store;
use crate::test_utils::{gen_rand_sha256_hash, TempDir};

fn make_test_store() -> (Store, TempDir) {
    let path = TempDir::new("invoices");
    let store = Store::new(&path).expect("create store");
    (store, path)
}

fn test_invoice(pre_image: Hash256, value: u64) -> Invoice {
    Invoice::new(
        b"x".to_vec(),
        Vec::new(),
        b"payreq".to_vec(),
        pre_image,
        value,
        9,
        3_600_000_000_000,
        crate::now_timestamp_as_nanos_u64(),
    )
}

fn settle_desc(
    pre_image: Hash256,
    circuit: CircuitKey,
    amount: u64,
) -> InvoiceUpdateDesc {
    let mut htlcs = BTreeMap::new();
    htlcs.insert(
        circuit,
        Some(HtlcAcceptDesc {
            amount,
            accept_height: 50,
            expiry_height: 100,
        }),
    );
    InvoiceUpdateDesc {
        state: ContractState::Settled,
        htlcs,
        pre_image: Some(pre_image),
    }
}

#[test]
fn test_invoice_workflow() {
    let (store, _path) = make_test_store();

    let pre_image = gen_rand_sha256_hash();
    let payment_hash = Hash256::hash(pre_image);
    let mut invoice = test_invoice(pre_image, 1_000_000);

    let add_index = store.add_invoice(&mut invoice, payment_hash).unwrap();
    assert_eq!(add_index, 1);
    assert_eq!(invoice.add_index, 1);

    // The stored record is identical to what was handed in.
    let looked_up = store.lookup_invoice(&payment_hash).unwrap();
    assert_eq!(looked_up, invoice);

    let circuit = CircuitKey {
        chan_id: ShortChannelId::from_u64(1),
        htlc_id: 7,
    };
    let updated = store
        .update_invoice(&payment_hash, &|_invoice| {
            Ok(settle_desc(pre_image, circuit, 1_000_000))
        })
        .unwrap();

    assert_eq!(updated.terms.state, ContractState::Settled);
    assert_eq!(updated.settle_index, 1);
    assert_eq!(updated.amt_paid, 1_000_000);
    assert!(updated.settle_time_ns > 0);

    let htlc = updated.htlcs.get(&circuit).expect("settled htlc");
    assert_eq!(htlc.state, HtlcState::Settled);
    assert!(htlc.resolve_time_ns > 0);
    assert_eq!(htlc.accept_height, 50);

    // Zero is a no-op checkpoint; one is exclusive of settle index 1.
    assert!(store.invoices_settled_since(0).unwrap().is_empty());
    assert!(store.invoices_settled_since(1).unwrap().is_empty());

    // A second settled invoice must take the next settle index.
    let pre_image2 = gen_rand_sha256_hash();
    let payment_hash2 = Hash256::hash(pre_image2);
    let mut invoice2 = test_invoice(pre_image2, 2_000_000);
    assert_eq!(store.add_invoice(&mut invoice2, payment_hash2).unwrap(), 2);

    let circuit2 = CircuitKey {
        chan_id: ShortChannelId::from_u64(2),
        htlc_id: 1,
    };
    let updated2 = store
        .update_invoice(&payment_hash2, &|_invoice| {
            Ok(settle_desc(pre_image2, circuit2, 2_000_000))
        })
        .unwrap();
    assert_eq!(updated2.settle_index, 2);

    let settled = store.invoices_settled_since(1).unwrap();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].settle_index, 2);
}

#[test]
fn test_add_invoice_duplicate_hash_rejected() {
    let (store, _path) = make_test_store();

    let pre_image = gen_rand_sha256_hash();
    let payment_hash = Hash256::hash(pre_image);

    let mut invoice = test_invoice(pre_image, 1_000);
    store.add_invoice(&mut invoice, payment_hash).unwrap();

    let mut duplicate = test_invoice(pre_image, 2_000);
    assert_eq!(
        store.add_invoice(&mut duplicate, payment_hash),
        Err(InvoiceError::DuplicateInvoice)
    );
}

#[test]
fn test_add_invoice_size_bounds() {
    let (store, _path) = make_test_store();

    let pre_image = gen_rand_sha256_hash();
    let mut invoice = test_invoice(pre_image, 1_000);
    invoice.memo = vec![0x61; MAX_MEMO_SIZE];
    store
        .add_invoice(&mut invoice, Hash256::hash(pre_image))
        .unwrap();

    let pre_image = gen_rand_sha256_hash();
    let mut invoice = test_invoice(pre_image, 1_000);
    invoice.memo = vec![0x61; MAX_MEMO_SIZE + 1];
    assert_eq!(
        store.add_invoice(&mut invoice, Hash256::hash(pre_image)),
        Err(InvoiceError::MemoTooLarge(MAX_MEMO_SIZE + 1))
    );
}

#[test]
fn test_lookup_missing_invoice() {
    let (store, _path) = make_test_store();
    assert_eq!(
        store.lookup_invoice(&gen_rand_sha256_hash()),
        Err(InvoiceError::InvoiceNotFound)
    );
}

#[test]
fn test_invoices_added_since() {
    let (store, _path) = make_test_store();

    for value in 1..=5u64 {
        let pre_image = gen_rand_sha256_hash();
        let mut invoice = test_invoice(pre_image, value);
        store
            .add_invoice(&mut invoice, Hash256::hash(pre_image))
            .unwrap();
    }

    // Index zero is a no-op.
    assert!(store.invoices_added_since(0).unwrap().is_empty());

    // Strictly greater than the given index.
    let added = store.invoices_added_since(3).unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(added[0].add_index, 4);
    assert_eq!(added[1].add_index, 5);

    assert!(store.invoices_added_since(5).unwrap().is_empty());
}

#[test]
fn test_query_invoices() {
    let (store, _path) = make_test_store();

    let mut pre_images = Vec::new();
    for value in 1..=6u64 {
        let pre_image = gen_rand_sha256_hash();
        let mut invoice = test_invoice(pre_image, value);
        // Make the first invoice long expired; it must still show up in
        // unfiltered queries.
        if value == 1 {
            invoice.expiry_ns = 1;
        }
        store
            .add_invoice(&mut invoice, Hash256::hash(pre_image))
            .unwrap();
        pre_images.push(pre_image);
    }

    // Settle invoice 2 so the pending filter has something to skip.
    let settled_hash = Hash256::hash(pre_images[1]);
    store
        .update_invoice(&settled_hash, &|_invoice| {
            Ok(InvoiceUpdateDesc {
                state: ContractState::Settled,
                htlcs: BTreeMap::new(),
                pre_image: Some(pre_images[1]),
            })
        })
        .unwrap();

    // Forward from an offset.
    let slice = store
        .query_invoices(InvoiceQuery {
            index_offset: 2,
            num_max_invoices: 10,
            pending_only: false,
            reversed: false,
        })
        .unwrap();
    assert_eq!(slice.invoices.len(), 4);
    assert_eq!(slice.first_index_offset, 3);
    assert_eq!(slice.last_index_offset, 6);

    // Reversed from offset one returns nothing.
    let slice = store
        .query_invoices(InvoiceQuery {
            index_offset: 1,
            num_max_invoices: 10,
            pending_only: false,
            reversed: true,
        })
        .unwrap();
    assert!(slice.invoices.is_empty());

    // Reversed with no offset starts at the last invoice.
    let slice = store
        .query_invoices(InvoiceQuery {
            index_offset: 0,
            num_max_invoices: 2,
            pending_only: false,
            reversed: true,
        })
        .unwrap();
    assert_eq!(slice.invoices.len(), 2);
    assert_eq!(slice.first_index_offset, 5);
    assert_eq!(slice.last_index_offset, 6);

    // The expired invoice is still returned when not filtering by state.
    let slice = store
        .query_invoices(InvoiceQuery {
            index_offset: 0,
            num_max_invoices: 10,
            pending_only: false,
            reversed: false,
        })
        .unwrap();
    assert_eq!(slice.invoices.len(), 6);

    // Pending only skips the settled invoice without counting it.
    let slice = store
        .query_invoices(InvoiceQuery {
            index_offset: 0,
            num_max_invoices: 10,
            pending_only: true,
            reversed: false,
        })
        .unwrap();
    assert_eq!(slice.invoices.len(), 5);
    assert!(slice
        .invoices
        .iter()
        .all(|invoice| invoice.terms.state != ContractState::Settled));
}

#[test]
fn test_update_invoice_htlc_errors() {
    let (store, _path) = make_test_store();

    let pre_image = gen_rand_sha256_hash();
    let payment_hash = Hash256::hash(pre_image);
    let mut invoice = test_invoice(pre_image, 1_000);
    store.add_invoice(&mut invoice, payment_hash).unwrap();

    let circuit = CircuitKey {
        chan_id: ShortChannelId::from_u64(1),
        htlc_id: 0,
    };

    // Cancelling an unknown htlc fails.
    let result = store.update_invoice(&payment_hash, &|_invoice| {
        let mut htlcs = BTreeMap::new();
        htlcs.insert(circuit, None);
        Ok(InvoiceUpdateDesc {
            state: ContractState::Open,
            htlcs,
            pre_image: None,
        })
    });
    assert_eq!(result, Err(InvoiceError::UnknownHtlc(circuit)));

    // Accept an htlc.
    store
        .update_invoice(&payment_hash, &|_invoice| {
            let mut htlcs = BTreeMap::new();
            htlcs.insert(
                circuit,
                Some(HtlcAcceptDesc {
                    amount: 1_000,
                    accept_height: 10,
                    expiry_height: 100,
                }),
            );
            Ok(InvoiceUpdateDesc {
                state: ContractState::Accepted,
                htlcs,
                pre_image: None,
            })
        })
        .unwrap();

    // Adding the same circuit key again fails.
    let result = store.update_invoice(&payment_hash, &|_invoice| {
        let mut htlcs = BTreeMap::new();
        htlcs.insert(
            circuit,
            Some(HtlcAcceptDesc {
                amount: 1_000,
                accept_height: 11,
                expiry_height: 100,
            }),
        );
        Ok(InvoiceUpdateDesc {
            state: ContractState::Accepted,
            htlcs,
            pre_image: None,
        })
    });
    assert_eq!(result, Err(InvoiceError::DuplicateHtlc(circuit)));

    // Settling requires the matching pre-image.
    let result = store.update_invoice(&payment_hash, &|_invoice| {
        Ok(InvoiceUpdateDesc {
            state: ContractState::Settled,
            htlcs: BTreeMap::new(),
            pre_image: None,
        })
    });
    assert_eq!(result, Err(InvoiceError::PreimageRequired));

    let result = store.update_invoice(&payment_hash, &|_invoice| {
        Ok(InvoiceUpdateDesc {
            state: ContractState::Settled,
            htlcs: BTreeMap::new(),
            pre_image: Some(gen_rand_sha256_hash()),
        })
    });
    assert_eq!(result, Err(InvoiceError::PreimageMismatch));

    // Settle for real; the accepted htlc settles along with the invoice.
    let updated = store
        .update_invoice(&payment_hash, &|_invoice| {
            Ok(InvoiceUpdateDesc {
                state: ContractState::Settled,
                htlcs: BTreeMap::new(),
                pre_image: Some(pre_image),
            })
        })
        .unwrap();
    assert_eq!(updated.htlcs[&circuit].state, HtlcState::Settled);
    assert_eq!(updated.amt_paid, 1_000);

    // Terminal states are sticky.
    let result = store.update_invoice(&payment_hash, &|_invoice| {
        Ok(InvoiceUpdateDesc {
            state: ContractState::Canceled,
            htlcs: BTreeMap::new(),
            pre_image: None,
        })
    });
    assert_eq!(result, Err(InvoiceError::AlreadySettled));

    // Cancelling a settled htlc fails.
    let result = store.update_invoice(&payment_hash, &|_invoice| {
        let mut htlcs = BTreeMap::new();
        htlcs.insert(circuit, None);
        Ok(InvoiceUpdateDesc {
            state: ContractState::Settled,
            htlcs,
            pre_image: None,
        })
    });
    assert_eq!(result, Err(InvoiceError::HtlcNotAccepted));
}
