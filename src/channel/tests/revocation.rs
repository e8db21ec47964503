use crate::channel::revocation::{
    RevocationError, RevocationProducer, RevocationStore, MAX_REVOCATION_INDEX,
};

fn test_producer() -> RevocationProducer {
    RevocationProducer::new([0x81; 32])
}

#[test]
fn test_producer_is_deterministic() {
    let producer = test_producer();
    let other = test_producer();
    for index in [0, 1, 2, 100, 4096] {
        assert_eq!(
            producer.at_index(index).unwrap(),
            other.at_index(index).unwrap()
        );
    }
    assert_ne!(
        producer.at_index(0).unwrap(),
        producer.at_index(1).unwrap()
    );
}

#[test]
fn test_producer_index_out_of_range() {
    let producer = test_producer();
    assert!(producer.at_index(MAX_REVOCATION_INDEX).is_ok());
    assert_eq!(
        producer.at_index(MAX_REVOCATION_INDEX + 1),
        Err(RevocationError::IndexOutOfRange(MAX_REVOCATION_INDEX + 1))
    );
}

#[test]
fn test_store_reconstructs_all_received_pre_images() {
    let producer = test_producer();
    let mut store = RevocationStore::new();

    const NUM_ENTRIES: u64 = 64;
    for index in 0..NUM_ENTRIES {
        store
            .add_next_entry(producer.at_index(index).unwrap())
            .unwrap_or_else(|err| panic!("entry {} rejected: {:?}", index, err));
    }

    for index in 0..NUM_ENTRIES {
        assert_eq!(
            store.lookup_pre_image(index).unwrap(),
            producer.at_index(index).unwrap(),
            "pre-image {} not reconstructed",
            index
        );
    }
}

#[test]
fn test_store_rejects_out_of_order_entries() {
    let producer = test_producer();
    let mut store = RevocationStore::new();
    store.add_next_entry(producer.at_index(0).unwrap()).unwrap();

    // Skipping an index must fail.
    assert_eq!(
        store.add_next_entry(producer.at_index(2).unwrap()),
        Err(RevocationError::OutOfOrderRevocation)
    );

    // Replaying the previous index must fail as well.
    assert_eq!(
        store.add_next_entry(producer.at_index(0).unwrap()),
        Err(RevocationError::OutOfOrderRevocation)
    );

    // The expected next entry is still accepted afterwards.
    store.add_next_entry(producer.at_index(1).unwrap()).unwrap();
}

#[test]
fn test_store_lookup_of_missing_index_fails() {
    let producer = test_producer();
    let mut store = RevocationStore::new();
    for index in 0..3 {
        store
            .add_next_entry(producer.at_index(index).unwrap())
            .unwrap();
    }

    assert_eq!(
        store.lookup_pre_image(3),
        Err(RevocationError::NoSuchIndex(3))
    );
    assert_eq!(
        store.lookup_pre_image(100),
        Err(RevocationError::NoSuchIndex(100))
    );
}

#[test]
fn test_store_serialization_is_bounded() {
    let producer = test_producer();
    let mut store = RevocationStore::new();
    store.add_next_entry(producer.at_index(0).unwrap()).unwrap();
    let small = store.to_bytes().len();

    for index in 1..512 {
        store
            .add_next_entry(producer.at_index(index).unwrap())
            .unwrap();
    }
    let large = store.to_bytes().len();

    // 49 buckets of (index, hash) regardless of how many entries arrived.
    assert!(large <= small + 49 * 48, "store blob grew unbounded");

    let restored = RevocationStore::from_bytes(&store.to_bytes()).unwrap();
    assert_eq!(restored, store);
    assert_eq!(
        restored.lookup_pre_image(511).unwrap(),
        producer.at_index(511).unwrap()
    );
}
