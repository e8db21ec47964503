use crate::chain::{ShortChannelId, Transaction, TxIn};
use crate::channel::{
    ChannelStateStore, CloseType, CommitDiff, CommitSigMsg, Commitment, ForwardingPackage, Htlc,
    LogUpdate, UpdateMsg,
};
use crate::store::{Store, StoreError};
use crate::test_utils::{
    create_test_channel, gen_rand_keypair, gen_rand_sha256_hash, test_addr, test_close_summary,
    TempDir,
};

fn make_test_store() -> (Store, TempDir) {
    let path = TempDir::new("channeldb");
    let store = Store::new(&path).expect("create store");
    (store, path)
}

fn test_htlcs(count: u32) -> Vec<Htlc> {
    (0..count)
        .map(|i| Htlc {
            signature: vec![1; 64],
            incoming: i > count / 2,
            amount: 10,
            payment_hash: gen_rand_sha256_hash(),
            refund_timeout: i,
            output_index: (i * 3) as i32,
            log_index: (i * 2) as u64,
            htlc_index: i as u64,
            onion_blob: vec![2; 10],
        })
        .collect()
}

#[test]
fn test_open_channel_put_get_delete() {
    let (store, _path) = make_test_store();

    let (mut channel, _) = create_test_channel();
    channel.local_commitment.htlcs = test_htlcs(1);
    channel.remote_commitment.htlcs = test_htlcs(1);

    store.sync_pending(&mut channel, test_addr(), 101).unwrap();

    let open_channels = store.fetch_open_channels(&channel.identity_pub).unwrap();
    assert_eq!(open_channels.len(), 1);
    assert_eq!(open_channels[0], channel);

    // Hot swap the next revocation point, as the initial post-funding
    // revocation exchange does.
    let (_, next_rev) = gen_rand_keypair();
    store.insert_next_revocation(&mut channel, next_rev).unwrap();

    let updated = store.fetch_open_channels(&channel.identity_pub).unwrap();
    assert_eq!(updated[0].remote_next_revocation, Some(next_rev));

    // Closing removes all open state, leaving only a summary behind.
    let summary = test_close_summary(channel.funding_outpoint, CloseType::CooperativeClose);
    store.close_channel(&channel, summary).unwrap();

    assert!(store
        .fetch_open_channels(&channel.identity_pub)
        .unwrap()
        .is_empty());
    assert!(store.fetch_all_channels().unwrap().is_empty());
}

#[test]
fn test_channel_state_transition() {
    let (store, _path) = make_test_store();

    let (mut channel, _) = create_test_channel();
    store.sync_pending(&mut channel, test_addr(), 101).unwrap();

    let htlcs = test_htlcs(10);
    let commitment = Commitment {
        commit_height: 1,
        local_log_index: 2,
        local_htlc_index: 1,
        remote_log_index: 2,
        remote_htlc_index: 1,
        local_balance: 100_000_000,
        remote_balance: 100_000_000,
        commit_fee: 55,
        fee_per_kb: 99,
        commit_tx: crate::test_utils::test_tx(),
        commit_sig: vec![3; 64],
        htlcs: htlcs.clone(),
    };

    store
        .update_commitment(&mut channel, commitment.clone())
        .unwrap();

    let updated = store.fetch_open_channels(&channel.identity_pub).unwrap();
    assert_eq!(updated[0].local_commitment, commitment);
    assert_eq!(store.commitment_height(&channel).unwrap(), 1);

    // Writing any height other than current + 1 is rejected.
    let skipped = Commitment {
        commit_height: 5,
        ..commitment.clone()
    };
    assert!(matches!(
        store.update_commitment(&mut channel, skipped),
        Err(StoreError::CommitHeightOutOfOrder { current: 1, new: 5 })
    ));

    // No commit diff staged yet.
    assert!(matches!(
        store.remote_commit_chain_tip(&channel),
        Err(StoreError::NoPendingCommit)
    ));

    let mut remote_commit = commitment.clone();
    remote_commit.local_balance = 200_000_000;
    remote_commit.remote_balance = 300_000_000;
    let commit_diff = CommitDiff {
        commitment: remote_commit,
        commit_sig: CommitSigMsg {
            chan_id: channel.funding_outpoint.txid,
            commit_sig: vec![4; 64],
            htlc_sigs: vec![vec![4; 64], vec![4; 64]],
        },
        log_updates: vec![
            LogUpdate {
                log_index: 1,
                update_msg: UpdateMsg::AddHtlc {
                    htlc_id: 1,
                    amount: 100_000,
                    payment_hash: gen_rand_sha256_hash(),
                    expiry: 25,
                    onion_blob: vec![1; 32],
                },
            },
            LogUpdate {
                log_index: 2,
                update_msg: UpdateMsg::AddHtlc {
                    htlc_id: 2,
                    amount: 200_000,
                    payment_hash: gen_rand_sha256_hash(),
                    expiry: 50,
                    onion_blob: vec![2; 32],
                },
            },
        ],
        opened_circuit_keys: Vec::new(),
        closed_circuit_keys: Vec::new(),
    };
    store
        .append_remote_commit_chain(&mut channel, commit_diff.clone())
        .unwrap();

    assert_eq!(store.remote_commit_chain_tip(&channel).unwrap(), commit_diff);

    // A second diff cannot be staged before the first is revoked.
    assert!(matches!(
        store.append_remote_commit_chain(&mut channel, commit_diff.clone()),
        Err(StoreError::PendingCommitExists)
    ));

    let old_remote_commit = channel.remote_commitment.clone();
    let (_, new_rev) = gen_rand_keypair();
    channel.remote_current_revocation = channel.remote_next_revocation;
    channel.remote_next_revocation = Some(new_rev);

    let fwd_pkg = ForwardingPackage::new(
        channel.short_chan_id(),
        old_remote_commit.commit_height,
        commit_diff.log_updates.clone(),
        Vec::new(),
    );
    store
        .advance_commit_chain_tail(&mut channel, fwd_pkg)
        .unwrap();

    assert!(matches!(
        store.remote_commit_chain_tip(&channel),
        Err(StoreError::NoPendingCommit)
    ));

    // The revoked state is reconstructible from the log.
    let prev = store
        .find_previous_state(&channel, old_remote_commit.commit_height)
        .unwrap();
    assert_eq!(prev, old_remote_commit);

    let log_tail = store.revocation_log_tail(&channel).unwrap();
    assert_eq!(log_tail.commit_height, old_remote_commit.commit_height);

    // The rotated revocation state survived the round trip.
    let updated = store.fetch_open_channels(&channel.identity_pub).unwrap();
    assert_eq!(updated[0].remote_next_revocation, Some(new_rev));
    assert_eq!(
        updated[0].remote_current_revocation,
        channel.remote_current_revocation
    );

    // One more round at the next height.
    let old_remote_commit = channel.remote_commitment.clone();
    let mut next_diff = commit_diff.clone();
    next_diff.commitment.commit_height = 2;
    next_diff.log_updates = Vec::new();
    store
        .append_remote_commit_chain(&mut channel, next_diff)
        .unwrap();
    let fwd_pkg = ForwardingPackage::new(
        channel.short_chan_id(),
        old_remote_commit.commit_height,
        Vec::new(),
        Vec::new(),
    );
    store
        .advance_commit_chain_tail(&mut channel, fwd_pkg)
        .unwrap();

    let prev = store
        .find_previous_state(&channel, old_remote_commit.commit_height)
        .unwrap();
    assert_eq!(prev, old_remote_commit);

    // Deleting the channel also deletes the revocation log.
    let summary = test_close_summary(channel.funding_outpoint, CloseType::RemoteForceClose);
    store.close_channel(&channel, summary).unwrap();
    assert!(store
        .fetch_open_channels(&channel.identity_pub)
        .unwrap()
        .is_empty());
    assert!(matches!(
        store.find_previous_state(&channel, old_remote_commit.commit_height),
        Err(StoreError::NoRevocationLogFound)
    ));
}

#[test]
fn test_fetch_pending_channels() {
    let (store, _path) = make_test_store();

    let (mut channel, _) = create_test_channel();
    const BROADCAST_HEIGHT: u32 = 99;
    store
        .sync_pending(&mut channel, test_addr(), BROADCAST_HEIGHT)
        .unwrap();

    let mut pending = store.fetch_pending_channels().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].funding_broadcast_height, BROADCAST_HEIGHT);

    let chan_open_loc = ShortChannelId::new(5, 10, 15);
    store
        .mark_as_open(&mut pending[0], chan_open_loc)
        .unwrap();
    assert!(!pending[0].is_pending);
    assert_eq!(pending[0].short_chan_id(), chan_open_loc);

    let open_chans = store.fetch_all_channels().unwrap();
    assert_eq!(open_chans[0].short_chan_id(), chan_open_loc);
    assert_eq!(open_chans[0].funding_broadcast_height, BROADCAST_HEIGHT);

    assert!(store.fetch_pending_channels().unwrap().is_empty());
}

#[test]
fn test_mark_as_open_idempotent() {
    let (store, _path) = make_test_store();

    let (mut channel, _) = create_test_channel();
    store.sync_pending(&mut channel, test_addr(), 99).unwrap();

    let loc = ShortChannelId::new(5, 10, 15);
    store.mark_as_open(&mut channel, loc).unwrap();

    // Applying the same location again leaves the channel open.
    store.mark_as_open(&mut channel, loc).unwrap();
    assert!(!channel.is_pending);
    assert_eq!(channel.short_chan_id(), loc);

    // A different location must fail.
    let other = ShortChannelId::new(6, 11, 16);
    assert!(matches!(
        store.mark_as_open(&mut channel, other),
        Err(StoreError::AlreadyOpen)
    ));
}

#[test]
fn test_fetch_closed_channels() {
    let (store, _path) = make_test_store();

    let (mut channel, _) = create_test_channel();
    store.sync_pending(&mut channel, test_addr(), 99).unwrap();
    store
        .mark_as_open(&mut channel, ShortChannelId::new(5, 10, 15))
        .unwrap();

    let summary = test_close_summary(channel.funding_outpoint, CloseType::RemoteForceClose);
    store.close_channel(&channel, summary.clone()).unwrap();

    let pending_closed = store.fetch_closed_channels(true).unwrap();
    assert_eq!(pending_closed.len(), 1);
    assert_eq!(pending_closed[0], summary);

    let closed = store.fetch_closed_channels(false).unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0], summary);

    // Once all funds are back, only the non-pending query returns it.
    store
        .mark_chan_fully_closed(&channel.funding_outpoint)
        .unwrap();
    assert_eq!(store.fetch_closed_channels(false).unwrap().len(), 1);
    assert!(store.fetch_closed_channels(true).unwrap().is_empty());
}

#[test]
fn test_fetch_waiting_close_channels() {
    let (store, _path) = make_test_store();

    const NUM_CHANNELS: usize = 2;
    let mut channels = Vec::new();
    for _ in 0..NUM_CHANNELS {
        let (mut channel, _) = create_test_channel();
        store.sync_pending(&mut channel, test_addr(), 99).unwrap();
        channels.push(channel);
    }

    // Only confirm the first one; a broadcast commitment must make even an
    // unconfirmed channel wait for close.
    store
        .mark_as_open(&mut channels[0], ShortChannelId::new(100, 10, 15))
        .unwrap();

    for channel in channels.iter_mut() {
        let close_tx = Transaction {
            version: 2,
            inputs: vec![TxIn {
                previous_outpoint: channel.funding_outpoint,
                signature_script: Vec::new(),
                sequence: 0,
            }],
            outputs: Vec::new(),
            lock_time: 0,
        };
        store
            .mark_commitment_broadcasted(channel, close_tx)
            .unwrap();
    }

    let waiting = store.fetch_waiting_close_channels().unwrap();
    assert_eq!(waiting.len(), NUM_CHANNELS);

    for channel in &waiting {
        let close_tx = store.broadcasted_commitment(channel).unwrap();
        assert_eq!(
            close_tx.inputs[0].previous_outpoint,
            channel.funding_outpoint
        );
    }
}

#[test]
fn test_refresh_short_chan_id() {
    let (store, _path) = make_test_store();

    let (mut channel, _) = create_test_channel();
    store.sync_pending(&mut channel, test_addr(), 99).unwrap();

    // A second handle to the same channel, as another subsystem would hold.
    let mut pending_channel = store
        .fetch_pending_channels()
        .unwrap()
        .into_iter()
        .find(|c| c.funding_outpoint == channel.funding_outpoint)
        .expect("pending channel");

    let chan_open_loc = ShortChannelId::new(105, 10, 15);
    store.mark_as_open(&mut channel, chan_open_loc).unwrap();

    // The other handle still sees the stale id until it refreshes.
    assert_ne!(channel.short_chan_id(), pending_channel.short_chan_id());

    store.refresh_short_chan_id(&mut pending_channel).unwrap();
    assert_eq!(channel.short_chan_id(), pending_channel.short_chan_id());
    assert!(!pending_channel.is_pending);
}
