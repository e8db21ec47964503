use std::net::SocketAddr;
use std::path::Path;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tempfile::TempDir as OldTempDir;

use crate::chain::{Hash256, OutPoint, ShortChannelId, Transaction, TxIn, TxOut};
use crate::channel::{
    ChannelCloseSummary, ChannelConfig, ChannelConstraints, ChannelStatus, ChannelType,
    CloseType, Commitment, KeyDescriptor, KeyLocator, OpenChannel, RevocationProducer,
    RevocationStore,
};

pub struct TempDir(OldTempDir);

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        Self(
            tempfile::Builder::new()
                .prefix(prefix)
                .tempdir()
                .expect("create temp directory"),
        )
    }
}

impl AsRef<Path> for TempDir {
    fn as_ref(&self) -> &Path {
        self.0.path()
    }
}

pub fn gen_rand_sha256_hash() -> Hash256 {
    Hash256::hash(rand::random::<[u8; 32]>())
}

pub fn gen_rand_keypair() -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&rand::random::<[u8; 32]>()).expect("valid secret key");
    (secret, secret.public_key(&secp))
}

pub fn test_addr() -> SocketAddr {
    "127.0.0.1:18556".parse().expect("valid socket address")
}

pub fn test_tx() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_outpoint: OutPoint::new([0x01; 32].into(), u32::MAX),
            signature_script: vec![0x04, 0x31, 0xdc, 0x00, 0x1b, 0x01, 0x62],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 5_000_000_000,
            pk_script: vec![0x41, 0x04, 0xd6, 0x4b, 0xac],
        }],
        lock_time: 5,
    }
}

fn test_key_desc(pub_key: PublicKey, family: u32, index: u32) -> KeyDescriptor {
    KeyDescriptor {
        pub_key,
        key_locator: KeyLocator { family, index },
    }
}

fn test_channel_config(pub_key: PublicKey) -> ChannelConfig {
    ChannelConfig {
        constraints: ChannelConstraints {
            dust_limit: 500,
            max_pending_amount: 50_000_000,
            chan_reserve: 1_000,
            min_htlc: 1_000,
            max_accepted_htlcs: 10,
            csv_delay: 144,
        },
        multi_sig_key: test_key_desc(pub_key, 0, 9),
        revocation_base_point: test_key_desc(pub_key, 1, 8),
        payment_base_point: test_key_desc(pub_key, 2, 7),
        delay_base_point: test_key_desc(pub_key, 3, 6),
        htlc_base_point: test_key_desc(pub_key, 4, 5),
    }
}

/// A freshly negotiated single funder channel with one revocation exchanged,
/// mirroring the state right after the funding flow hands the channel off.
pub fn create_test_channel() -> (OpenChannel, SecretKey) {
    let (multi_sig_secret, local_pub) = gen_rand_keypair();
    let (_, remote_pub) = gen_rand_keypair();

    let seed = rand::random::<[u8; 32]>();
    let producer = RevocationProducer::new(seed);
    let mut store = RevocationStore::new();
    store
        .add_next_entry(producer.at_index(0).expect("pre-image at index 0"))
        .expect("add first revocation entry");

    let commitment = |local_balance, remote_balance| Commitment {
        commit_height: 0,
        local_log_index: 0,
        local_htlc_index: 0,
        remote_log_index: 0,
        remote_htlc_index: 0,
        local_balance,
        remote_balance,
        commit_fee: 5_000,
        fee_per_kb: 10_000,
        commit_tx: test_tx(),
        commit_sig: vec![1; 64],
        htlcs: Vec::new(),
    };

    let channel = OpenChannel {
        chan_type: ChannelType::SINGLE_FUNDER,
        chain_hash: Hash256::hash(b"strand-testnet"),
        funding_outpoint: OutPoint::new(gen_rand_sha256_hash(), rand::random::<u32>() % 16),
        short_channel_id: ShortChannelId::default(),
        is_pending: true,
        is_initiator: true,
        status: ChannelStatus::DEFAULT,
        funding_broadcast_height: 0,
        num_confs_required: 4,
        identity_pub: remote_pub,
        remote_address: None,
        capacity: 10_000_000,
        total_matoms_sent: 8,
        total_matoms_received: 2,
        local_chan_cfg: test_channel_config(local_pub),
        remote_chan_cfg: test_channel_config(remote_pub),
        local_commitment: commitment(9_000_000, 3_000_000),
        remote_commitment: commitment(9_000_000, 3_000_000),
        remote_current_revocation: Some(remote_pub),
        remote_next_revocation: Some(remote_pub),
        revocation_producer: producer,
        revocation_store: store,
    };

    (channel, multi_sig_secret)
}

pub fn test_close_summary(chan_point: OutPoint, close_type: CloseType) -> ChannelCloseSummary {
    let (_, remote_pub) = gen_rand_keypair();
    ChannelCloseSummary {
        chan_point,
        short_chan_id: ShortChannelId::default(),
        chain_hash: Hash256::hash(b"strand-testnet"),
        closing_txid: gen_rand_sha256_hash(),
        remote_pub,
        capacity: 10_000_000,
        close_height: 0,
        settled_balance: 500,
        time_locked_balance: 10_000,
        close_type,
        is_pending: true,
    }
}
