use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction as DbDirection, IteratorMode, Options, WriteBatch, DB};
use secp256k1::PublicKey;
use serde::Serialize;
use tracing::debug;

use crate::chain::{OutPoint, ShortChannelId, Transaction};
use crate::channel::{
    ChannelCloseSummary, ChannelStateStore, ChannelStatus, CommitDiff, Commitment,
    ForwardingPackage, OpenChannel,
};
use crate::contractcourt::{
    ArbitratorLog, ArbitratorState, CommitSet, ContractError, ContractResolutions,
    ContractResolver,
};
use crate::invoice::{
    apply_invoice_update, deserialize_invoice, serialize_invoice, Invoice, InvoiceError,
    InvoiceQuery, InvoiceSlice, InvoiceStore, InvoiceUpdateDesc, MAX_MEMO_SIZE,
    MAX_PAYMENT_REQUEST_SIZE, MAX_RECEIPT_SIZE,
};
use crate::now_timestamp_as_nanos_u64;
use crate::store::StoreError;

use super::schema::*;

/// The embedded database of the node: one rocksdb instance holding every
/// channel, invoice and arbitrator namespace under one-byte key prefixes.
/// Multi-key mutations go through a single `WriteBatch`, so readers observe
/// either all of an operation's writes or none of them.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<DB>,
}

pub fn serialize_to_vec<T: ?Sized + Serialize>(value: &T, field_name: &str) -> Vec<u8> {
    bincode::serialize(value)
        .unwrap_or_else(|e| panic!("serialization of {} failed: {}", field_name, e))
}

pub fn deserialize_from<'a, T>(slice: &'a [u8], field_name: &str) -> T
where
    T: serde::Deserialize<'a>,
{
    bincode::deserialize(slice)
        .unwrap_or_else(|e| panic!("deserialization of {} failed: {}", field_name, e))
}

fn chan_key(prefix: u8, chan_point: &OutPoint) -> Vec<u8> {
    [&[prefix], chan_point.to_bytes().as_slice()].concat()
}

fn height_key(prefix: u8, chan_point: &OutPoint, height: u64) -> Vec<u8> {
    [
        &[prefix],
        chan_point.to_bytes().as_slice(),
        height.to_be_bytes().as_slice(),
    ]
    .concat()
}

fn open_channel_key(node_pub: &PublicKey, chan_point: &OutPoint) -> Vec<u8> {
    [
        &[OPEN_CHANNEL_PREFIX],
        node_pub.serialize().as_slice(),
        chan_point.to_bytes().as_slice(),
    ]
    .concat()
}

enum KeyValue {
    OpenChannel(PublicKey, OutPoint, OpenChannel),
    ChannelNodeIndex(OutPoint, PublicKey),
    BroadcastedCommitment(OutPoint, Transaction),
    CommitDiff(OutPoint, CommitDiff),
    RevocationLog(OutPoint, u64, Commitment),
    FwdPackage(OutPoint, u64, ForwardingPackage),
    ClosedChannel(OutPoint, ChannelCloseSummary),
    Invoice(u32, Invoice),
    InvoiceHashIndex(crate::chain::Hash256, u32),
    InvoiceAddIndex(u64, u32),
    InvoiceSettleIndex(u64, u32),
}

trait StoreKeyValue {
    fn key(&self) -> Vec<u8>;
    fn value(&self) -> Vec<u8>;
}

impl StoreKeyValue for KeyValue {
    fn key(&self) -> Vec<u8> {
        match self {
            KeyValue::OpenChannel(node_pub, chan_point, _) => {
                open_channel_key(node_pub, chan_point)
            }
            KeyValue::ChannelNodeIndex(chan_point, _) => {
                chan_key(CHANNEL_NODE_INDEX_PREFIX, chan_point)
            }
            KeyValue::BroadcastedCommitment(chan_point, _) => {
                chan_key(BROADCASTED_COMMITMENT_PREFIX, chan_point)
            }
            KeyValue::CommitDiff(chan_point, _) => chan_key(COMMIT_DIFF_PREFIX, chan_point),
            KeyValue::RevocationLog(chan_point, height, _) => {
                height_key(REVOCATION_LOG_PREFIX, chan_point, *height)
            }
            KeyValue::FwdPackage(chan_point, height, _) => {
                height_key(FWD_PACKAGE_PREFIX, chan_point, *height)
            }
            KeyValue::ClosedChannel(chan_point, _) => chan_key(CLOSED_CHANNEL_PREFIX, chan_point),
            KeyValue::Invoice(invoice_num, _) => {
                [&[INVOICE_PREFIX], invoice_num.to_be_bytes().as_slice()].concat()
            }
            KeyValue::InvoiceHashIndex(payment_hash, _) => {
                [&[INVOICE_HASH_INDEX_PREFIX], payment_hash.as_ref()].concat()
            }
            KeyValue::InvoiceAddIndex(seq, _) => {
                [&[INVOICE_ADD_INDEX_PREFIX], seq.to_be_bytes().as_slice()].concat()
            }
            KeyValue::InvoiceSettleIndex(seq, _) => [
                &[INVOICE_SETTLE_INDEX_PREFIX],
                seq.to_be_bytes().as_slice(),
            ]
            .concat(),
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            KeyValue::OpenChannel(_, _, channel) => serialize_to_vec(channel, "OpenChannel"),
            KeyValue::ChannelNodeIndex(_, node_pub) => node_pub.serialize().to_vec(),
            KeyValue::BroadcastedCommitment(_, tx) => serialize_to_vec(tx, "Transaction"),
            KeyValue::CommitDiff(_, diff) => serialize_to_vec(diff, "CommitDiff"),
            KeyValue::RevocationLog(_, _, commitment) => {
                serialize_to_vec(commitment, "Commitment")
            }
            KeyValue::FwdPackage(_, _, fwd_pkg) => serialize_to_vec(fwd_pkg, "ForwardingPackage"),
            KeyValue::ClosedChannel(_, summary) => {
                serialize_to_vec(summary, "ChannelCloseSummary")
            }
            KeyValue::Invoice(_, invoice) => serialize_invoice(invoice),
            KeyValue::InvoiceHashIndex(_, invoice_num) => invoice_num.to_be_bytes().to_vec(),
            KeyValue::InvoiceAddIndex(_, invoice_num) => invoice_num.to_be_bytes().to_vec(),
            KeyValue::InvoiceSettleIndex(_, invoice_num) => invoice_num.to_be_bytes().to_vec(),
        }
    }
}

struct Batch {
    db: Arc<DB>,
    wb: WriteBatch,
}

impl Batch {
    fn put_kv(&mut self, key_value: KeyValue) {
        self.put(key_value.key(), key_value.value());
    }

    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.wb.put(key, value);
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.wb.delete(key.as_ref());
    }

    fn commit(self) -> Result<(), StoreError> {
        self.db
            .write(self.wb)
            .map_err(|e| StoreError::Db(e.to_string()))
    }
}

impl Store {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path).map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key.as_ref())
            .map_err(|e| StoreError::Db(e.to_string()))
    }

    fn batch(&self) -> Batch {
        Batch {
            db: Arc::clone(&self.db),
            wb: WriteBatch::default(),
        }
    }

    fn prefix_iterator(&self, prefix: Vec<u8>) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + '_ {
        self.db
            .iterator(IteratorMode::From(&prefix, DbDirection::Forward))
            .map(|item| item.expect("iterator should be OK"))
            .take_while(move |(key, _)| key.starts_with(&prefix))
    }

    fn range_iterator(
        &self,
        start: Vec<u8>,
        prefix: Vec<u8>,
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + '_ {
        self.db
            .iterator(IteratorMode::From(&start, DbDirection::Forward))
            .map(|item| item.expect("iterator should be OK"))
            .take_while(move |(key, _)| key.starts_with(&prefix))
    }

    /// The arbitrator log namespace of a single channel.
    pub fn arbitrator_log(&self, chan_point: OutPoint) -> ChannelArbitratorLog {
        ChannelArbitratorLog {
            store: self.clone(),
            chan_point,
        }
    }

    fn fetch_stored_channel(&self, channel: &OpenChannel) -> Result<OpenChannel, StoreError> {
        let key = open_channel_key(&channel.identity_pub, &channel.funding_outpoint);
        let raw = self.get(key)?.ok_or(StoreError::ChannelNotFound)?;
        Ok(deserialize_from(&raw, "OpenChannel"))
    }

    fn put_channel(&self, batch: &mut Batch, channel: &OpenChannel) {
        batch.put_kv(KeyValue::OpenChannel(
            channel.identity_pub,
            channel.funding_outpoint,
            channel.clone(),
        ));
        batch.put_kv(KeyValue::ChannelNodeIndex(
            channel.funding_outpoint,
            channel.identity_pub,
        ));
    }
}

impl ChannelStateStore for Store {
    fn sync_pending(
        &self,
        channel: &mut OpenChannel,
        addr: SocketAddr,
        broadcast_height: u32,
    ) -> Result<(), StoreError> {
        channel.is_pending = true;
        channel.funding_broadcast_height = broadcast_height;
        channel.remote_address = Some(addr);

        let mut batch = self.batch();
        self.put_channel(&mut batch, channel);
        batch.commit()?;

        debug!(
            chan_point = %channel.funding_outpoint,
            broadcast_height,
            "synced pending channel"
        );
        Ok(())
    }

    fn mark_as_open(
        &self,
        channel: &mut OpenChannel,
        location: ShortChannelId,
    ) -> Result<(), StoreError> {
        let mut stored = self.fetch_stored_channel(channel)?;
        if !stored.is_pending {
            if stored.short_channel_id == location {
                channel.is_pending = false;
                channel.short_channel_id = location;
                return Ok(());
            }
            return Err(StoreError::AlreadyOpen);
        }

        stored.is_pending = false;
        stored.short_channel_id = location;

        let mut batch = self.batch();
        self.put_channel(&mut batch, &stored);
        batch.commit()?;

        channel.is_pending = false;
        channel.short_channel_id = location;
        Ok(())
    }

    fn refresh_short_chan_id(&self, channel: &mut OpenChannel) -> Result<(), StoreError> {
        let stored = self.fetch_stored_channel(channel)?;
        channel.short_channel_id = stored.short_channel_id;
        channel.is_pending = stored.is_pending;
        Ok(())
    }

    fn fetch_open_channels(&self, node: &PublicKey) -> Result<Vec<OpenChannel>, StoreError> {
        let prefix = [&[OPEN_CHANNEL_PREFIX], node.serialize().as_slice()].concat();
        Ok(self
            .prefix_iterator(prefix)
            .map(|(_, value)| deserialize_from(&value, "OpenChannel"))
            .collect())
    }

    fn fetch_pending_channels(&self) -> Result<Vec<OpenChannel>, StoreError> {
        Ok(self
            .fetch_all_channels()?
            .into_iter()
            .filter(|channel| channel.is_pending)
            .collect())
    }

    fn fetch_all_channels(&self) -> Result<Vec<OpenChannel>, StoreError> {
        Ok(self
            .prefix_iterator(vec![OPEN_CHANNEL_PREFIX])
            .map(|(_, value)| deserialize_from(&value, "OpenChannel"))
            .collect())
    }

    fn fetch_waiting_close_channels(&self) -> Result<Vec<OpenChannel>, StoreError> {
        Ok(self
            .fetch_all_channels()?
            .into_iter()
            .filter(|channel| channel.status.contains(ChannelStatus::COMMIT_BROADCASTED))
            .collect())
    }

    fn fetch_closed_channels(
        &self,
        pending_only: bool,
    ) -> Result<Vec<ChannelCloseSummary>, StoreError> {
        Ok(self
            .prefix_iterator(vec![CLOSED_CHANNEL_PREFIX])
            .map(|(_, value)| deserialize_from::<ChannelCloseSummary>(&value, "ChannelCloseSummary"))
            .filter(|summary| !pending_only || summary.is_pending)
            .collect())
    }

    fn update_commitment(
        &self,
        channel: &mut OpenChannel,
        commitment: Commitment,
    ) -> Result<(), StoreError> {
        let mut stored = self.fetch_stored_channel(channel)?;

        let current = stored.local_commitment.commit_height;
        let new = commitment.commit_height;
        if new != current + 1 && !(new == 0 && current == 0) {
            return Err(StoreError::CommitHeightOutOfOrder { current, new });
        }

        stored.local_commitment = commitment.clone();

        let mut batch = self.batch();
        self.put_channel(&mut batch, &stored);
        batch.commit()?;

        channel.local_commitment = commitment;
        Ok(())
    }

    fn append_remote_commit_chain(
        &self,
        channel: &mut OpenChannel,
        diff: CommitDiff,
    ) -> Result<(), StoreError> {
        self.fetch_stored_channel(channel)?;

        let diff_key = chan_key(COMMIT_DIFF_PREFIX, &channel.funding_outpoint);
        if self.get(&diff_key)?.is_some() {
            return Err(StoreError::PendingCommitExists);
        }

        let mut batch = self.batch();
        batch.put_kv(KeyValue::CommitDiff(channel.funding_outpoint, diff));
        batch.commit()
    }

    fn remote_commit_chain_tip(&self, channel: &OpenChannel) -> Result<CommitDiff, StoreError> {
        let diff_key = chan_key(COMMIT_DIFF_PREFIX, &channel.funding_outpoint);
        let raw = self.get(diff_key)?.ok_or(StoreError::NoPendingCommit)?;
        Ok(deserialize_from(&raw, "CommitDiff"))
    }

    fn advance_commit_chain_tail(
        &self,
        channel: &mut OpenChannel,
        fwd_pkg: ForwardingPackage,
    ) -> Result<(), StoreError> {
        let stored = self.fetch_stored_channel(channel)?;
        let diff = self.remote_commit_chain_tip(channel)?;

        let prior_remote = stored.remote_commitment.clone();

        // The caller's handle carries the freshly rotated revocation state;
        // persist it together with the promoted commitment.
        channel.remote_commitment = diff.commitment.clone();

        let mut batch = self.batch();
        batch.put_kv(KeyValue::RevocationLog(
            channel.funding_outpoint,
            prior_remote.commit_height,
            prior_remote,
        ));
        batch.put_kv(KeyValue::FwdPackage(
            channel.funding_outpoint,
            fwd_pkg.height,
            fwd_pkg,
        ));
        batch.delete(chan_key(COMMIT_DIFF_PREFIX, &channel.funding_outpoint));
        self.put_channel(&mut batch, channel);
        batch.commit()
    }

    fn find_previous_state(
        &self,
        channel: &OpenChannel,
        height: u64,
    ) -> Result<Commitment, StoreError> {
        let key = height_key(REVOCATION_LOG_PREFIX, &channel.funding_outpoint, height);
        let raw = self.get(key)?.ok_or(StoreError::NoRevocationLogFound)?;
        Ok(deserialize_from(&raw, "Commitment"))
    }

    fn revocation_log_tail(&self, channel: &OpenChannel) -> Result<Commitment, StoreError> {
        let prefix = chan_key(REVOCATION_LOG_PREFIX, &channel.funding_outpoint);
        self.prefix_iterator(prefix)
            .last()
            .map(|(_, value)| deserialize_from(&value, "Commitment"))
            .ok_or(StoreError::NoRevocationLogFound)
    }

    fn commitment_height(&self, channel: &OpenChannel) -> Result<u64, StoreError> {
        let stored = self.fetch_stored_channel(channel)?;
        Ok(stored.local_commitment.commit_height)
    }

    fn mark_commitment_broadcasted(
        &self,
        channel: &mut OpenChannel,
        close_tx: Transaction,
    ) -> Result<(), StoreError> {
        let mut stored = self.fetch_stored_channel(channel)?;
        stored.status |= ChannelStatus::COMMIT_BROADCASTED;

        let mut batch = self.batch();
        self.put_channel(&mut batch, &stored);
        batch.put_kv(KeyValue::BroadcastedCommitment(
            channel.funding_outpoint,
            close_tx,
        ));
        batch.commit()?;

        channel.status = stored.status;
        Ok(())
    }

    fn broadcasted_commitment(&self, channel: &OpenChannel) -> Result<Transaction, StoreError> {
        let key = chan_key(BROADCASTED_COMMITMENT_PREFIX, &channel.funding_outpoint);
        let raw = self
            .get(key)?
            .ok_or(StoreError::NoBroadcastedCommitment)?;
        Ok(deserialize_from(&raw, "Transaction"))
    }

    fn insert_next_revocation(
        &self,
        channel: &mut OpenChannel,
        revocation: PublicKey,
    ) -> Result<(), StoreError> {
        let mut stored = self.fetch_stored_channel(channel)?;
        stored.remote_next_revocation = Some(revocation);

        let mut batch = self.batch();
        self.put_channel(&mut batch, &stored);
        batch.commit()?;

        channel.remote_next_revocation = Some(revocation);
        Ok(())
    }

    fn close_channel(
        &self,
        channel: &OpenChannel,
        summary: ChannelCloseSummary,
    ) -> Result<(), StoreError> {
        let chan_point = channel.funding_outpoint;
        self.fetch_stored_channel(channel)?;

        let mut batch = self.batch();
        batch.delete(open_channel_key(&channel.identity_pub, &chan_point));
        batch.delete(chan_key(CHANNEL_NODE_INDEX_PREFIX, &chan_point));
        batch.delete(chan_key(BROADCASTED_COMMITMENT_PREFIX, &chan_point));
        batch.delete(chan_key(COMMIT_DIFF_PREFIX, &chan_point));
        for (key, _) in self.prefix_iterator(chan_key(REVOCATION_LOG_PREFIX, &chan_point)) {
            batch.delete(key);
        }
        for (key, _) in self.prefix_iterator(chan_key(FWD_PACKAGE_PREFIX, &chan_point)) {
            batch.delete(key);
        }
        batch.put_kv(KeyValue::ClosedChannel(chan_point, summary));
        batch.commit()?;

        debug!(%chan_point, "channel closed, open state removed");
        Ok(())
    }

    fn mark_chan_fully_closed(&self, chan_point: &OutPoint) -> Result<(), StoreError> {
        let key = chan_key(CLOSED_CHANNEL_PREFIX, chan_point);
        let raw = self.get(&key)?.ok_or(StoreError::NoCloseSummary)?;
        let mut summary: ChannelCloseSummary =
            deserialize_from(&raw, "ChannelCloseSummary");
        summary.is_pending = false;

        let mut batch = self.batch();
        batch.put_kv(KeyValue::ClosedChannel(*chan_point, summary));
        batch.commit()
    }
}

impl Store {
    fn read_counter(&self, prefix: u8) -> Result<u64, StoreError> {
        Ok(self
            .get([prefix])?
            .map(|raw| {
                u64::from_be_bytes(
                    raw.as_slice()
                        .try_into()
                        .expect("counter should be 8 bytes"),
                )
            })
            .unwrap_or(0))
    }

    fn invoice_num_for_hash(
        &self,
        payment_hash: &crate::chain::Hash256,
    ) -> Result<Option<u32>, StoreError> {
        let key = [&[INVOICE_HASH_INDEX_PREFIX], payment_hash.as_ref()].concat();
        match self.get(key)? {
            Some(raw) => Ok(Some(u32::from_be_bytes(
                raw.as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("invoice number index".to_string()))?,
            ))),
            None => Ok(None),
        }
    }

    fn fetch_invoice_by_num(&self, invoice_num: u32) -> Result<Invoice, InvoiceError> {
        let key = [&[INVOICE_PREFIX], invoice_num.to_be_bytes().as_slice()].concat();
        let raw = self
            .get(key)
            .map_err(store_to_invoice_err)?
            .ok_or(InvoiceError::InvoiceNotFound)?;
        deserialize_invoice(&raw)
    }
}

fn store_to_invoice_err(err: StoreError) -> InvoiceError {
    InvoiceError::Corrupt(err.to_string())
}

fn validate_invoice(invoice: &Invoice) -> Result<(), InvoiceError> {
    if invoice.memo.len() > MAX_MEMO_SIZE {
        return Err(InvoiceError::MemoTooLarge(invoice.memo.len()));
    }
    if invoice.receipt.len() > MAX_RECEIPT_SIZE {
        return Err(InvoiceError::ReceiptTooLarge(invoice.receipt.len()));
    }
    if invoice.payment_request.len() > MAX_PAYMENT_REQUEST_SIZE {
        return Err(InvoiceError::PaymentRequestTooLarge(
            invoice.payment_request.len(),
        ));
    }
    Ok(())
}

impl InvoiceStore for Store {
    fn add_invoice(
        &self,
        invoice: &mut Invoice,
        payment_hash: crate::chain::Hash256,
    ) -> Result<u64, InvoiceError> {
        validate_invoice(invoice)?;

        if self
            .invoice_num_for_hash(&payment_hash)
            .map_err(store_to_invoice_err)?
            .is_some()
        {
            return Err(InvoiceError::DuplicateInvoice);
        }

        let invoice_num =
            self.read_counter(INVOICE_NUM_COUNTER_PREFIX).map_err(store_to_invoice_err)? as u32;
        let add_seq = self
            .read_counter(INVOICE_ADD_COUNTER_PREFIX)
            .map_err(store_to_invoice_err)?
            + 1;
        invoice.add_index = add_seq;

        let mut batch = self.batch();
        batch.put(
            [INVOICE_NUM_COUNTER_PREFIX],
            (invoice_num as u64 + 1).to_be_bytes(),
        );
        batch.put([INVOICE_ADD_COUNTER_PREFIX], add_seq.to_be_bytes());
        batch.put_kv(KeyValue::InvoiceHashIndex(payment_hash, invoice_num));
        batch.put_kv(KeyValue::InvoiceAddIndex(add_seq, invoice_num));
        batch.put_kv(KeyValue::Invoice(invoice_num, invoice.clone()));
        batch.commit().map_err(store_to_invoice_err)?;

        debug!(%payment_hash, add_index = add_seq, "added invoice");
        Ok(add_seq)
    }

    fn lookup_invoice(&self, payment_hash: &crate::chain::Hash256) -> Result<Invoice, InvoiceError> {
        let invoice_num = self
            .invoice_num_for_hash(payment_hash)
            .map_err(store_to_invoice_err)?
            .ok_or(InvoiceError::InvoiceNotFound)?;
        self.fetch_invoice_by_num(invoice_num)
    }

    fn update_invoice(
        &self,
        payment_hash: &crate::chain::Hash256,
        callback: &dyn Fn(&Invoice) -> Result<InvoiceUpdateDesc, InvoiceError>,
    ) -> Result<Invoice, InvoiceError> {
        let invoice_num = self
            .invoice_num_for_hash(payment_hash)
            .map_err(store_to_invoice_err)?
            .ok_or(InvoiceError::InvoiceNotFound)?;
        let invoice = self.fetch_invoice_by_num(invoice_num)?;

        // The callback sees its own copy; only the returned descriptor can
        // change what is persisted.
        let snapshot = invoice.clone();
        let update = callback(&snapshot)?;

        let settle_hint = self
            .read_counter(INVOICE_SETTLE_COUNTER_PREFIX)
            .map_err(store_to_invoice_err)?
            + 1;
        let now_ns = now_timestamp_as_nanos_u64();
        let result = apply_invoice_update(invoice, payment_hash, update, settle_hint, now_ns)?;

        let mut batch = self.batch();
        if result.settled {
            batch.put([INVOICE_SETTLE_COUNTER_PREFIX], settle_hint.to_be_bytes());
            batch.put_kv(KeyValue::InvoiceSettleIndex(settle_hint, invoice_num));
        }
        batch.put_kv(KeyValue::Invoice(invoice_num, result.invoice.clone()));
        batch.commit().map_err(store_to_invoice_err)?;

        Ok(result.invoice)
    }

    fn invoices_added_since(&self, add_index: u64) -> Result<Vec<Invoice>, InvoiceError> {
        // An index of zero is a no-op so subscribers always get an explicit
        // checkpoint before streaming.
        if add_index == 0 {
            return Ok(Vec::new());
        }
        self.invoices_in_series(INVOICE_ADD_INDEX_PREFIX, add_index)
    }

    fn invoices_settled_since(&self, settle_index: u64) -> Result<Vec<Invoice>, InvoiceError> {
        if settle_index == 0 {
            return Ok(Vec::new());
        }
        self.invoices_in_series(INVOICE_SETTLE_INDEX_PREFIX, settle_index)
    }

    fn query_invoices(&self, query: InvoiceQuery) -> Result<InvoiceSlice, InvoiceError> {
        let entries: Vec<(u64, u32)> = self
            .prefix_iterator(vec![INVOICE_ADD_INDEX_PREFIX])
            .map(|(key, value)| {
                let seq = u64::from_be_bytes(key[1..].try_into().expect("add index key"));
                let invoice_num =
                    u32::from_be_bytes(value.as_ref().try_into().expect("invoice num value"));
                (seq, invoice_num)
            })
            .collect();

        let mut resp = InvoiceSlice::default();

        let selected: Vec<&(u64, u32)> = if !query.reversed {
            entries
                .iter()
                .filter(|(seq, _)| *seq > query.index_offset)
                .collect()
        } else {
            match query.index_offset {
                // No offset: walk backwards from the newest invoice.
                0 => entries.iter().rev().collect(),
                // Nothing exists before the very first invoice.
                1 => Vec::new(),
                offset => entries
                    .iter()
                    .filter(|(seq, _)| *seq < offset)
                    .rev()
                    .collect(),
            }
        };

        for (_, invoice_num) in selected {
            if resp.invoices.len() as u64 >= query.num_max_invoices {
                break;
            }
            let invoice = self.fetch_invoice_by_num(*invoice_num)?;
            if query.pending_only && invoice.terms.state == crate::invoice::ContractState::Settled
            {
                continue;
            }
            resp.invoices.push(invoice);
        }

        if query.reversed {
            resp.invoices.reverse();
        }

        if let (Some(first), Some(last)) = (resp.invoices.first(), resp.invoices.last()) {
            resp.first_index_offset = first.add_index;
            resp.last_index_offset = last.add_index;
        }

        Ok(resp)
    }

    fn fetch_all_invoices(&self, pending_only: bool) -> Result<Vec<Invoice>, InvoiceError> {
        let mut invoices = Vec::new();
        for (_, value) in self.prefix_iterator(vec![INVOICE_PREFIX]) {
            let invoice = deserialize_invoice(&value)?;
            if pending_only && invoice.terms.state == crate::invoice::ContractState::Settled {
                continue;
            }
            invoices.push(invoice);
        }
        Ok(invoices)
    }
}

impl Store {
    fn invoices_in_series(
        &self,
        prefix: u8,
        since_index: u64,
    ) -> Result<Vec<Invoice>, InvoiceError> {
        let start = [&[prefix], (since_index + 1).to_be_bytes().as_slice()].concat();
        let mut invoices = Vec::new();
        for (_, value) in self.range_iterator(start, vec![prefix]) {
            let invoice_num =
                u32::from_be_bytes(value.as_ref().try_into().expect("invoice num value"));
            invoices.push(self.fetch_invoice_by_num(invoice_num)?);
        }
        Ok(invoices)
    }
}

/// The arbitrator log of one channel, persisted under the channel's funding
/// outpoint.
#[derive(Clone)]
pub struct ChannelArbitratorLog {
    store: Store,
    chan_point: OutPoint,
}

fn log_err(err: StoreError) -> ContractError {
    ContractError::Log(err.to_string())
}

impl ArbitratorLog for ChannelArbitratorLog {
    fn current_state(&self) -> Result<ArbitratorState, ContractError> {
        let key = chan_key(ARBITRATOR_STATE_PREFIX, &self.chan_point);
        Ok(self
            .store
            .get(key)
            .map_err(log_err)?
            .map(|raw| deserialize_from(&raw, "ArbitratorState"))
            .unwrap_or(ArbitratorState::Default))
    }

    fn commit_state(&self, state: ArbitratorState) -> Result<(), ContractError> {
        let mut batch = self.store.batch();
        batch.put(
            chan_key(ARBITRATOR_STATE_PREFIX, &self.chan_point),
            serialize_to_vec(&state, "ArbitratorState"),
        );
        batch.commit().map_err(log_err)
    }

    fn fetch_unresolved_contracts(&self) -> Result<Vec<ContractResolver>, ContractError> {
        let prefix = chan_key(RESOLVER_PREFIX, &self.chan_point);
        Ok(self
            .store
            .prefix_iterator(prefix)
            .map(|(_, value)| deserialize_from(&value, "ContractResolver"))
            .collect())
    }

    fn insert_unresolved_contracts(
        &self,
        resolvers: &[ContractResolver],
    ) -> Result<(), ContractError> {
        let mut batch = self.store.batch();
        for resolver in resolvers {
            let key = [
                chan_key(RESOLVER_PREFIX, &self.chan_point),
                resolver.resolver_key(),
            ]
            .concat();
            batch.put(key, serialize_to_vec(resolver, "ContractResolver"));
        }
        batch.commit().map_err(log_err)
    }

    fn swap_contract(
        &self,
        old: &ContractResolver,
        new: &ContractResolver,
    ) -> Result<(), ContractError> {
        let base = chan_key(RESOLVER_PREFIX, &self.chan_point);
        let mut batch = self.store.batch();
        batch.delete([base.clone(), old.resolver_key()].concat());
        batch.put(
            [base, new.resolver_key()].concat(),
            serialize_to_vec(new, "ContractResolver"),
        );
        batch.commit().map_err(log_err)
    }

    fn resolve_contract(&self, resolver: &ContractResolver) -> Result<(), ContractError> {
        let key = [
            chan_key(RESOLVER_PREFIX, &self.chan_point),
            resolver.resolver_key(),
        ]
        .concat();
        let mut batch = self.store.batch();
        batch.delete(key);
        batch.commit().map_err(log_err)
    }

    fn log_contract_resolutions(
        &self,
        resolutions: &ContractResolutions,
    ) -> Result<(), ContractError> {
        let mut batch = self.store.batch();
        batch.put(
            chan_key(RESOLUTIONS_PREFIX, &self.chan_point),
            serialize_to_vec(resolutions, "ContractResolutions"),
        );
        batch.commit().map_err(log_err)
    }

    fn fetch_contract_resolutions(&self) -> Result<ContractResolutions, ContractError> {
        let key = chan_key(RESOLUTIONS_PREFIX, &self.chan_point);
        self.store
            .get(key)
            .map_err(log_err)?
            .map(|raw| deserialize_from(&raw, "ContractResolutions"))
            .ok_or(ContractError::NoResolutions)
    }

    fn insert_confirmed_commit_set(&self, commit_set: &CommitSet) -> Result<(), ContractError> {
        let mut batch = self.store.batch();
        batch.put(
            chan_key(COMMIT_SET_PREFIX, &self.chan_point),
            serialize_to_vec(commit_set, "CommitSet"),
        );
        batch.commit().map_err(log_err)
    }

    fn fetch_confirmed_commit_set(&self) -> Result<Option<CommitSet>, ContractError> {
        let key = chan_key(COMMIT_SET_PREFIX, &self.chan_point);
        Ok(self
            .store
            .get(key)
            .map_err(log_err)?
            .map(|raw| deserialize_from(&raw, "CommitSet")))
    }

    fn wipe_history(&self) -> Result<(), ContractError> {
        let mut batch = self.store.batch();
        batch.delete(chan_key(ARBITRATOR_STATE_PREFIX, &self.chan_point));
        batch.delete(chan_key(RESOLUTIONS_PREFIX, &self.chan_point));
        batch.delete(chan_key(COMMIT_SET_PREFIX, &self.chan_point));
        for (key, _) in self
            .store
            .prefix_iterator(chan_key(RESOLVER_PREFIX, &self.chan_point))
        {
            batch.delete(key);
        }
        batch.commit().map_err(log_err)
    }
}
