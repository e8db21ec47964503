use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::chain::{Hash256, MilliAtoms, ShortChannelId};
use crate::channel::CircuitKey;
use crate::serde_utils::SliceHex;

use super::errors::InvoiceError;

/// Maximum size of the memo field of a stored invoice.
pub const MAX_MEMO_SIZE: usize = 1024;

/// Maximum size of the payment receipt stored alongside an invoice.
pub const MAX_RECEIPT_SIZE: usize = 1024;

/// Maximum size of the encoded payment request for an invoice.
pub const MAX_PAYMENT_REQUEST_SIZE: usize = 4096;

// Type codes of the per-HTLC record stream in the serialized invoice.
const CHAN_ID_TYPE: u8 = 1;
const HTLC_ID_TYPE: u8 = 3;
const AMT_TYPE: u8 = 5;
const ACCEPT_HEIGHT_TYPE: u8 = 7;
const ACCEPT_TIME_TYPE: u8 = 9;
const RESOLVE_TIME_TYPE: u8 = 11;
const EXPIRY_HEIGHT_TYPE: u8 = 13;
const STATE_TYPE: u8 = 15;

/// The state an invoice contract is in.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContractState {
    /// The invoice has only been created.
    Open = 0,
    /// The invoice has been paid and the pre-image released.
    Settled = 1,
    /// The invoice was canceled by its creator or expired.
    Canceled = 2,
    /// An HTLC paying to the invoice is locked in, but the pre-image has not
    /// been released yet.
    Accepted = 3,
}

impl ContractState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContractState::Settled | ContractState::Canceled)
    }
}

impl TryFrom<u8> for ContractState {
    type Error = InvoiceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ContractState::Open),
            1 => Ok(ContractState::Settled),
            2 => Ok(ContractState::Canceled),
            3 => Ok(ContractState::Accepted),
            other => Err(InvoiceError::Corrupt(format!(
                "unknown contract state {}",
                other
            ))),
        }
    }
}

/// The state an HTLC paying to an invoice is in. A canceled HTLC stays in
/// the map: its accept height is still needed to cancel it back upstream.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum HtlcState {
    Accepted = 0,
    Canceled = 1,
    Settled = 2,
}

impl TryFrom<u8> for HtlcState {
    type Error = InvoiceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HtlcState::Accepted),
            1 => Ok(HtlcState::Canceled),
            2 => Ok(HtlcState::Settled),
            other => Err(InvoiceError::Corrupt(format!("unknown htlc state {}", other))),
        }
    }
}

/// The payment terms that must be met before the invoice is considered
/// fulfilled.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractTerm {
    /// Revealed to the payer once an HTLC satisfying the terms arrives.
    pub payment_pre_image: Hash256,
    /// The expected amount, zero for donation-style invoices.
    pub value: MilliAtoms,
    pub state: ContractState,
}

/// A single HTLC paying to an invoice.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceHtlc {
    pub amount: MilliAtoms,
    /// Block height at which the registry accepted the HTLC.
    pub accept_height: u32,
    pub accept_time_ns: u64,
    pub resolve_time_ns: u64,
    /// Absolute expiry height of the HTLC.
    pub expiry_height: u32,
    pub state: HtlcState,
}

/// A payment invoice. Invoices are never deleted; terminal states are
/// recorded in place so the add and settle event series stay replayable.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invoice {
    #[serde_as(as = "SliceHex")]
    pub memo: Vec<u8>,
    #[serde_as(as = "SliceHex")]
    pub receipt: Vec<u8>,
    #[serde_as(as = "SliceHex")]
    pub payment_request: Vec<u8>,
    /// Minimum number of blocks before HTLC expiry required to accept a
    /// payment to this invoice.
    pub final_expiry_delta: u32,
    /// How long after creation the invoice expires, in nanoseconds.
    pub expiry_ns: u64,
    pub creation_time_ns: u64,
    pub settle_time_ns: u64,
    pub terms: ContractTerm,
    /// Position in the add event series, assigned by the registry. Starts
    /// at 1; zero means the invoice has not been persisted.
    pub add_index: u64,
    /// Position in the settle event series. Starts at 1; zero until the
    /// invoice settles.
    pub settle_index: u64,
    /// Sum of the settled and accepted HTLC amounts. Tracked independently
    /// of `terms.value` since senders may overpay.
    pub amt_paid: MilliAtoms,
    pub htlcs: BTreeMap<CircuitKey, InvoiceHtlc>,
}

impl Invoice {
    pub fn new(
        memo: Vec<u8>,
        receipt: Vec<u8>,
        payment_request: Vec<u8>,
        pre_image: Hash256,
        value: MilliAtoms,
        final_expiry_delta: u32,
        expiry_ns: u64,
        creation_time_ns: u64,
    ) -> Self {
        Self {
            memo,
            receipt,
            payment_request,
            final_expiry_delta,
            expiry_ns,
            creation_time_ns,
            settle_time_ns: 0,
            terms: ContractTerm {
                payment_pre_image: pre_image,
                value,
                state: ContractState::Open,
            },
            add_index: 0,
            settle_index: 0,
            amt_paid: 0,
            htlcs: BTreeMap::new(),
        }
    }
}

fn put_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn put_record(buf: &mut Vec<u8>, record_type: u8, value: &[u8]) {
    buf.push(record_type);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
}

/// Serialize an invoice to its durable byte representation. All integers
/// are big-endian; the HTLC map is framed as a length-prefixed record
/// stream per HTLC.
pub fn serialize_invoice(invoice: &Invoice) -> Vec<u8> {
    let mut buf = Vec::new();
    put_var_bytes(&mut buf, &invoice.memo);
    put_var_bytes(&mut buf, &invoice.receipt);
    put_var_bytes(&mut buf, &invoice.payment_request);
    buf.extend_from_slice(&invoice.final_expiry_delta.to_be_bytes());
    buf.extend_from_slice(&invoice.expiry_ns.to_be_bytes());
    buf.extend_from_slice(&invoice.creation_time_ns.to_be_bytes());
    buf.extend_from_slice(&invoice.settle_time_ns.to_be_bytes());
    buf.extend_from_slice(invoice.terms.payment_pre_image.as_ref());
    buf.extend_from_slice(&invoice.terms.value.to_be_bytes());
    buf.push(invoice.terms.state as u8);
    buf.extend_from_slice(&invoice.add_index.to_be_bytes());
    buf.extend_from_slice(&invoice.settle_index.to_be_bytes());
    buf.extend_from_slice(&invoice.amt_paid.to_be_bytes());

    for (key, htlc) in &invoice.htlcs {
        let mut stream = Vec::new();
        put_record(&mut stream, CHAN_ID_TYPE, &key.chan_id.to_u64().to_be_bytes());
        put_record(&mut stream, HTLC_ID_TYPE, &key.htlc_id.to_be_bytes());
        put_record(&mut stream, AMT_TYPE, &htlc.amount.to_be_bytes());
        put_record(
            &mut stream,
            ACCEPT_HEIGHT_TYPE,
            &htlc.accept_height.to_be_bytes(),
        );
        put_record(
            &mut stream,
            ACCEPT_TIME_TYPE,
            &htlc.accept_time_ns.to_be_bytes(),
        );
        put_record(
            &mut stream,
            RESOLVE_TIME_TYPE,
            &htlc.resolve_time_ns.to_be_bytes(),
        );
        put_record(
            &mut stream,
            EXPIRY_HEIGHT_TYPE,
            &htlc.expiry_height.to_be_bytes(),
        );
        put_record(&mut stream, STATE_TYPE, &[htlc.state as u8]);

        buf.extend_from_slice(&(stream.len() as u64).to_be_bytes());
        buf.extend_from_slice(&stream);
    }

    buf
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], InvoiceError> {
        if self.remaining() < n {
            return Err(InvoiceError::Corrupt("unexpected end of record".to_string()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, InvoiceError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, InvoiceError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, InvoiceError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_hash(&mut self) -> Result<Hash256, InvoiceError> {
        let bytes: [u8; 32] = self.take(32)?.try_into().unwrap();
        Ok(bytes.into())
    }

    fn read_var_bytes(&mut self, max: usize) -> Result<Vec<u8>, InvoiceError> {
        let len = self.read_u32()? as usize;
        if len > max {
            return Err(InvoiceError::Corrupt(format!(
                "var bytes length {} exceeds maximum {}",
                len, max
            )));
        }
        Ok(self.take(len)?.to_vec())
    }
}

fn deserialize_htlc(stream: &[u8]) -> Result<(CircuitKey, InvoiceHtlc), InvoiceError> {
    let mut key = CircuitKey::default();
    let mut htlc = InvoiceHtlc {
        amount: 0,
        accept_height: 0,
        accept_time_ns: 0,
        resolve_time_ns: 0,
        expiry_height: 0,
        state: HtlcState::Accepted,
    };

    let mut r = Reader::new(stream);
    while r.remaining() > 0 {
        let record_type = r.read_u8()?;
        let len = r.read_u8()? as usize;
        let value = r.take(len)?;
        let mut vr = Reader::new(value);
        match record_type {
            CHAN_ID_TYPE => key.chan_id = ShortChannelId::from_u64(vr.read_u64()?),
            HTLC_ID_TYPE => key.htlc_id = vr.read_u64()?,
            AMT_TYPE => htlc.amount = vr.read_u64()?,
            ACCEPT_HEIGHT_TYPE => htlc.accept_height = vr.read_u32()?,
            ACCEPT_TIME_TYPE => htlc.accept_time_ns = vr.read_u64()?,
            RESOLVE_TIME_TYPE => htlc.resolve_time_ns = vr.read_u64()?,
            EXPIRY_HEIGHT_TYPE => htlc.expiry_height = vr.read_u32()?,
            STATE_TYPE => htlc.state = HtlcState::try_from(vr.read_u8()?)?,
            other => {
                return Err(InvoiceError::Corrupt(format!(
                    "unknown htlc record type {}",
                    other
                )))
            }
        }
    }

    Ok((key, htlc))
}

pub fn deserialize_invoice(bytes: &[u8]) -> Result<Invoice, InvoiceError> {
    let mut r = Reader::new(bytes);

    let memo = r.read_var_bytes(MAX_MEMO_SIZE)?;
    let receipt = r.read_var_bytes(MAX_RECEIPT_SIZE)?;
    let payment_request = r.read_var_bytes(MAX_PAYMENT_REQUEST_SIZE)?;
    let final_expiry_delta = r.read_u32()?;
    let expiry_ns = r.read_u64()?;
    let creation_time_ns = r.read_u64()?;
    let settle_time_ns = r.read_u64()?;
    let payment_pre_image = r.read_hash()?;
    let value = r.read_u64()?;
    let state = ContractState::try_from(r.read_u8()?)?;
    let add_index = r.read_u64()?;
    let settle_index = r.read_u64()?;
    let amt_paid = r.read_u64()?;

    let mut htlcs = BTreeMap::new();
    while r.remaining() > 0 {
        let stream_len = r.read_u64()? as usize;
        let stream = r.take(stream_len)?;
        let (key, htlc) = deserialize_htlc(stream)?;
        htlcs.insert(key, htlc);
    }

    Ok(Invoice {
        memo,
        receipt,
        payment_request,
        final_expiry_delta,
        expiry_ns,
        creation_time_ns,
        settle_time_ns,
        terms: ContractTerm {
            payment_pre_image,
            value,
            state,
        },
        add_index,
        settle_index,
        amt_paid,
        htlcs,
    })
}
