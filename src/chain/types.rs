use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use sha2::{Digest, Sha256};

use crate::serde_utils::SliceHex;

/// The smallest on-chain currency unit.
pub type Atoms = u64;

/// 1/1000 of an atom, used for off-chain precision.
pub type MilliAtoms = u64;

pub fn sha256<T: AsRef<[u8]>>(data: T) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Hash256(#[serde_as(as = "SliceHex")] [u8; 32]);

impl Hash256 {
    pub fn hash<T: AsRef<[u8]>>(data: T) -> Self {
        Self(sha256(data))
    }

    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for Hash256 {
    type Error = Vec<u8>;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = value.try_into()?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl ::core::fmt::LowerHex for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        write!(f, "{}", hex::encode(self.0))
    }
}

impl ::core::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Hash256({:#x})", self)
    }
}

impl ::core::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Hash256(0x{})", hex::encode(self.0))
    }
}

impl FromStr for Hash256 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches("0x");
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(anyhow!("Invalid hash length"));
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(&bytes);
        Ok(Hash256(data))
    }
}

/// A reference to an unspent output: the funding outpoint is the permanent
/// identity of a channel.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// Fixed width key material: 32 byte txid followed by the big-endian
    /// output index.
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[..32].copy_from_slice(self.txid.as_ref());
        bytes[32..].copy_from_slice(&self.index.to_be_bytes());
        bytes
    }
}

impl ::core::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "{:#x}:{}", self.txid, self.index)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct TxIn {
    pub previous_outpoint: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct TxOut {
    pub value: Atoms,
    pub pk_script: Vec<u8>,
}

/// An opaque-script transaction on the underlying chain. The core never
/// interprets scripts, it only moves transactions between the wallet, the
/// store and the chain backend.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let serialized = bincode::serialize(self).expect("serialize transaction");
        sha256(sha256(serialized)).into()
    }
}

/// The canonical routing identity of a confirmed channel: where in the chain
/// the funding output landed.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct ShortChannelId {
    pub block_height: u32,
    pub tx_index: u32,
    pub tx_position: u16,
}

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, tx_position: u16) -> Self {
        Self {
            block_height,
            tx_index,
            tx_position,
        }
    }

    pub fn to_u64(&self) -> u64 {
        ((self.block_height as u64) << 40)
            | ((self.tx_index as u64 & 0xff_ffff) << 16)
            | self.tx_position as u64
    }

    pub fn from_u64(id: u64) -> Self {
        Self {
            block_height: (id >> 40) as u32,
            tx_index: ((id >> 16) & 0xff_ffff) as u32,
            tx_position: (id & 0xffff) as u16,
        }
    }
}

impl ::core::fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_height, self.tx_index, self.tx_position
        )
    }
}

/// A new block connected to the main chain.
#[derive(Copy, Clone, Debug, Default)]
pub struct BlockEpoch {
    pub height: u32,
    pub hash: Hash256,
}

/// Details of a transaction spending a watched outpoint.
#[derive(Clone, Debug, Default)]
pub struct SpendDetail {
    pub spent_outpoint: OutPoint,
    pub spender_tx_hash: Hash256,
    pub spending_tx: Transaction,
    pub spending_height: u32,
}

/// A watched transaction reaching its requested confirmation depth.
#[derive(Clone, Debug, Default)]
pub struct TxConfirmation {
    pub tx: Transaction,
    pub block_hash: Hash256,
    pub block_height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_channel_id_u64_round_trip() {
        let id = ShortChannelId::new(500_000, 1024, 3);
        assert_eq!(ShortChannelId::from_u64(id.to_u64()), id);
    }

    #[test]
    fn test_hash256_hex_round_trip() {
        let hash: Hash256 = sha256(b"strand").into();
        let encoded = format!("{:#x}", hash);
        assert_eq!(encoded.parse::<Hash256>().unwrap(), hash);
    }

    #[test]
    fn test_hash256_serde_json_hex() {
        let hash: Hash256 = [0x11u8; 32].into();
        let serialized = serde_json::to_string(&hash).unwrap();
        assert_eq!(
            serialized,
            format!(r#""0x{}""#, "11".repeat(32)),
        );
        let deserialized: Hash256 = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, hash);
    }
}
