use secp256k1::PublicKey;
use thiserror::Error;

use crate::chain::{Atoms, MilliAtoms};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("message payload of {0} bytes exceeds the declared maximum")]
    PayloadTooLarge(usize),
    #[error("message truncated at byte {0}")]
    Truncated(usize),
    #[error("invalid public key at byte {0}")]
    InvalidPublicKey(usize),
}

/// The response to a channel funding request: the acceptor's constraints
/// and the six public keys its commitment scripts are built from. The core
/// consumes this as an opaque record handed in by the framing layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptChannel {
    pub pending_channel_id: [u8; 32],
    pub dust_limit: Atoms,
    pub max_value_in_flight: MilliAtoms,
    pub channel_reserve: Atoms,
    pub htlc_minimum: MilliAtoms,
    pub min_accept_depth: u32,
    pub csv_delay: u16,
    pub max_accepted_htlcs: u16,
    pub funding_key: PublicKey,
    pub revocation_point: PublicKey,
    pub payment_point: PublicKey,
    pub delayed_payment_point: PublicKey,
    pub htlc_point: PublicKey,
    pub first_commitment_point: PublicKey,
}

impl AcceptChannel {
    /// Fixed payload: 32 + 8*4 + 4 + 2 + 2 + 6*33 bytes.
    pub const MAX_PAYLOAD_LENGTH: usize = 270;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MAX_PAYLOAD_LENGTH);
        buf.extend_from_slice(&self.pending_channel_id);
        buf.extend_from_slice(&self.dust_limit.to_be_bytes());
        buf.extend_from_slice(&self.max_value_in_flight.to_be_bytes());
        buf.extend_from_slice(&self.channel_reserve.to_be_bytes());
        buf.extend_from_slice(&self.htlc_minimum.to_be_bytes());
        buf.extend_from_slice(&self.min_accept_depth.to_be_bytes());
        buf.extend_from_slice(&self.csv_delay.to_be_bytes());
        buf.extend_from_slice(&self.max_accepted_htlcs.to_be_bytes());
        for key in [
            &self.funding_key,
            &self.revocation_point,
            &self.payment_point,
            &self.delayed_payment_point,
            &self.htlc_point,
            &self.first_commitment_point,
        ] {
            buf.extend_from_slice(&key.serialize());
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() > Self::MAX_PAYLOAD_LENGTH {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        let mut r = WireReader::new(payload);
        let msg = AcceptChannel {
            pending_channel_id: r.read_array::<32>()?,
            dust_limit: r.read_u64()?,
            max_value_in_flight: r.read_u64()?,
            channel_reserve: r.read_u64()?,
            htlc_minimum: r.read_u64()?,
            min_accept_depth: r.read_u32()?,
            csv_delay: r.read_u16()?,
            max_accepted_htlcs: r.read_u16()?,
            funding_key: r.read_public_key()?,
            revocation_point: r.read_public_key()?,
            payment_point: r.read_public_key()?,
            delayed_payment_point: r.read_public_key()?,
            htlc_point: r.read_public_key()?,
            first_commitment_point: r.read_public_key()?,
        };
        Ok(msg)
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.read_array::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.read_array::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.read_array::<8>()?))
    }

    fn read_public_key(&mut self) -> Result<PublicKey, WireError> {
        let pos = self.pos;
        let bytes = self.take(33)?;
        PublicKey::from_slice(bytes).map_err(|_| WireError::InvalidPublicKey(pos))
    }
}

#[cfg(test)]
mod tests {
    use secp256k1::{Secp256k1, SecretKey};

    use super::*;

    fn test_key(fill: u8) -> PublicKey {
        let secp = Secp256k1::new();
        SecretKey::from_slice(&[fill; 32])
            .expect("valid secret key")
            .public_key(&secp)
    }

    fn test_msg() -> AcceptChannel {
        AcceptChannel {
            pending_channel_id: [0xaa; 32],
            dust_limit: 6030,
            max_value_in_flight: 5_000_000_000,
            channel_reserve: 100_000,
            htlc_minimum: 1000,
            min_accept_depth: 6,
            csv_delay: 144,
            max_accepted_htlcs: 483,
            funding_key: test_key(1),
            revocation_point: test_key(2),
            payment_point: test_key(3),
            delayed_payment_point: test_key(4),
            htlc_point: test_key(5),
            first_commitment_point: test_key(6),
        }
    }

    #[test]
    fn test_accept_channel_round_trip() {
        let msg = test_msg();
        let encoded = msg.encode();
        assert_eq!(AcceptChannel::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_accept_channel_payload_length() {
        let encoded = test_msg().encode();
        assert_eq!(encoded.len(), AcceptChannel::MAX_PAYLOAD_LENGTH);
    }

    #[test]
    fn test_accept_channel_truncated() {
        let encoded = test_msg().encode();
        let err = AcceptChannel::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::Truncated(_)));
    }

    #[test]
    fn test_accept_channel_oversized_payload() {
        let mut encoded = test_msg().encode();
        encoded.push(0);
        let err = AcceptChannel::decode(&encoded).unwrap_err();
        assert_eq!(err, WireError::PayloadTooLarge(271));
    }
}
