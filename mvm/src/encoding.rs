//! The group event and its binary encoding.
//!
//! The same encoding is used on the wire (as the payload of the relay contract's `mixin(bytes)` call and
//! `MixinTransaction(bytes)` log) and in the database. All integers are big-endian.
//!
//! | field     | size                 |
//! |-----------|----------------------|
//! | process   | 16                   |
//! | nonce     | 8                    |
//! | asset     | 16                   |
//! | amount    | 32                   |
//! | timestamp | 8                    |
//! | extra     | 2 byte length + data |
//! | signature | 2 byte length + data |

use alloy::primitives::U256;
use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::{crypto::Hash, error::EncodingError};

/// A group event. Identified by `(process, nonce)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub process: Uuid,
    pub nonce: u64,
    pub asset: Uuid,
    pub amount: U256,
    pub extra: Vec<u8>,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// The aggregated quorum proof. Empty until the event is signed.
    pub signature: Vec<u8>,
}

impl Event {
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = self.encode_unsigned()?;
        put_variable(&mut buf, "signature", &self.signature)?;
        Ok(buf)
    }

    /// Encodes every field except the signature. This is the message that members sign.
    pub fn encode_unsigned(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::with_capacity(84 + self.extra.len() + self.signature.len());
        buf.put_slice(self.process.as_bytes());
        buf.put_u64(self.nonce);
        buf.put_slice(self.asset.as_bytes());
        buf.put_slice(&self.amount.to_be_bytes::<32>());
        buf.put_u64(self.timestamp);
        put_variable(&mut buf, "extra", &self.extra)?;
        Ok(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Event, EncodingError> {
        let process = Uuid::from_bytes(take(&mut buf, "process")?);
        let nonce = u64::from_be_bytes(take(&mut buf, "nonce")?);
        let asset = Uuid::from_bytes(take(&mut buf, "asset")?);
        let amount = U256::from_be_bytes::<32>(take(&mut buf, "amount")?);
        let timestamp = u64::from_be_bytes(take(&mut buf, "timestamp")?);
        let extra = take_variable(&mut buf, "extra")?;
        let signature = take_variable(&mut buf, "signature")?;
        if buf.has_remaining() {
            return Err(EncodingError::Trailing(buf.remaining()));
        }

        Ok(Event {
            process,
            nonce,
            asset,
            amount,
            extra,
            timestamp,
            signature,
        })
    }

    pub fn signing_hash(&self) -> Result<Hash, EncodingError> {
        Ok(Hash::compute([self.encode_unsigned()?]))
    }

    /// The idempotency identifier of this event. Derived from its content, excluding the signature, so every member
    /// computes the same identifier before and after signing.
    pub fn id(&self) -> Result<String, EncodingError> {
        Ok(self.signing_hash()?.to_string())
    }

    pub fn with_signature(&self, signature: Vec<u8>) -> Event {
        Event {
            signature,
            ..self.clone()
        }
    }
}

fn put_variable(
    buf: &mut Vec<u8>,
    field: &'static str,
    data: &[u8],
) -> Result<(), EncodingError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodingError::TooLong {
        field,
        len: data.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

fn take<const N: usize>(buf: &mut &[u8], field: &'static str) -> Result<[u8; N], EncodingError> {
    if buf.remaining() < N {
        return Err(EncodingError::Truncated { field });
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_variable(buf: &mut &[u8], field: &'static str) -> Result<Vec<u8>, EncodingError> {
    let len = u16::from_be_bytes(take(buf, field)?) as usize;
    if buf.remaining() < len {
        return Err(EncodingError::Truncated { field });
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}
