//! Key material and hashing.
//!
//! Every signature in this crate is a recoverable secp256k1 ECDSA signature over a keccak-256 digest, encoded as
//! 65 bytes (`r || s || v`, with `v` as the raw recovery id).

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha3::{Digest, Keccak256};

pub const SIGNATURE_LENGTH: usize = 65;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute<T: AsRef<[S]>, S: AsRef<[u8]>>(preimages: T) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages.as_ref() {
            hasher.update(preimage.as_ref());
        }
        Self(hasher.finalize().into())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

/// A secp256k1 private key. Used both as a group member's signing key and as an engine's master key.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn new_from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> SecretKey {
        SecretKey(SigningKey::random(rng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }

        Ok(SecretKey(SigningKey::from_bytes(&bytes.into())?))
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_bytes(&bytes_vec)
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0.to_bytes());
        bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn address(&self) -> Address {
        public_key_to_address(self.0.verifying_key())
    }

    /// Derives a child key deterministically as `keccak256(self || context)`.
    pub fn derive(&self, context: &[u8]) -> Result<SecretKey> {
        let seed = Hash::compute([&self.as_bytes()[..], context]);
        Self::from_bytes(&seed.0)
    }

    pub fn sign_prehash(&self, hash: &Hash) -> Result<[u8; SIGNATURE_LENGTH]> {
        let (signature, recovery_id) = self.0.sign_prehash_recoverable(&hash.0)?;
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Ok(bytes)
    }

    pub fn transaction_signer(&self) -> PrivateKeySigner {
        PrivateKeySigner::from_signing_key(self.0.clone())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&self.address()).finish()
    }
}

impl FromStr for SecretKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SecretKey::from_hex(s)
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretKey::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Recovers the address which produced `signature` over `hash`.
pub fn recover_signer(hash: &Hash, signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(anyhow!(
            "signature must be {SIGNATURE_LENGTH} bytes, got {}",
            signature.len()
        ));
    }
    let recovery_id =
        RecoveryId::from_byte(signature[64]).ok_or_else(|| anyhow!("invalid recovery id"))?;
    let signature = Signature::from_slice(&signature[..64])?;
    let key = VerifyingKey::recover_from_prehash(&hash.0, &signature, recovery_id)?;
    Ok(public_key_to_address(&key))
}

fn public_key_to_address(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = Hash::compute([&point.as_bytes()[1..]]);
    Address::from_slice(&hash.0[12..])
}
