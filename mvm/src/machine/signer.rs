use std::collections::BTreeMap;

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use tracing::debug;

use crate::{
    crypto::{self, SecretKey},
    encoding::Event,
    error::MachineError,
};

/// Produces and checks this member's share of a t-of-n quorum signature.
///
/// Each member signs the keccak-256 hash of the unsigned event encoding. Once `threshold` distinct members have
/// signed, the proof is the concatenation of the first `threshold` signatures, ordered by signer address.
#[derive(Debug, Clone)]
pub struct GroupSigner {
    key: SecretKey,
    members: Vec<Address>,
    threshold: usize,
}

impl GroupSigner {
    pub fn new(key: SecretKey, members: Vec<Address>, threshold: usize) -> Result<Self> {
        if threshold == 0 || threshold > members.len() {
            return Err(anyhow!(
                "threshold {threshold} is invalid for a group of {}",
                members.len()
            ));
        }
        if !members.contains(&key.address()) {
            return Err(anyhow!("{} is not a group member", key.address()));
        }
        Ok(GroupSigner {
            key,
            members,
            threshold,
        })
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn sign(&self, event: &Event) -> Result<Vec<u8>> {
        Ok(self.key.sign_prehash(&event.signing_hash()?)?.to_vec())
    }

    /// Returns the member who produced `partial`, or [MachineError::InvalidPartial].
    pub fn verify(&self, event: &Event, partial: &[u8]) -> Result<Address> {
        let invalid = |reason: String| MachineError::InvalidPartial {
            process: event.process,
            nonce: event.nonce,
            reason,
        };
        let signer = crypto::recover_signer(&event.signing_hash()?, partial)
            .map_err(|e| invalid(e.to_string()))?;
        if !self.members.contains(&signer) {
            return Err(invalid(format!("{signer} is not a group member")).into());
        }
        Ok(signer)
    }

    /// Keeps the valid partials of distinct members, ordered by signer address. Invalid partials are dropped.
    pub fn merge<I>(&self, event: &Event, partials: I) -> Vec<Vec<u8>>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut by_signer = BTreeMap::new();
        for partial in partials {
            match self.verify(event, &partial) {
                Ok(signer) => {
                    by_signer.entry(signer).or_insert(partial);
                }
                Err(e) => debug!(process = %event.process, nonce = event.nonce, %e, "dropping partial signature"),
            }
        }
        by_signer.into_values().collect()
    }

    /// Returns the quorum proof once enough members have signed.
    pub fn aggregate(&self, event: &Event, partials: &[Vec<u8>]) -> Option<Vec<u8>> {
        let merged = self.merge(event, partials.iter().cloned());
        if merged.len() < self.threshold {
            return None;
        }
        Some(merged[..self.threshold].concat())
    }

    /// Checks that `proof` holds `threshold` signatures of distinct members in ascending address order.
    pub fn verify_proof(&self, event: &Event, proof: &[u8]) -> Result<()> {
        if proof.len() != self.threshold * crypto::SIGNATURE_LENGTH {
            return Err(anyhow!("proof has the wrong length"));
        }
        let mut previous: Option<Address> = None;
        for partial in proof.chunks(crypto::SIGNATURE_LENGTH) {
            let signer = self.verify(event, partial)?;
            if previous.is_some_and(|p| p >= signer) {
                return Err(anyhow!("proof signatures are not ordered by signer"));
            }
            previous = Some(signer);
        }
        Ok(())
    }
}
