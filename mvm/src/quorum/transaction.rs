use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    primitives::{Address, TxKind, U256},
};
use anyhow::Result;

use super::contracts;
use crate::{cfg::QuorumConfig, crypto::SecretKey, encoding::Event};

/// Builds and signs the legacy transaction which submits `event` to `contract`. Returns the raw EIP-2718 encoding.
pub fn sign_group_event_transaction(
    config: &QuorumConfig,
    notifier: &SecretKey,
    contract: Address,
    nonce: u64,
    event: &Event,
) -> Result<Vec<u8>> {
    let mut tx = TxLegacy {
        chain_id: Some(config.chain_id),
        nonce,
        gas_price: *config.gas_price,
        gas_limit: config.gas_limit,
        to: TxKind::Call(contract),
        value: U256::ZERO,
        input: contracts::mixin_call(event)?.into(),
    };
    let signature = notifier.transaction_signer().sign_transaction_sync(&mut tx)?;
    let signed = tx.into_signed(signature);
    Ok(TxEnvelope::Legacy(signed).encoded_2718())
}
