//! The single-process group transport.
//!
//! Group consensus is external to this crate. [loopback] stands in for it when the machine runs alone: the partial
//! signatures it broadcasts are handed straight back to it, and chain events it delivers are only logged.

use anyhow::Result;
use tokio::{
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::machine::{InboundGroupMessage, OutboundGroupMessage};

pub async fn loopback(
    mut outbound: UnboundedReceiver<OutboundGroupMessage>,
    inbound: UnboundedSender<InboundGroupMessage>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let message = select! {
            _ = cancel.cancelled() => return Ok(()),
            message = outbound.recv() => message,
        };
        let Some(message) = message else {
            return Ok(());
        };
        match message {
            OutboundGroupMessage::PartialSignature {
                process,
                nonce,
                partial,
            } => {
                let message = InboundGroupMessage::PartialSignature {
                    process,
                    nonce,
                    partial,
                };
                if inbound.send(message).is_err() {
                    warn!("machine stopped receiving group messages");
                    return Ok(());
                }
            }
            OutboundGroupMessage::Deliver(event) => {
                info!(process = %event.process, nonce = event.nonce, amount = %event.amount, "chain event delivered to group");
            }
        }
    }
}
