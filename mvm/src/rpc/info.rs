use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

use crate::machine::{ProcessPlatform, Store};

#[derive(Debug, Serialize)]
pub struct Info {
    pub version: &'static str,
    /// Group events waiting for a quorum of signatures.
    pub pending: u64,
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Serialize)]
pub struct ProcessInfo {
    pub id: Uuid,
    pub platform: ProcessPlatform,
    pub address: String,
    pub disabled: bool,
    /// Nonce of the next chain event to replay into the group.
    pub offset: u64,
}

pub fn get_info(store: &dyn Store) -> Result<Info> {
    let processes = store
        .list_processes()?
        .into_iter()
        .map(|process| {
            Ok(ProcessInfo {
                offset: store.read_offset(process.id)?,
                id: process.id,
                platform: process.platform,
                address: process.address,
                disabled: process.disabled,
            })
        })
        .collect::<Result<_>>()?;

    Ok(Info {
        version: env!("CARGO_PKG_VERSION"),
        pending: store.count_pending()?,
        processes,
    })
}
