mod tables;

use std::{
    fs::{self, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use redb::{Database, backends::InMemoryBackend};
pub use tables::*;
use tracing::info;
use uuid::Uuid;

use crate::{
    encoding::Event,
    error::StoreError,
    machine::{AccountSnapshot, Process, Store},
};

/// Version string that is written to disk along with the persisted database. This should be bumped whenever we make a
/// backwards incompatible change to our database format.
const CURRENT_DB_VERSION: u8 = 1;

#[derive(Debug)]
pub struct Db {
    db: Arc<Database>,
}

impl Db {
    /// Opens the database in `data_dir`, or an in-memory database if no directory is given.
    pub fn new<P>(data_dir: Option<P>, cache_size: usize) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let db = match data_dir {
            Some(path) => {
                let path = path.as_ref();
                fs::create_dir_all(path).context(format!("Unable to create {path:?}"))?;

                let mut version_file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .read(true)
                    .write(true)
                    .open(path.join("version"))?;
                let mut version = String::new();
                version_file.read_to_string(&mut version)?;
                let version: u8 = if version.is_empty() {
                    CURRENT_DB_VERSION
                } else {
                    version.trim().parse()?
                };
                if version != CURRENT_DB_VERSION {
                    return Err(anyhow!(
                        "data is incompatible with this version ({version} != {CURRENT_DB_VERSION}) - please delete the data and re-sync"
                    ));
                }

                let db = Database::builder()
                    .set_cache_size(cache_size)
                    .set_repair_callback(|repair| {
                        info!(progress = repair.progress(), "repairing database");
                    })
                    .create(path.join("db.redb"))?;

                version_file.seek(SeekFrom::Start(0))?;
                version_file.write_all(CURRENT_DB_VERSION.to_string().as_bytes())?;

                Db { db: Arc::new(db) }
            }
            None => Db {
                db: Arc::new(Database::builder().create_with_backend(InMemoryBackend::new())?),
            },
        };

        // Ensure tables exist.
        let write = db.write()?;
        write.create_all()?;
        write.commit()?;

        Ok(db)
    }
}

impl Store for Db {
    fn event_seen(&self, id: &str) -> Result<bool> {
        self.read()?.pending_events()?.seen(id)
    }

    fn write_pending(&self, event: &Event, id: &str) -> Result<()> {
        let tx = self.write()?;
        {
            let mut pending = tx.pending_events()?;
            if pending.seen(id)? {
                return Err(StoreError::DuplicateEvent(id.to_owned()).into());
            }
            if pending.get(event.process, event.nonce)?.is_some()
                || tx.signed_events()?.contains(event.process, event.nonce)?
            {
                return Err(StoreError::NonceTaken {
                    process: event.process,
                    nonce: event.nonce,
                }
                .into());
            }
            pending.insert(event, id)?;
        }
        tx.commit()
    }

    fn list_pending(&self, limit: usize) -> Result<Vec<Event>> {
        self.read()?.pending_events()?.list(limit)
    }

    fn read_pending(&self, process: Uuid, nonce: u64) -> Result<Option<Event>> {
        self.read()?.pending_events()?.get(process, nonce)
    }

    fn count_pending(&self) -> Result<u64> {
        self.read()?.pending_events()?.count()
    }

    fn read_partial_signatures(&self, process: Uuid, nonce: u64) -> Result<Vec<Vec<u8>>> {
        self.read()?.partial_signatures()?.get(process, nonce)
    }

    fn write_partial_signatures(
        &self,
        process: Uuid,
        nonce: u64,
        partials: &[Vec<u8>],
    ) -> Result<()> {
        let tx = self.write()?;
        tx.partial_signatures()?.set(process, nonce, partials)?;
        tx.commit()
    }

    fn write_signed_and_expire_pending(&self, event: &Event) -> Result<()> {
        let not_pending = || StoreError::NotPending {
            process: event.process,
            nonce: event.nonce,
        };

        let tx = self.write()?;
        {
            let Some(pending) = tx.pending_events()?.remove(event.process, event.nonce)? else {
                return Err(not_pending().into());
            };
            if pending.id()? != event.id()? {
                return Err(not_pending().into());
            }
            tx.signed_events()?.insert(event)?;
            tx.partial_signatures()?.remove(event.process, event.nonce)?;
        }
        tx.commit()
    }

    fn read_signed(&self, process: Uuid, nonce: u64) -> Result<Option<Event>> {
        self.read()?.signed_events()?.get(process, nonce)
    }

    fn list_signed(&self, process: Uuid, limit: usize) -> Result<Vec<Event>> {
        self.read()?.signed_events()?.list(process, 0, limit)
    }

    fn list_signed_from(&self, process: Uuid, nonce: u64, limit: usize) -> Result<Vec<Event>> {
        self.read()?.signed_events()?.list(process, nonce, limit)
    }

    fn expire_signed_with_cost(&self, events: &[(Event, u128)], max_cost: u128) -> Result<usize> {
        let tx = self.write()?;
        let removed = {
            let mut signed = tx.signed_events()?;
            let mut retained = Vec::with_capacity(events.len());
            for (event, cost) in events {
                if signed.contains(event.process, event.nonce)? {
                    retained.push((event, *cost));
                }
            }
            retained.sort_by_key(|(event, _)| (event.nonce, event.process));

            let mut total = retained
                .iter()
                .fold(0u128, |total, (_, cost)| total.saturating_add(*cost));
            let mut removed = 0;
            for (event, cost) in retained {
                if total <= max_cost {
                    break;
                }
                signed.remove(event.process, event.nonce)?;
                total -= cost.min(total);
                removed += 1;
            }
            removed
        };
        tx.commit()?;
        Ok(removed)
    }

    fn read_offset(&self, process: Uuid) -> Result<u64> {
        Ok(self
            .read()?
            .group_event_offsets()?
            .get(process)?
            .unwrap_or_default())
    }

    fn write_offset(&self, process: Uuid, offset: u64) -> Result<bool> {
        let tx = self.write()?;
        let updated = tx.group_event_offsets()?.set(process, offset)?;
        tx.commit()?;
        Ok(updated)
    }

    fn check_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<bool> {
        self.read()?.account_snapshots()?.contains(snapshot.hash())
    }

    fn write_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<()> {
        let tx = self.write()?;
        tx.account_snapshots()?.insert(snapshot.hash())?;
        tx.commit()
    }

    fn list_processes(&self) -> Result<Vec<Process>> {
        self.read()?.processes()?.list()
    }

    fn read_process(&self, id: Uuid) -> Result<Option<Process>> {
        self.read()?.processes()?.get(id)
    }

    fn write_process(&self, process: &Process) -> Result<()> {
        let tx = self.write()?;
        tx.processes()?.insert(process)?;
        tx.commit()
    }
}
