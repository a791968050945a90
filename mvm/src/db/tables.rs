//! This module defines the tables in our database and provides the abstractions used to interact with them.
//!
//! Each logical table may be backed by one or more concrete tables, for additional indices.

#![allow(clippy::type_complexity)]

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use redb::{
    MultimapTable, MultimapTableDefinition, ReadOnlyMultimapTable, ReadOnlyTable, ReadTransaction,
    ReadableMultimapTable, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
    WriteTransaction,
};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use super::Db;
use crate::{
    crypto::Hash,
    encoding::Event,
    machine::Process,
    quorum::NotifierState,
};

// Each logical table consists of:
// 1. The `TableDefinition`s backing this table.
// 2. A table `struct` which contains the methods to access this table. The struct is generic, but in practice only
// takes two possible values - One returned by `TxRead` and one returned by `TxWrite`. The concrete table consists of
// of the opened `redb` tables.
// 3. An `impl` block which contains all the read-only methods for the table. The implementation is generic over the
// `ReadableTable` trait, which means the methods are callable on both `TxRead`s and `TxWrite`s.
// 4. An `impl` block which contains all the write-only methods for the table. The implementation uses the concrete
// mutable `Table` types and thus is only callable on a `TxWrite`.

type ProcessKey = &'static [u8; 16];
type AddressKey = &'static [u8; 20];

// pending_events: (process, nonce) -> event
// pending_nonce_index: nonce -> [process]
// event_ids: id -> ()
// Identifiers are never removed, so an event which has moved on to the signed table is still recognised.
const PENDING_EVENTS: TableDefinition<(&[u8; 16], u64), Vec<u8>> =
    TableDefinition::new("pending_events");
const PENDING_NONCE_INDEX: MultimapTableDefinition<u64, &[u8; 16]> =
    MultimapTableDefinition::new("pending_nonce_index");
const EVENT_IDS: TableDefinition<&str, ()> = TableDefinition::new("event_ids");

pub struct PendingEventsTable<T1, T2, T3> {
    events: T1,
    nonce_index: T2,
    ids: T3,
}

impl<T1, T2, T3> PendingEventsTable<T1, T2, T3>
where
    T1: ReadableTable<(ProcessKey, u64), Vec<u8>>,
    T2: ReadableMultimapTable<u64, ProcessKey>,
    T3: ReadableTable<&'static str, ()>,
{
    pub fn seen(&self, id: &str) -> Result<bool> {
        Ok(self.ids.get(id)?.is_some())
    }

    pub fn get(&self, process: Uuid, nonce: u64) -> Result<Option<Event>> {
        let Some(event) = self.events.get((process.as_bytes(), nonce))? else {
            return Ok(None);
        };
        Ok(Some(Event::decode(&event.value())?))
    }

    /// Returns up to `limit` pending events in ascending nonce order. Events of different processes which share a
    /// nonce are returned in an arbitrary order.
    pub fn list(&self, limit: usize) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        if limit == 0 {
            return Ok(events);
        }
        for entry in self.nonce_index.iter()? {
            let (nonce, processes) = entry?;
            let nonce = nonce.value();
            for process in processes {
                let process: [u8; 16] = *process?.value();
                let event = self
                    .events
                    .get((&process, nonce))?
                    .ok_or(anyhow!("missing pending event"))?;
                events.push(Event::decode(&event.value())?);
                if events.len() == limit {
                    return Ok(events);
                }
            }
        }
        Ok(events)
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.events.len()?)
    }
}

impl
    PendingEventsTable<
        Table<'_, (ProcessKey, u64), Vec<u8>>,
        MultimapTable<'_, u64, ProcessKey>,
        Table<'_, &'static str, ()>,
    >
{
    pub fn insert(&mut self, event: &Event, id: &str) -> Result<()> {
        let process = event.process.into_bytes();
        self.events
            .insert((&process, event.nonce), event.encode()?)?;
        self.nonce_index.insert(event.nonce, &process)?;
        self.ids.insert(id, ())?;
        Ok(())
    }

    pub fn remove(&mut self, process: Uuid, nonce: u64) -> Result<Option<Event>> {
        let process = process.into_bytes();
        let Some(event) = self.events.remove((&process, nonce))? else {
            return Ok(None);
        };
        let event = Event::decode(&event.value())?;
        self.nonce_index.remove(nonce, &process)?;
        Ok(Some(event))
    }
}

// partial_signatures: (process, nonce) -> [partial]
const PARTIAL_SIGNATURES: TableDefinition<(&[u8; 16], u64), Vec<u8>> =
    TableDefinition::new("partial_signatures");

pub struct PartialSignaturesTable<T>(T);

impl<T: ReadableTable<(ProcessKey, u64), Vec<u8>>> PartialSignaturesTable<T> {
    pub fn get(&self, process: Uuid, nonce: u64) -> Result<Vec<Vec<u8>>> {
        let Some(partials) = self.0.get((process.as_bytes(), nonce))? else {
            return Ok(Vec::new());
        };
        deserialize(&partials.value())
    }
}

impl PartialSignaturesTable<Table<'_, (ProcessKey, u64), Vec<u8>>> {
    pub fn set(&mut self, process: Uuid, nonce: u64, partials: &[Vec<u8>]) -> Result<()> {
        self.0
            .insert((process.as_bytes(), nonce), serialize(&partials)?)?;
        Ok(())
    }

    pub fn remove(&mut self, process: Uuid, nonce: u64) -> Result<()> {
        self.0.remove((process.as_bytes(), nonce))?;
        Ok(())
    }
}

// signed_events: (process, nonce) -> event
const SIGNED_EVENTS: TableDefinition<(&[u8; 16], u64), Vec<u8>> =
    TableDefinition::new("signed_events");

pub struct SignedEventsTable<T>(T);

impl<T: ReadableTable<(ProcessKey, u64), Vec<u8>>> SignedEventsTable<T> {
    pub fn get(&self, process: Uuid, nonce: u64) -> Result<Option<Event>> {
        let Some(event) = self.0.get((process.as_bytes(), nonce))? else {
            return Ok(None);
        };
        Ok(Some(Event::decode(&event.value())?))
    }

    pub fn contains(&self, process: Uuid, nonce: u64) -> Result<bool> {
        Ok(self.0.get((process.as_bytes(), nonce))?.is_some())
    }

    /// Returns up to `limit` signed events of `process` with a nonce of at least `from`, oldest nonce first.
    pub fn list(&self, process: Uuid, from: u64, limit: usize) -> Result<Vec<Event>> {
        let process = process.into_bytes();
        self.0
            .range((&process, from)..=(&process, u64::MAX))?
            .take(limit)
            .map(|kv| Ok(Event::decode(&kv?.1.value())?))
            .collect()
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.0.len()?)
    }
}

impl SignedEventsTable<Table<'_, (ProcessKey, u64), Vec<u8>>> {
    pub fn insert(&mut self, event: &Event) -> Result<()> {
        self.0
            .insert((event.process.as_bytes(), event.nonce), event.encode()?)?;
        Ok(())
    }

    /// Returns true if an event was removed.
    pub fn remove(&mut self, process: Uuid, nonce: u64) -> Result<bool> {
        Ok(self.0.remove((process.as_bytes(), nonce))?.is_some())
    }
}

// group_event_offsets: process -> next group event nonce to deliver
const GROUP_EVENT_OFFSETS: TableDefinition<&[u8; 16], u64> =
    TableDefinition::new("group_event_offsets");

pub struct GroupEventOffsetsTable<T>(T);

impl<T: ReadableTable<ProcessKey, u64>> GroupEventOffsetsTable<T> {
    pub fn get(&self, process: Uuid) -> Result<Option<u64>> {
        Ok(self.0.get(process.as_bytes())?.map(|v| v.value()))
    }
}

impl GroupEventOffsetsTable<Table<'_, ProcessKey, u64>> {
    /// Sets the provided offset if it is greater than the existing offset. Returns true if the value was updated.
    pub fn set(&mut self, process: Uuid, offset: u64) -> Result<bool> {
        let current = self.get(process)?;
        let update = current.map(|c| offset > c).unwrap_or(true);
        if update {
            self.0.insert(process.as_bytes(), offset)?;
        }
        Ok(update)
    }
}

// account_snapshots: snapshot hash -> ()
const ACCOUNT_SNAPSHOTS: TableDefinition<&[u8; 32], ()> =
    TableDefinition::new("account_snapshots");

pub struct AccountSnapshotsTable<T>(T);

impl<T: ReadableTable<&'static [u8; 32], ()>> AccountSnapshotsTable<T> {
    pub fn contains(&self, hash: Hash) -> Result<bool> {
        Ok(self.0.get(&hash.0)?.is_some())
    }
}

impl AccountSnapshotsTable<Table<'_, &'static [u8; 32], ()>> {
    pub fn insert(&mut self, hash: Hash) -> Result<()> {
        self.0.insert(&hash.0, ())?;
        Ok(())
    }
}

const PROCESSES: TableDefinition<&[u8; 16], Vec<u8>> = TableDefinition::new("processes");

pub struct ProcessesTable<T>(T);

impl<T: ReadableTable<ProcessKey, Vec<u8>>> ProcessesTable<T> {
    pub fn get(&self, id: Uuid) -> Result<Option<Process>> {
        let Some(process) = self.0.get(id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(deserialize(&process.value())?))
    }

    pub fn list(&self) -> Result<Vec<Process>> {
        self.0
            .iter()?
            .map(|kv| deserialize(&kv?.1.value()))
            .collect()
    }
}

impl ProcessesTable<Table<'_, ProcessKey, Vec<u8>>> {
    pub fn insert(&mut self, process: &Process) -> Result<()> {
        self.0.insert(process.id.as_bytes(), serialize(process)?)?;
        Ok(())
    }
}

// contract_logs_offset: contract -> next block height to scan
// Every contract which passed address verification has an entry.
const CONTRACT_LOGS_OFFSET: TableDefinition<&[u8; 20], u64> =
    TableDefinition::new("contract_logs_offset");

pub struct ContractLogsOffsetTable<T>(T);

impl<T: ReadableTable<AddressKey, u64>> ContractLogsOffsetTable<T> {
    pub fn get(&self, address: Address) -> Result<Option<u64>> {
        Ok(self
            .0
            .get(&<[u8; 20]>::from(address))?
            .map(|v| v.value()))
    }

    pub fn contracts(&self) -> Result<Vec<Address>> {
        self.0
            .iter()?
            .map(|kv| Ok(Address::from(*kv?.0.value())))
            .collect()
    }
}

impl ContractLogsOffsetTable<Table<'_, AddressKey, u64>> {
    /// Sets the provided offset if it is greater than the existing offset. Returns true if the value was updated.
    pub fn set(&mut self, address: Address, offset: u64) -> Result<bool> {
        let current = self.get(address)?;
        let update = current.map(|c| offset > c).unwrap_or(true);
        if update {
            self.0.insert(&<[u8; 20]>::from(address), offset)?;
        }
        Ok(update)
    }
}

// contract_events: (contract, nonce) -> event observed in the contract's logs
const CONTRACT_EVENTS: TableDefinition<(&[u8; 20], u64), Vec<u8>> =
    TableDefinition::new("contract_events");

pub struct ContractEventsTable<T>(T);

impl<T: ReadableTable<(AddressKey, u64), Vec<u8>>> ContractEventsTable<T> {
    pub fn last_nonce(&self, address: Address) -> Result<Option<u64>> {
        let address = <[u8; 20]>::from(address);
        let last = self
            .0
            .range((&address, 0)..=(&address, u64::MAX))?
            .next_back()
            .transpose()?;
        Ok(last.map(|(key, _)| key.value().1))
    }

    /// Returns up to `limit` events of `address` with a nonce of at least `offset`, in ascending nonce order.
    pub fn list(&self, address: Address, offset: u64, limit: usize) -> Result<Vec<Event>> {
        let address = <[u8; 20]>::from(address);
        self.0
            .range((&address, offset)..=(&address, u64::MAX))?
            .take(limit)
            .map(|kv| Ok(Event::decode(&kv?.1.value())?))
            .collect()
    }
}

impl ContractEventsTable<Table<'_, (AddressKey, u64), Vec<u8>>> {
    pub fn insert(&mut self, address: Address, event: &Event) -> Result<()> {
        self.0
            .insert((&<[u8; 20]>::from(address), event.nonce), event.encode()?)?;
        Ok(())
    }
}

const CONTRACT_NOTIFIERS: TableDefinition<&[u8; 20], Vec<u8>> =
    TableDefinition::new("contract_notifiers");

pub struct ContractNotifiersTable<T>(T);

impl<T: ReadableTable<AddressKey, Vec<u8>>> ContractNotifiersTable<T> {
    pub fn get(&self, address: Address) -> Result<Option<NotifierState>> {
        let Some(notifier) = self.0.get(&<[u8; 20]>::from(address))? else {
            return Ok(None);
        };
        Ok(Some(deserialize(&notifier.value())?))
    }
}

impl ContractNotifiersTable<Table<'_, AddressKey, Vec<u8>>> {
    pub fn insert(&mut self, address: Address, notifier: &NotifierState) -> Result<()> {
        self.0
            .insert(&<[u8; 20]>::from(address), serialize(notifier)?)?;
        Ok(())
    }
}

// outbound_events: (contract, nonce) -> signed group event awaiting submission
const OUTBOUND_EVENTS: TableDefinition<(&[u8; 20], u64), Vec<u8>> =
    TableDefinition::new("outbound_events");

pub struct OutboundEventsTable<T>(T);

impl<T: ReadableTable<(AddressKey, u64), Vec<u8>>> OutboundEventsTable<T> {
    pub fn get(&self, address: Address, nonce: u64) -> Result<Option<Event>> {
        let Some(event) = self.0.get((&<[u8; 20]>::from(address), nonce))? else {
            return Ok(None);
        };
        Ok(Some(Event::decode(&event.value())?))
    }

    /// Returns up to `limit` events for `address` with a nonce of at least `nonce`, in ascending nonce order.
    pub fn list(&self, address: Address, nonce: u64, limit: usize) -> Result<Vec<Event>> {
        let address = <[u8; 20]>::from(address);
        self.0
            .range((&address, nonce)..=(&address, u64::MAX))?
            .take(limit)
            .map(|kv| Ok(Event::decode(&kv?.1.value())?))
            .collect()
    }
}

impl OutboundEventsTable<Table<'_, (AddressKey, u64), Vec<u8>>> {
    pub fn insert(&mut self, address: Address, event: &Event) -> Result<()> {
        self.0
            .insert((&<[u8; 20]>::from(address), event.nonce), event.encode()?)?;
        Ok(())
    }
}

fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

impl Db {
    /// Begin a read transaction.
    ///
    /// Captures a snapshot of the database, so that only data committed before calling this method is visible in the
    /// transaction.
    ///
    /// Read transactions may exist concurrently with writes.
    pub fn read(&self) -> Result<TxRead> {
        Ok(TxRead(self.db.begin_read()?))
    }

    /// Begin a write transaction.
    ///
    /// Only a single write may be in progress at a time. If a write is in progress, this function will block until it
    /// completes.
    ///
    /// You must call `[TxWrite::commit]` to persist the writes performed in this transaction. After committing, all
    /// writes will be visible to future transactions. Dropping a `TxWrite` without committing discards its writes.
    pub fn write(&self) -> Result<TxWrite> {
        let mut tx = self.db.begin_write()?;
        tx.set_quick_repair(true);
        Ok(TxWrite(tx))
    }
}

pub struct TxRead(ReadTransaction);

impl TxRead {
    pub fn pending_events(
        &self,
    ) -> Result<
        PendingEventsTable<
            ReadOnlyTable<(ProcessKey, u64), Vec<u8>>,
            ReadOnlyMultimapTable<u64, ProcessKey>,
            ReadOnlyTable<&'static str, ()>,
        >,
    > {
        Ok(PendingEventsTable {
            events: self.0.open_table(PENDING_EVENTS)?,
            nonce_index: self.0.open_multimap_table(PENDING_NONCE_INDEX)?,
            ids: self.0.open_table(EVENT_IDS)?,
        })
    }
    pub fn partial_signatures(
        &self,
    ) -> Result<PartialSignaturesTable<ReadOnlyTable<(ProcessKey, u64), Vec<u8>>>> {
        Ok(PartialSignaturesTable(self.0.open_table(PARTIAL_SIGNATURES)?))
    }
    pub fn signed_events(
        &self,
    ) -> Result<SignedEventsTable<ReadOnlyTable<(ProcessKey, u64), Vec<u8>>>> {
        Ok(SignedEventsTable(self.0.open_table(SIGNED_EVENTS)?))
    }
    pub fn group_event_offsets(
        &self,
    ) -> Result<GroupEventOffsetsTable<ReadOnlyTable<ProcessKey, u64>>> {
        Ok(GroupEventOffsetsTable(self.0.open_table(GROUP_EVENT_OFFSETS)?))
    }
    pub fn account_snapshots(
        &self,
    ) -> Result<AccountSnapshotsTable<ReadOnlyTable<&'static [u8; 32], ()>>> {
        Ok(AccountSnapshotsTable(self.0.open_table(ACCOUNT_SNAPSHOTS)?))
    }
    pub fn processes(&self) -> Result<ProcessesTable<ReadOnlyTable<ProcessKey, Vec<u8>>>> {
        Ok(ProcessesTable(self.0.open_table(PROCESSES)?))
    }
    pub fn contract_logs_offset(
        &self,
    ) -> Result<ContractLogsOffsetTable<ReadOnlyTable<AddressKey, u64>>> {
        Ok(ContractLogsOffsetTable(
            self.0.open_table(CONTRACT_LOGS_OFFSET)?,
        ))
    }
    pub fn contract_events(
        &self,
    ) -> Result<ContractEventsTable<ReadOnlyTable<(AddressKey, u64), Vec<u8>>>> {
        Ok(ContractEventsTable(self.0.open_table(CONTRACT_EVENTS)?))
    }
    pub fn contract_notifiers(
        &self,
    ) -> Result<ContractNotifiersTable<ReadOnlyTable<AddressKey, Vec<u8>>>> {
        Ok(ContractNotifiersTable(self.0.open_table(CONTRACT_NOTIFIERS)?))
    }
    pub fn outbound_events(
        &self,
    ) -> Result<OutboundEventsTable<ReadOnlyTable<(AddressKey, u64), Vec<u8>>>> {
        Ok(OutboundEventsTable(self.0.open_table(OUTBOUND_EVENTS)?))
    }
}

pub struct TxWrite(WriteTransaction);

impl TxWrite {
    pub fn commit(self) -> Result<()> {
        self.0.commit()?;
        Ok(())
    }

    pub fn pending_events(
        &self,
    ) -> Result<
        PendingEventsTable<
            Table<(ProcessKey, u64), Vec<u8>>,
            MultimapTable<u64, ProcessKey>,
            Table<&'static str, ()>,
        >,
    > {
        Ok(PendingEventsTable {
            events: self.0.open_table(PENDING_EVENTS)?,
            nonce_index: self.0.open_multimap_table(PENDING_NONCE_INDEX)?,
            ids: self.0.open_table(EVENT_IDS)?,
        })
    }
    pub fn partial_signatures(
        &self,
    ) -> Result<PartialSignaturesTable<Table<(ProcessKey, u64), Vec<u8>>>> {
        Ok(PartialSignaturesTable(self.0.open_table(PARTIAL_SIGNATURES)?))
    }
    pub fn signed_events(&self) -> Result<SignedEventsTable<Table<(ProcessKey, u64), Vec<u8>>>> {
        Ok(SignedEventsTable(self.0.open_table(SIGNED_EVENTS)?))
    }
    pub fn group_event_offsets(&self) -> Result<GroupEventOffsetsTable<Table<ProcessKey, u64>>> {
        Ok(GroupEventOffsetsTable(self.0.open_table(GROUP_EVENT_OFFSETS)?))
    }
    pub fn account_snapshots(
        &self,
    ) -> Result<AccountSnapshotsTable<Table<&'static [u8; 32], ()>>> {
        Ok(AccountSnapshotsTable(self.0.open_table(ACCOUNT_SNAPSHOTS)?))
    }
    pub fn processes(&self) -> Result<ProcessesTable<Table<ProcessKey, Vec<u8>>>> {
        Ok(ProcessesTable(self.0.open_table(PROCESSES)?))
    }
    pub fn contract_logs_offset(
        &self,
    ) -> Result<ContractLogsOffsetTable<Table<AddressKey, u64>>> {
        Ok(ContractLogsOffsetTable(
            self.0.open_table(CONTRACT_LOGS_OFFSET)?,
        ))
    }
    pub fn contract_events(
        &self,
    ) -> Result<ContractEventsTable<Table<(AddressKey, u64), Vec<u8>>>> {
        Ok(ContractEventsTable(self.0.open_table(CONTRACT_EVENTS)?))
    }
    pub fn contract_notifiers(
        &self,
    ) -> Result<ContractNotifiersTable<Table<AddressKey, Vec<u8>>>> {
        Ok(ContractNotifiersTable(self.0.open_table(CONTRACT_NOTIFIERS)?))
    }
    pub fn outbound_events(
        &self,
    ) -> Result<OutboundEventsTable<Table<(AddressKey, u64), Vec<u8>>>> {
        Ok(OutboundEventsTable(self.0.open_table(OUTBOUND_EVENTS)?))
    }

    /// Ensure all tables are created.
    pub fn create_all(&self) -> Result<()> {
        self.pending_events()?;
        self.partial_signatures()?;
        self.signed_events()?;
        self.group_event_offsets()?;
        self.account_snapshots()?;
        self.processes()?;
        self.contract_logs_offset()?;
        self.contract_events()?;
        self.contract_notifiers()?;
        self.outbound_events()?;
        Ok(())
    }
}
