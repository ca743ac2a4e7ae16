use diesel::prelude::*;

use crate::blocks::{Block, Event, EventParam, Transaction, TransactionStatus};
use crate::chain_reorg::UnsavedReorgedBlock;
use crate::diesels::schema::{
    chainsync_blocks, chainsync_events, chainsync_outbox, chainsync_reorged_blocks,
    chainsync_sync_statuses, chainsync_transactions,
};
use crate::event_stream::StreamEvent;
use crate::repos::RepoError;
use crate::sync_states::{SyncMode, SyncStatus};
use crate::ChainId;

#[derive(Insertable)]
#[diesel(table_name = chainsync_blocks)]
pub struct NewBlockRow<'a> {
    chain_id: &'a str,
    number: i64,
    hash: &'a str,
    parent_hash: &'a str,
    timestamp: i64,
    gas_used: Option<i64>,
    gas_limit: Option<i64>,
    producer: Option<&'a str>,
}

impl<'a> From<&'a Block> for NewBlockRow<'a> {
    fn from(block: &'a Block) -> Self {
        Self {
            chain_id: block.chain_id.as_str(),
            number: block.number as i64,
            hash: &block.hash,
            parent_hash: &block.parent_hash,
            timestamp: block.timestamp,
            gas_used: block.gas_used.map(|g| g as i64),
            gas_limit: block.gas_limit.map(|g| g as i64),
            producer: block.producer.as_deref(),
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chainsync_blocks)]
pub struct BlockRow {
    pub chain_id: String,
    pub number: i64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub gas_used: Option<i64>,
    pub gas_limit: Option<i64>,
    pub producer: Option<String>,
}

impl BlockRow {
    pub fn into_block(self, transactions: Vec<Transaction>) -> Block {
        Block {
            chain_id: ChainId::new(&self.chain_id),
            number: self.number as u64,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
            gas_used: self.gas_used.map(|g| g as u64),
            gas_limit: self.gas_limit.map(|g| g as u64),
            producer: self.producer,
            transactions,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = chainsync_transactions)]
pub struct NewTransactionRow<'a> {
    chain_id: &'a str,
    hash: &'a str,
    block_hash: Option<&'a str>,
    block_number: Option<i64>,
    transaction_index: i32,
    sender: Option<&'a str>,
    receiver: Option<&'a str>,
    value: &'a str,
    fee: Option<&'a str>,
    payload: &'a str,
    status: String,
    balance_deltas: serde_json::Value,
}

impl<'a> NewTransactionRow<'a> {
    pub fn new(chain_id: &'a ChainId, transaction: &'a Transaction) -> Result<Self, RepoError> {
        Ok(Self {
            chain_id: chain_id.as_str(),
            hash: &transaction.hash,
            block_hash: transaction.block_hash.as_deref(),
            block_number: transaction.block_number.map(|n| n as i64),
            transaction_index: transaction.index as i32,
            sender: transaction.sender.as_deref(),
            receiver: transaction.receiver.as_deref(),
            value: &transaction.value,
            fee: transaction.fee.as_deref(),
            payload: &transaction.payload,
            status: transaction.status.to_string(),
            balance_deltas: to_json(&transaction.balance_deltas)?,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chainsync_transactions)]
pub struct TransactionRow {
    pub hash: String,
    pub block_hash: Option<String>,
    pub block_number: Option<i64>,
    pub transaction_index: i32,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub value: String,
    pub fee: Option<String>,
    pub payload: String,
    pub status: String,
    pub balance_deltas: serde_json::Value,
}

impl TransactionRow {
    pub fn into_transaction(self, events: Vec<Event>) -> Result<Transaction, RepoError> {
        let status = TransactionStatus::parse(&self.status)
            .ok_or_else(|| RepoError::Unknown(format!("unknown transaction status {}", self.status)))?;

        Ok(Transaction {
            hash: self.hash,
            block_hash: self.block_hash,
            block_number: self.block_number.map(|n| n as u64),
            index: self.transaction_index as u32,
            sender: self.sender,
            receiver: self.receiver,
            value: self.value,
            fee: self.fee,
            payload: self.payload,
            status,
            events,
            balance_deltas: from_json(self.balance_deltas)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = chainsync_events)]
pub struct NewEventRow<'a> {
    chain_id: &'a str,
    transaction_hash: &'a str,
    block_number: i64,
    log_index: i32,
    block_log_index: Option<i32>,
    contract_address: &'a str,
    signature: &'a str,
    name: Option<&'a str>,
    params: serde_json::Value,
    topics: serde_json::Value,
    data: &'a str,
}

impl<'a> NewEventRow<'a> {
    pub fn new(chain_id: &'a ChainId, event: &'a Event) -> Result<Self, RepoError> {
        Ok(Self {
            chain_id: chain_id.as_str(),
            transaction_hash: &event.transaction_hash,
            block_number: event.block_number as i64,
            log_index: event.log_index as i32,
            block_log_index: event.block_log_index.map(|i| i as i32),
            contract_address: &event.contract_address,
            signature: &event.signature,
            name: event.name.as_deref(),
            params: to_json(&event.params)?,
            topics: to_json(&event.topics)?,
            data: &event.data,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chainsync_events)]
pub struct EventRow {
    pub transaction_hash: String,
    pub block_number: i64,
    pub log_index: i32,
    pub block_log_index: Option<i32>,
    pub contract_address: String,
    pub signature: String,
    pub name: Option<String>,
    pub params: serde_json::Value,
    pub topics: serde_json::Value,
    pub data: String,
}

impl TryFrom<EventRow> for Event {
    type Error = RepoError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let params: Vec<EventParam> = from_json(row.params)?;

        Ok(Event {
            transaction_hash: row.transaction_hash,
            block_number: row.block_number as u64,
            log_index: row.log_index as u32,
            block_log_index: row.block_log_index.map(|i| i as u32),
            contract_address: row.contract_address,
            signature: row.signature,
            name: row.name,
            params,
            topics: from_json(row.topics)?,
            data: row.data,
        })
    }
}

#[derive(Insertable, Queryable, Selectable, AsChangeset)]
#[diesel(table_name = chainsync_sync_statuses)]
#[diesel(treat_none_as_null = true)]
pub struct SyncStatusRow {
    pub chain_id: String,
    pub mode: String,
    pub degraded_from: Option<String>,
    pub start_block: i64,
    pub last_confirmed_block: Option<i64>,
    pub highest_known_block: i64,
    pub last_error: Option<String>,
    pub last_updated_at: i64,
}

impl From<&SyncStatus> for SyncStatusRow {
    fn from(sync_status: &SyncStatus) -> Self {
        Self {
            chain_id: sync_status.chain_id.to_string(),
            mode: sync_status.mode.to_string(),
            degraded_from: sync_status.degraded_from.map(|m| m.to_string()),
            start_block: sync_status.start_block as i64,
            last_confirmed_block: sync_status.last_confirmed_block.map(|n| n as i64),
            highest_known_block: sync_status.highest_known_block as i64,
            last_error: sync_status.last_error.clone(),
            last_updated_at: sync_status.last_updated_at,
        }
    }
}

impl TryFrom<SyncStatusRow> for SyncStatus {
    type Error = RepoError;

    fn try_from(row: SyncStatusRow) -> Result<Self, Self::Error> {
        let parse_mode = |mode: &str| {
            SyncMode::parse(mode)
                .ok_or_else(|| RepoError::Unknown(format!("unknown sync mode {mode}")))
        };

        Ok(SyncStatus {
            chain_id: ChainId::new(&row.chain_id),
            mode: parse_mode(&row.mode)?,
            degraded_from: row.degraded_from.as_deref().map(parse_mode).transpose()?,
            start_block: row.start_block as u64,
            last_confirmed_block: row.last_confirmed_block.map(|n| n as u64),
            highest_known_block: row.highest_known_block as u64,
            last_error: row.last_error,
            last_updated_at: row.last_updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = chainsync_outbox)]
pub struct NewOutboxRow<'a> {
    chain_id: &'a str,
    event: serde_json::Value,
}

impl<'a> NewOutboxRow<'a> {
    pub fn new(event: &'a StreamEvent) -> Result<Self, RepoError> {
        Ok(Self {
            chain_id: event.chain_id.as_str(),
            event: to_json(event)?,
        })
    }

    pub fn many(events: &'a [StreamEvent]) -> Result<Vec<Self>, RepoError> {
        events.iter().map(Self::new).collect()
    }
}

#[derive(Insertable)]
#[diesel(table_name = chainsync_reorged_blocks)]
pub struct NewReorgedBlockRow<'a> {
    chain_id: &'a str,
    fork_point: i64,
    depth: i64,
    inserted_at: i64,
}

impl<'a> NewReorgedBlockRow<'a> {
    pub fn new(reorged_block: &'a UnsavedReorgedBlock, inserted_at: i64) -> Self {
        Self {
            chain_id: reorged_block.chain_id.as_str(),
            fork_point: reorged_block.fork_point as i64,
            depth: reorged_block.depth() as i64,
            inserted_at,
        }
    }
}

pub fn to_json(value: &impl serde::Serialize) -> Result<serde_json::Value, RepoError> {
    serde_json::to_value(value).map_err(|e| RepoError::Unknown(e.to_string()))
}

pub fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, RepoError> {
    serde_json::from_value(value).map_err(|e| RepoError::Unknown(e.to_string()))
}
