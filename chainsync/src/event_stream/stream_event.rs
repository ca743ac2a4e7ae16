use chrono::Utc;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blocks::{Block, Event, Transaction};
use crate::sync_states::SyncStatus;
use crate::ChainId;

use super::StreamError;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[display("blocks")]
    #[serde(rename = "blocks")]
    Blocks,
    #[display("transactions")]
    #[serde(rename = "transactions")]
    Transactions,
    #[display("events")]
    #[serde(rename = "events")]
    Events,
    #[display("sync-status")]
    #[serde(rename = "sync-status")]
    SyncStatus,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::Blocks,
        Topic::Transactions,
        Topic::Events,
        Topic::SyncStatus,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.to_string() == value)
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    /// Durably persisted.
    #[display("committed")]
    Committed,
    /// Rolled back by a chain reorg. Compensates an earlier `Committed`.
    #[display("retracted")]
    Retracted,
    #[display("updated")]
    Updated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stable across redeliveries, so consumers can drop duplicates.
    pub id: Uuid,
    pub topic: Topic,
    pub chain_id: ChainId,
    pub key: String,
    pub kind: StreamEventKind,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

#[derive(Serialize)]
struct BlockHeader<'a> {
    number: u64,
    hash: &'a str,
    parent_hash: &'a str,
    timestamp: i64,
    gas_used: Option<u64>,
    gas_limit: Option<u64>,
    producer: Option<&'a str>,
    transaction_hashes: Vec<&'a str>,
}

impl<'a> From<&'a Block> for BlockHeader<'a> {
    fn from(block: &'a Block) -> Self {
        Self {
            number: block.number,
            hash: &block.hash,
            parent_hash: &block.parent_hash,
            timestamp: block.timestamp,
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
            producer: block.producer.as_deref(),
            transaction_hashes: block.transactions.iter().map(|tx| tx.hash.as_str()).collect(),
        }
    }
}

#[derive(Serialize)]
struct SyncStatusReport<'a> {
    #[serde(flatten)]
    sync_status: &'a SyncStatus,
    lag: u64,
}

impl StreamEvent {
    pub fn new(
        topic: Topic,
        chain_id: &ChainId,
        key: &str,
        kind: StreamEventKind,
        payload: &impl Serialize,
    ) -> Result<Self, StreamError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| StreamError::Encoding(e.to_string()))?;

        Ok(Self {
            id: Uuid::new_v4(),
            topic,
            chain_id: chain_id.clone(),
            key: key.to_string(),
            kind,
            payload,
            created_at: Utc::now().timestamp(),
        })
    }

    /// Events for a freshly persisted block, in persist order:
    /// the block, then each transaction followed by its own events.
    pub fn for_committed_block(block: &Block) -> Result<Vec<Self>, StreamError> {
        Self::for_block(block, StreamEventKind::Committed)
    }

    /// Compensating events for rolled back blocks, undoing them in reverse persist order.
    pub fn for_retracted_blocks(blocks: &[Block]) -> Result<Vec<Self>, StreamError> {
        let mut retractions = vec![];

        let mut blocks: Vec<_> = blocks.iter().collect();
        blocks.sort_by_key(|b| b.number);

        for block in blocks.into_iter().rev() {
            let mut block_retractions = Self::for_block(block, StreamEventKind::Retracted)?;
            block_retractions.reverse();
            retractions.append(&mut block_retractions);
        }

        Ok(retractions)
    }

    pub fn for_sync_status(sync_status: &SyncStatus) -> Result<Self, StreamError> {
        Self::new(
            Topic::SyncStatus,
            &sync_status.chain_id,
            sync_status.chain_id.as_str(),
            StreamEventKind::Updated,
            &SyncStatusReport {
                sync_status,
                lag: sync_status.lag(),
            },
        )
    }

    fn for_block(block: &Block, kind: StreamEventKind) -> Result<Vec<Self>, StreamError> {
        let chain_id = &block.chain_id;
        let mut events = vec![Self::new(
            Topic::Blocks,
            chain_id,
            &block.hash,
            kind,
            &BlockHeader::from(block),
        )?];

        for transaction in block.transactions.iter() {
            events.push(Self::for_transaction(chain_id, transaction, kind)?);

            for event in transaction.events.iter() {
                events.push(Self::for_event(chain_id, event, kind)?);
            }
        }

        Ok(events)
    }

    fn for_transaction(
        chain_id: &ChainId,
        transaction: &Transaction,
        kind: StreamEventKind,
    ) -> Result<Self, StreamError> {
        Self::new(
            Topic::Transactions,
            chain_id,
            &transaction.hash,
            kind,
            transaction,
        )
    }

    fn for_event(
        chain_id: &ChainId,
        event: &Event,
        kind: StreamEventKind,
    ) -> Result<Self, StreamError> {
        Self::new(Topic::Events, chain_id, &event.key(), kind, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{EventParam, TransactionStatus};

    fn block(number: u64) -> Block {
        let hash = format!("0x{number:02x}");
        let tx_hash = format!("0xaa{number:02x}");

        Block {
            chain_id: ChainId::new("ethereum"),
            number,
            hash: hash.clone(),
            parent_hash: format!("0x{:02x}", number - 1),
            timestamp: 1_700_000_000,
            gas_used: Some(21_000),
            gas_limit: Some(30_000_000),
            producer: None,
            transactions: vec![Transaction {
                hash: tx_hash.clone(),
                block_hash: Some(hash),
                block_number: Some(number),
                index: 0,
                sender: Some("0x01".to_string()),
                receiver: Some("0x02".to_string()),
                value: "1".to_string(),
                fee: None,
                payload: "0x".to_string(),
                status: TransactionStatus::Confirmed,
                events: vec![Event {
                    transaction_hash: tx_hash,
                    block_number: number,
                    log_index: 0,
                    block_log_index: Some(0),
                    contract_address: "0x03".to_string(),
                    signature: "0xdd".to_string(),
                    name: Some("Transfer".to_string()),
                    params: vec![EventParam {
                        name: "value".to_string(),
                        value: serde_json::json!("0x01"),
                    }],
                    topics: vec!["0xdd".to_string()],
                    data: "0x".to_string(),
                }],
                balance_deltas: vec![],
            }],
        }
    }

    #[test]
    fn orders_committed_events_as_persisted() {
        let events = StreamEvent::for_committed_block(&block(5)).unwrap();
        let topics: Vec<_> = events.iter().map(|e| e.topic).collect();

        assert_eq!(topics, vec![Topic::Blocks, Topic::Transactions, Topic::Events]);
        assert!(events.iter().all(|e| e.kind == StreamEventKind::Committed));
    }

    #[test]
    fn retracts_highest_blocks_first() {
        let retractions = StreamEvent::for_retracted_blocks(&[block(5), block(6)]).unwrap();
        let keys: Vec<_> = retractions.iter().map(|e| e.key.as_str()).collect();

        assert_eq!(
            keys,
            vec!["0xaa06:0", "0xaa06", "0x06", "0xaa05:0", "0xaa05", "0x05"]
        );
        assert!(retractions.iter().all(|e| e.kind == StreamEventKind::Retracted));
    }

    #[test]
    fn identifies_every_event() {
        let events = StreamEvent::for_committed_block(&block(5)).unwrap();

        assert_ne!(events[0].id, events[1].id);
    }

    #[test]
    fn parses_topics_by_name() {
        assert_eq!(Topic::parse("sync-status"), Some(Topic::SyncStatus));
        assert_eq!(Topic::parse("blocks"), Some(Topic::Blocks));
        assert_eq!(Topic::parse("logs"), None);
    }
}
