use chainsync::{Block, ChainId, Event, EventParam, Transaction, TransactionStatus};

pub const TRANSFER_SIGNATURE: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Block with one transfer transaction emitting one decoded event.
pub fn block(chain_id: &ChainId, number: u64, hash: &str, parent_hash: &str) -> Block {
    let transaction_hash = format!("{hash}-tx");

    Block {
        chain_id: chain_id.clone(),
        number,
        hash: hash.to_string(),
        parent_hash: parent_hash.to_string(),
        timestamp: 1_700_000_000 + number as i64 * 12,
        gas_used: Some(21_000),
        gas_limit: Some(30_000_000),
        producer: Some("0x95222290dd7278aa3ddd389cc1e1d165cc4bafe5".to_string()),
        transactions: vec![Transaction {
            hash: transaction_hash.clone(),
            block_hash: Some(hash.to_string()),
            block_number: Some(number),
            index: 0,
            sender: Some("0x8a90cab2b38dba80c64b7734e58ee1db38b8992e".to_string()),
            receiver: Some("0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d".to_string()),
            value: "1000000000000000000".to_string(),
            fee: Some("21000000000000".to_string()),
            payload: "0x".to_string(),
            status: TransactionStatus::Confirmed,
            events: vec![Event {
                transaction_hash,
                block_number: number,
                log_index: 0,
                block_log_index: Some(0),
                contract_address: "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d".to_string(),
                signature: TRANSFER_SIGNATURE.to_string(),
                name: Some("Transfer".to_string()),
                params: vec![EventParam {
                    name: "value".to_string(),
                    value: serde_json::json!("1000000000000000000"),
                }],
                topics: vec![TRANSFER_SIGNATURE.to_string()],
                data: "0x".to_string(),
            }],
            balance_deltas: vec![],
        }],
    }
}

pub fn block_hash(number: u64, branch: &str) -> String {
    format!("0x{number:x}{branch}")
}
