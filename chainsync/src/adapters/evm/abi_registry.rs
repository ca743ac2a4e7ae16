use std::collections::HashMap;

use ethers::abi::{Event as AbiEvent, HumanReadableParser, RawLog, Token};
use ethers::types::{Bytes, H256, I256};
use ethers::utils::hex;

use crate::adapters::AdapterError;
use crate::blocks::EventParam;
use crate::hashes::h160_to_string;

/// Event ABIs keyed by their topic0, used to decode logs.
#[derive(Debug, Default)]
pub struct AbiRegistry {
    events: HashMap<H256, AbiEvent>,
}

impl AbiRegistry {
    /// Parses human readable event signatures,
    /// e.g. `event Transfer(address indexed from, address indexed to, uint256 value)`
    pub fn new(abis: &[String]) -> Result<Self, AdapterError> {
        let mut events = HashMap::new();

        for abi in abis {
            let event = HumanReadableParser::parse_event(abi)
                .map_err(|e| AdapterError::FatalConfig(format!("invalid event ABI `{abi}`: {e}")))?;

            events.insert(event.signature(), event);
        }

        Ok(Self { events })
    }

    /// Name and parameters of a log whose signature is registered.
    /// None when the signature is unknown or the log does not match its ABI.
    pub fn decode(&self, topics: &[H256], data: &Bytes) -> Option<(String, Vec<EventParam>)> {
        let event = self.events.get(topics.first()?)?;

        let log = event
            .parse_log(RawLog {
                topics: topics.to_vec(),
                data: data.to_vec(),
            })
            .ok()?;

        let params = log
            .params
            .into_iter()
            .map(|param| EventParam {
                name: param.name,
                value: token_to_json(param.value),
            })
            .collect();

        Some((event.name.clone(), params))
    }
}

/// Integers are rendered as decimal strings so 256-bit values survive JSON.
fn token_to_json(token: Token) -> serde_json::Value {
    match token {
        Token::Address(address) => h160_to_string(&address).into(),
        Token::FixedBytes(bytes) | Token::Bytes(bytes) => format!("0x{}", hex::encode(bytes)).into(),
        Token::Int(int) => I256::from_raw(int).to_string().into(),
        Token::Uint(uint) => uint.to_string().into(),
        Token::Bool(bool) => bool.into(),
        Token::String(string) => string.into(),
        Token::FixedArray(tokens) | Token::Array(tokens) | Token::Tuple(tokens) => {
            serde_json::Value::Array(tokens.into_iter().map(token_to_json).collect())
        }
    }
}
