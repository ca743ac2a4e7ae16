use ethers::types::{H160, H256};

pub fn h160_to_string(h160: &H160) -> String {
    format!("{h160:#x}")
}

pub fn h256_to_string(h256: &H256) -> String {
    format!("{h256:#x}")
}
