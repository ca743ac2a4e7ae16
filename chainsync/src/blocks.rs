mod block;
mod event;
mod transaction;

pub use block::{Block, BlockRef};
pub use event::{Event, EventParam};
pub use transaction::{BalanceDelta, Transaction, TransactionStatus};
