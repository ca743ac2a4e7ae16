use chrono::Utc;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::ChainId;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[display("idle")]
    Idle,
    #[display("backfilling")]
    Backfilling,
    #[display("real_time")]
    RealTime,
    #[display("degraded")]
    Degraded,
}

impl SyncMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "backfilling" => Some(Self::Backfilling),
            "real_time" => Some(Self::RealTime),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Backfilling | Self::RealTime)
    }
}

/// Sync progress of one chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub chain_id: ChainId,
    pub mode: SyncMode,
    /// Mode to return to once a degraded chain recovers.
    pub degraded_from: Option<SyncMode>,
    pub start_block: u64,
    /// Absent until the first commit.
    pub last_confirmed_block: Option<u64>,
    pub highest_known_block: u64,
    pub last_error: Option<String>,
    /// Milliseconds since the unix epoch.
    pub last_updated_at: i64,
}

impl SyncStatus {
    pub fn new(chain_id: &ChainId, start_block: u64) -> Self {
        Self {
            chain_id: chain_id.clone(),
            mode: SyncMode::Idle,
            degraded_from: None,
            start_block,
            last_confirmed_block: None,
            highest_known_block: 0,
            last_error: None,
            last_updated_at: Utc::now().timestamp_millis(),
        }
    }

    /// Blocks known upstream that are not confirmed yet.
    pub fn lag(&self) -> u64 {
        match self.last_confirmed_block {
            Some(last_confirmed_block) => {
                self.highest_known_block.saturating_sub(last_confirmed_block)
            }
            None if self.highest_known_block >= self.start_block => {
                self.highest_known_block - self.start_block + 1
            }
            None => 0,
        }
    }

    /// Height to resume syncing from.
    pub fn next_block(&self) -> u64 {
        self.last_confirmed_block.map(|n| n + 1).unwrap_or(self.start_block)
    }

    pub fn is_caught_up(&self, latest_height: u64, safety_margin: u64) -> bool {
        self.next_block() > latest_height.saturating_sub(safety_margin)
    }

    pub fn is_degraded(&self) -> bool {
        self.mode == SyncMode::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_the_start_block_as_lag_until_first_commit() {
        let mut sync_status = SyncStatus::new(&ChainId::new("bitcoin"), 1_000);
        sync_status.highest_known_block = 1_050;

        assert_eq!(sync_status.lag(), 51);
        assert_eq!(sync_status.next_block(), 1_000);

        sync_status.last_confirmed_block = Some(1_050);

        assert_eq!(sync_status.lag(), 0);
        assert_eq!(sync_status.next_block(), 1_051);
    }

    #[test]
    fn is_caught_up_within_the_safety_margin() {
        let mut sync_status = SyncStatus::new(&ChainId::new("ethereum"), 1_000);

        assert!(!sync_status.is_caught_up(1_050, 2));

        sync_status.last_confirmed_block = Some(1_048);
        assert!(sync_status.is_caught_up(1_050, 2));

        sync_status.last_confirmed_block = Some(1_047);
        assert!(!sync_status.is_caught_up(1_050, 2));
    }

    #[test]
    fn start_blocks_ahead_of_the_tip_are_caught_up() {
        let sync_status = SyncStatus::new(&ChainId::new("polygon"), 2_000);

        assert!(sync_status.is_caught_up(1_050, 2));
        assert_eq!(sync_status.lag(), 0);
    }
}
