//! Credit ledger: balance checks and atomic deduction

pub mod memory;
pub mod rpc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::CreditsConfig;
use crate::error::{AppError, Result};
use crate::job::model::ToolId;

pub use memory::InMemoryLedger;
pub use rpc::RpcCreditLedger;

/// Per-user counters for the current monthly window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub user_id: String,
    pub available: u32,
    pub used: u32,
    pub total: u32,
    pub reset_at: DateTime<Utc>,
}

impl CreditBalance {
    /// Fresh allowance starting now
    pub fn fresh(user_id: impl Into<String>, total: u32, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            available: total,
            used: 0,
            total,
            reset_at: next_month_start(now),
        }
    }
}

/// Result of a deduction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductOutcome {
    pub success: bool,
    pub remaining: u32,
}

/// Credits store. `deduct` must be atomic per user and must refuse, not
/// clamp, when the balance is short.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<CreditBalance>;

    async fn deduct(&self, user_id: &str, amount: u32) -> Result<DeductOutcome>;
}

/// First instant of the month after `now`, UTC
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Credit price of each tool
#[derive(Debug, Clone)]
pub struct CreditPricing {
    costs: HashMap<ToolId, u32>,
}

impl CreditPricing {
    pub fn from_config(config: &CreditsConfig) -> Result<Self> {
        let costs = config
            .costs
            .iter()
            .map(|(tool, cost)| Ok((tool.parse::<ToolId>()?, *cost)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { costs })
    }

    pub fn cost_for(&self, tool: ToolId) -> Result<u32> {
        self.costs
            .get(&tool)
            .copied()
            .ok_or_else(|| AppError::Internal(format!("No credit price configured for {}", tool)))
    }
}

impl Default for CreditPricing {
    fn default() -> Self {
        // The default table covers every tool
        Self::from_config(&CreditsConfig::default()).unwrap_or(Self {
            costs: HashMap::new(),
        })
    }
}
