//! In-process credit ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::credits::{next_month_start, CreditBalance, CreditLedger, DeductOutcome};
use crate::error::Result;

/// Ledger kept in a concurrent map. Each deduction runs under the user's
/// entry lock, so concurrent deductions serialise per user.
pub struct InMemoryLedger {
    accounts: DashMap<String, CreditBalance>,
    monthly_allowance: u32,
}

impl InMemoryLedger {
    pub fn new(monthly_allowance: u32) -> Self {
        Self {
            accounts: DashMap::new(),
            monthly_allowance,
        }
    }

    /// Set a user's allowance for the current window
    pub fn grant(&self, user_id: &str, total: u32) {
        self.accounts.insert(
            user_id.to_string(),
            CreditBalance::fresh(user_id, total, Utc::now()),
        );
    }

    fn roll_window(balance: &mut CreditBalance, now: DateTime<Utc>) {
        if now >= balance.reset_at {
            debug!(user_id = %balance.user_id, "Monthly credit window reset");
            balance.available = balance.total;
            balance.used = 0;
            balance.reset_at = next_month_start(now);
        }
    }

    fn with_account<T>(&self, user_id: &str, f: impl FnOnce(&mut CreditBalance) -> T) -> T {
        let now = Utc::now();
        let mut entry = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| CreditBalance::fresh(user_id, self.monthly_allowance, now));
        Self::roll_window(entry.value_mut(), now);
        f(entry.value_mut())
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    async fn balance(&self, user_id: &str) -> Result<CreditBalance> {
        Ok(self.with_account(user_id, |balance| balance.clone()))
    }

    async fn deduct(&self, user_id: &str, amount: u32) -> Result<DeductOutcome> {
        let outcome = self.with_account(user_id, |balance| {
            if balance.available < amount {
                return DeductOutcome {
                    success: false,
                    remaining: balance.available,
                };
            }
            balance.available -= amount;
            balance.used += amount;
            DeductOutcome {
                success: true,
                remaining: balance.available,
            }
        });

        if outcome.success {
            info!(user_id, amount, remaining = outcome.remaining, "Deducted credits");
        } else {
            debug!(user_id, amount, remaining = outcome.remaining, "Deduction refused");
        }
        Ok(outcome)
    }
}
