//! Per-requester quota bookkeeping.
//!
//! [`QuotaLedger::reserve`] is an atomic check-and-decrement that hands out a
//! [`QuotaHold`]. The hold is consumed either by [`QuotaHold::commit`] (the
//! unit was spent) or by [`QuotaLedger::refund`] (the job never ran), so a
//! unit can never be refunded twice. Persisting balances is left to the
//! caller via [`QuotaLedger::snapshot`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Subscription plan of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Basic,
    Pro,
    Yearly,
}

impl PlanTier {
    /// Units granted when an account joins or upgrades to this plan.
    pub fn allowance(self) -> u32 {
        match self {
            PlanTier::Free => 5,
            PlanTier::Basic => 30,
            PlanTier::Pro => 100,
            PlanTier::Yearly => 999_999,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    pub id: String,
    pub plan: PlanTier,
    pub remaining: u32,
}

impl QuotaAccount {
    pub fn new(id: impl Into<String>, plan: PlanTier) -> Self {
        Self {
            id: id.into(),
            plan,
            remaining: plan.allowance(),
        }
    }
}

/// Units taken out of an account, pending commit or refund.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a quota hold must be committed or refunded"]
pub struct QuotaHold {
    account: String,
    units: u32,
}

impl QuotaHold {
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn units(&self) -> u32 {
        self.units
    }

    /// Makes the charge final and returns the number of units spent.
    pub fn commit(self) -> u32 {
        tracing::debug!(account = %self.account, units = self.units, "quota charge committed");
        self.units
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reservation {
    Granted(QuotaHold),
    Denied { remaining: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("unknown quota account: {0}")]
    UnknownAccount(String),

    #[error("refund of {units} units would overflow account {account}")]
    Overflow { account: String, units: u32 },
}

impl QuotaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuotaError::UnknownAccount(_) => ErrorKind::QuotaDenied,
            QuotaError::Overflow { .. } => ErrorKind::Validation,
        }
    }
}

/// Shared account balances. Safe to use from concurrent sessions.
#[derive(Debug, Default)]
pub struct QuotaLedger {
    accounts: Mutex<HashMap<String, QuotaAccount>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = QuotaAccount>) -> Self {
        let ledger = Self::new();
        {
            let mut map = ledger.lock();
            for account in accounts {
                map.insert(account.id.clone(), account);
            }
        }
        ledger
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QuotaAccount>> {
        // No method panics while holding the lock, so the data is intact.
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces an account, returning the previous one.
    pub fn open(&self, account: QuotaAccount) -> Option<QuotaAccount> {
        tracing::info!(account = %account.id, plan = ?account.plan, remaining = account.remaining, "quota account opened");
        self.lock().insert(account.id.clone(), account)
    }

    /// Moves an account to `plan` and resets its balance to the plan allowance.
    pub fn upgrade(&self, account: &str, plan: PlanTier) -> Result<QuotaAccount, QuotaError> {
        let mut map = self.lock();
        let entry = map
            .get_mut(account)
            .ok_or_else(|| QuotaError::UnknownAccount(account.to_string()))?;
        entry.plan = plan;
        entry.remaining = plan.allowance();
        tracing::info!(account, plan = ?plan, remaining = entry.remaining, "quota account upgraded");
        Ok(entry.clone())
    }

    pub fn balance(&self, account: &str) -> Result<u32, QuotaError> {
        self.lock()
            .get(account)
            .map(|a| a.remaining)
            .ok_or_else(|| QuotaError::UnknownAccount(account.to_string()))
    }

    /// Takes `count` units if at least that many remain; otherwise leaves the
    /// balance untouched and reports what is left.
    pub fn reserve(&self, account: &str, count: u32) -> Result<Reservation, QuotaError> {
        let mut map = self.lock();
        let entry = map
            .get_mut(account)
            .ok_or_else(|| QuotaError::UnknownAccount(account.to_string()))?;

        if entry.remaining < count {
            tracing::debug!(account, remaining = entry.remaining, count, "quota reservation denied");
            return Ok(Reservation::Denied {
                remaining: entry.remaining,
            });
        }

        entry.remaining -= count;
        tracing::debug!(account, remaining = entry.remaining, count, "quota reserved");
        Ok(Reservation::Granted(QuotaHold {
            account: account.to_string(),
            units: count,
        }))
    }

    /// Returns the units of an unspent hold. Yields the new balance.
    pub fn refund(&self, hold: QuotaHold) -> Result<u32, QuotaError> {
        let mut map = self.lock();
        let entry = map
            .get_mut(&hold.account)
            .ok_or_else(|| QuotaError::UnknownAccount(hold.account.clone()))?;
        entry.remaining =
            entry
                .remaining
                .checked_add(hold.units)
                .ok_or_else(|| QuotaError::Overflow {
                    account: hold.account.clone(),
                    units: hold.units,
                })?;
        tracing::info!(account = %hold.account, units = hold.units, remaining = entry.remaining, "quota refunded");
        Ok(entry.remaining)
    }

    /// All accounts, sorted by id, for an external store to persist.
    pub fn snapshot(&self) -> Vec<QuotaAccount> {
        let mut accounts: Vec<_> = self.lock().values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }
}
