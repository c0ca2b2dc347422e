// 🧮 Balance Calculator
//
// Every figure is a replay of the owner's ledger entries for one year.
// Entries from other years never contribute (year-scoped window).
//
//   available = cap - paid - committed + allocated_in - allocated_out
//
// which, once the cap is taken through the as-of period, equals the plain
// signed sum of the year's entries.

use crate::entities::portfolio::get_portfolio;
use crate::entities::practice::{get_practice, practices_in_portfolio};
use crate::error::Result;
use crate::ledger::{entries_for, EntryId, LedgerEntry, OwnerRef, TransactionType};
use crate::money::round_cents;
use crate::periods::PeriodRef;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub practice_id: String,
    pub as_of: PeriodRef,
    pub stipend_cap: Decimal,
    pub stipend_paid: Decimal,
    pub stipend_committed: Decimal,
    pub allocated_in: Decimal,
    pub allocated_out: Decimal,
    pub available_balance: Decimal,
    pub remaining_periods: u32,
    pub available_per_pp: Decimal,
    pub utilization_percent: Decimal,
}

impl Balance {
    /// Replay `entries` as of `as_of`. Entries outside `as_of.year` are ignored.
    pub fn from_entries(
        practice_id: &str,
        entries: &[LedgerEntry],
        as_of: PeriodRef,
        periods_per_year: u32,
    ) -> Balance {
        let year_entries: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|e| e.period.year == as_of.year)
            .collect();

        let types: HashMap<EntryId, TransactionType> = year_entries
            .iter()
            .map(|e| (e.id, e.transaction_type))
            .collect();

        let mut cap = Decimal::ZERO;
        let mut paid = Decimal::ZERO;
        let mut committed = Decimal::ZERO;
        let mut allocated_in = Decimal::ZERO;
        let mut allocated_out = Decimal::ZERO;

        for entry in &year_entries {
            match entry.transaction_type {
                TransactionType::OpeningBalance if entry.amount.is_sign_negative() => {
                    // Historical consumption backfill counts as paid
                    paid -= entry.amount;
                }
                TransactionType::OpeningBalance
                | TransactionType::RemeasurementIncrease
                | TransactionType::RemeasurementDecrease => {
                    if entry.period.period <= as_of.period {
                        cap += entry.amount;
                    }
                }
                TransactionType::Committed => committed -= entry.amount,
                TransactionType::Paid => paid -= entry.amount,
                TransactionType::Cancelled => {
                    let reversed = entry
                        .reverses_entry_id
                        .and_then(|id| types.get(&id).copied());
                    match reversed {
                        Some(TransactionType::Paid) => paid -= entry.amount,
                        _ => committed -= entry.amount,
                    }
                }
                TransactionType::AllocationIn => allocated_in += entry.amount,
                TransactionType::AllocationOut => allocated_out -= entry.amount,
            }
        }

        let available = cap - paid - committed + allocated_in - allocated_out;
        let remaining = as_of.remaining_in_year(periods_per_year);
        let per_pp = round_cents(available / Decimal::from(remaining));
        let utilization = if cap.is_zero() {
            Decimal::ZERO
        } else {
            round_cents((paid + committed) / cap * Decimal::ONE_HUNDRED)
        };

        Balance {
            practice_id: practice_id.to_string(),
            as_of,
            stipend_cap: cap,
            stipend_paid: paid,
            stipend_committed: committed,
            allocated_in,
            allocated_out,
            available_balance: available,
            remaining_periods: remaining,
            available_per_pp: per_pp,
            utilization_percent: utilization,
        }
    }
}

/// Balance of a practice as of a period, replayed from the ledger
pub fn compute_balance(
    conn: &Connection,
    practice_id: &str,
    as_of: PeriodRef,
    periods_per_year: u32,
) -> Result<Balance> {
    get_practice(conn, practice_id)?;
    let owner = OwnerRef::Practice(practice_id.to_string());
    let entries = entries_for(conn, &owner, Some(as_of.year))?;
    Ok(Balance::from_entries(practice_id, &entries, as_of, periods_per_year))
}

/// Running cap (opening balance + remeasurement deltas) through `through`, same year
pub fn running_cap(entries: &[LedgerEntry], through: PeriodRef) -> Option<Decimal> {
    let mut seen = false;
    let mut cap = Decimal::ZERO;
    for entry in entries {
        if entry.period.year != through.year || entry.period.period > through.period {
            continue;
        }
        let is_cap_entry = match entry.transaction_type {
            TransactionType::OpeningBalance => entry.amount.is_sign_positive(),
            t => t.is_remeasurement(),
        };
        if is_cap_entry {
            seen = true;
            cap += entry.amount;
        }
    }
    seen.then_some(cap)
}

/// Unallocated suspense money held by a portfolio (all years)
pub fn suspense_balance(conn: &Connection, portfolio_id: &str) -> Result<Decimal> {
    get_portfolio(conn, portfolio_id)?;
    let owner = OwnerRef::Portfolio(portfolio_id.to_string());
    let entries = entries_for(conn, &owner, None)?;
    Ok(entries.iter().map(|e| e.amount).sum())
}

// ============================================================================
// PORTFOLIO ROLL-UP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub portfolio_id: String,
    pub as_of: PeriodRef,
    pub practices: Vec<Balance>,
    pub total_cap: Decimal,
    pub total_available: Decimal,
    pub suspense_balance: Decimal,
}

pub fn portfolio_summary(
    conn: &Connection,
    portfolio_id: &str,
    as_of: PeriodRef,
    periods_per_year: u32,
) -> Result<PortfolioSummary> {
    let suspense = suspense_balance(conn, portfolio_id)?;

    let mut practices = Vec::new();
    for practice in practices_in_portfolio(conn, portfolio_id)? {
        practices.push(compute_balance(conn, &practice.id, as_of, periods_per_year)?);
    }

    Ok(PortfolioSummary {
        portfolio_id: portfolio_id.to_string(),
        as_of,
        total_cap: practices.iter().map(|b| b.stipend_cap).sum(),
        total_available: practices.iter().map(|b| b.available_balance).sum(),
        practices,
        suspense_balance: suspense,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::dec;
    use chrono::Utc;

    struct Builder {
        entries: Vec<LedgerEntry>,
    }

    impl Builder {
        fn new() -> Self {
            Builder { entries: Vec::new() }
        }

        fn add(mut self, period: u32, t: TransactionType, amount: &str, reverses: Option<EntryId>) -> Self {
            let id = self.entries.len() as EntryId + 1;
            self.entries.push(LedgerEntry {
                id,
                owner: OwnerRef::Practice("P-1".to_string()),
                period: PeriodRef::new(period, 2025),
                transaction_type: t,
                amount: dec(amount),
                description: String::new(),
                request_id: None,
                allocation_id: None,
                reverses_entry_id: reverses,
                created_at: Utc::now(),
            });
            self
        }
    }

    #[test]
    fn test_opening_balance_only() {
        let b = Builder::new().add(1, TransactionType::OpeningBalance, "10000", None);
        let bal = Balance::from_entries("P-1", &b.entries, PeriodRef::new(1, 2025), 26);
        assert_eq!(bal.stipend_cap, dec("10000"));
        assert_eq!(bal.available_balance, dec("10000"));
        assert_eq!(bal.utilization_percent, Decimal::ZERO);
        assert_eq!(bal.remaining_periods, 26);
    }

    #[test]
    fn test_commitment_and_utilization() {
        let b = Builder::new()
            .add(1, TransactionType::OpeningBalance, "10000", None)
            .add(2, TransactionType::RemeasurementIncrease, "2500", None)
            .add(3, TransactionType::Committed, "-3000", None);
        let bal = Balance::from_entries("P-1", &b.entries, PeriodRef::new(2, 2025), 26);
        assert_eq!(bal.stipend_cap, dec("12500"));
        assert_eq!(bal.stipend_committed, dec("3000"));
        assert_eq!(bal.available_balance, dec("9500"));
        assert_eq!(bal.utilization_percent, dec("24"));
        assert_eq!(bal.remaining_periods, 25);
        assert_eq!(bal.available_per_pp, dec("380"));
    }

    #[test]
    fn test_paid_reclassification_keeps_available() {
        let committed_only = Builder::new()
            .add(1, TransactionType::OpeningBalance, "1000", None)
            .add(2, TransactionType::Committed, "-200", None);
        let before = Balance::from_entries("P-1", &committed_only.entries, PeriodRef::new(1, 2025), 26);

        let paid = committed_only
            .add(2, TransactionType::Paid, "-200", None)
            .add(2, TransactionType::Committed, "200", Some(2));
        let after = Balance::from_entries("P-1", &paid.entries, PeriodRef::new(1, 2025), 26);

        assert_eq!(before.available_balance, after.available_balance);
        assert_eq!(after.stipend_committed, Decimal::ZERO);
        assert_eq!(after.stipend_paid, dec("200"));
    }

    #[test]
    fn test_cancellation_of_paid_and_committed() {
        let b = Builder::new()
            .add(1, TransactionType::OpeningBalance, "1000", None)
            .add(2, TransactionType::Committed, "-100", None) // id 2
            .add(3, TransactionType::Committed, "-100", None) // id 3
            .add(3, TransactionType::Paid, "-100", None) // id 4
            .add(3, TransactionType::Committed, "100", Some(3)) // id 5
            .add(2, TransactionType::Cancelled, "100", Some(2))
            .add(3, TransactionType::Cancelled, "100", Some(4));
        let bal = Balance::from_entries("P-1", &b.entries, PeriodRef::new(1, 2025), 26);
        assert_eq!(bal.stipend_committed, Decimal::ZERO);
        assert_eq!(bal.stipend_paid, Decimal::ZERO);
        assert_eq!(bal.available_balance, dec("1000"));
    }

    #[test]
    fn test_negative_opening_balance_counts_as_paid() {
        let b = Builder::new()
            .add(1, TransactionType::OpeningBalance, "5000", None)
            .add(1, TransactionType::OpeningBalance, "-750", None);
        let bal = Balance::from_entries("P-1", &b.entries, PeriodRef::new(1, 2025), 26);
        assert_eq!(bal.stipend_cap, dec("5000"));
        assert_eq!(bal.stipend_paid, dec("750"));
        assert_eq!(bal.available_balance, dec("4250"));
        assert_eq!(bal.utilization_percent, dec("15"));
    }

    #[test]
    fn test_allocations_adjust_available() {
        let b = Builder::new()
            .add(1, TransactionType::OpeningBalance, "1000", None)
            .add(1, TransactionType::AllocationOut, "-300", None)
            .add(1, TransactionType::AllocationIn, "50", None);
        let bal = Balance::from_entries("P-1", &b.entries, PeriodRef::new(1, 2025), 26);
        assert_eq!(bal.allocated_out, dec("300"));
        assert_eq!(bal.allocated_in, dec("50"));
        assert_eq!(bal.available_balance, dec("750"));
    }

    #[test]
    fn test_zero_cap_utilization_is_zero() {
        let b = Builder::new().add(1, TransactionType::AllocationIn, "50", None);
        let bal = Balance::from_entries("P-1", &b.entries, PeriodRef::new(26, 2025), 26);
        assert_eq!(bal.utilization_percent, Decimal::ZERO);
        assert_eq!(bal.remaining_periods, 1);
        assert_eq!(bal.available_per_pp, dec("50"));
    }

    #[test]
    fn test_other_years_excluded() {
        let mut b = Builder::new().add(1, TransactionType::OpeningBalance, "1000", None);
        b.entries[0].period.year = 2024;
        let bal = Balance::from_entries("P-1", &b.entries, PeriodRef::new(1, 2025), 26);
        assert_eq!(bal.available_balance, Decimal::ZERO);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let b = Builder::new()
            .add(1, TransactionType::OpeningBalance, "1234.56", None)
            .add(4, TransactionType::Committed, "-33.33", None);
        let first = Balance::from_entries("P-1", &b.entries, PeriodRef::new(3, 2025), 26);
        let second = Balance::from_entries("P-1", &b.entries, PeriodRef::new(3, 2025), 26);
        assert_eq!(first, second);
    }

    #[test]
    fn test_running_cap() {
        let b = Builder::new()
            .add(1, TransactionType::OpeningBalance, "1000", None)
            .add(1, TransactionType::OpeningBalance, "-200", None)
            .add(3, TransactionType::RemeasurementDecrease, "-100", None);
        assert_eq!(running_cap(&b.entries, PeriodRef::new(2, 2025)), Some(dec("1000")));
        assert_eq!(running_cap(&b.entries, PeriodRef::new(3, 2025)), Some(dec("900")));
        assert_eq!(running_cap(&b.entries[1..2], PeriodRef::new(3, 2025)), None);
    }
}
