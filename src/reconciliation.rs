// ⚖️ Reconciliation Engine - Validate the ledger against its own invariants
//
// Two checks:
//   - allocation: every leg has its entry, and the entries net to zero
//   - owner:      replayed balance == plain signed sum of the owner's entries,
//                 and every reversal points at a live entry of the same owner
//
// Reconciliation only reads. A discrepancy is a report, never a repair.

use crate::allocation::{get_allocation, AllocationKind, AllocationStatus};
use crate::balance::{suspense_balance, Balance};
use crate::error::Result;
use crate::ledger::{entries_for, entries_for_allocation, EntryId, LedgerEntry, OwnerRef, TransactionType};
use crate::money::{within_tolerance, CENT};
use crate::periods::PeriodRef;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Expected and actual agree
    Balanced { expected: Decimal, actual: Decimal },

    /// Expected and actual differ, or structural problems were found
    Discrepancy {
        expected: Decimal,
        actual: Decimal,
        difference: Decimal,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn difference(&self) -> Decimal {
        match self {
            ReconciliationResult::Balanced { .. } => Decimal::ZERO,
            ReconciliationResult::Discrepancy { difference, .. } => *difference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscrepancyCategory {
    MissingEntry,
    UnexpectedEntry,
    AmountMismatch,
    NotConserved,
    IncompleteAllocation,
    BalanceMismatch,
    DanglingReversal,
    DoubleReversal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub description: String,
    pub amount: Decimal,
    pub category: DiscrepancyCategory,
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub subject: String,
    pub result: ReconciliationResult,
    pub entry_count: usize,
    pub total_credits: Decimal,
    pub total_debits: Decimal,
    pub discrepancies: Vec<Discrepancy>,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.result.is_balanced() && self.discrepancies.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation of {}: {} entries, credits ${:.2}, debits ${:.2}, difference ${:.2}, {} discrepancies",
            self.subject,
            self.entry_count,
            self.total_credits,
            self.total_debits,
            self.result.difference(),
            self.discrepancies.len()
        )
    }
}

fn totals(entries: &[&LedgerEntry]) -> (Decimal, Decimal) {
    let credits = entries
        .iter()
        .filter(|e| e.amount.is_sign_positive())
        .map(|e| e.amount)
        .sum();
    let debits = entries
        .iter()
        .filter(|e| e.amount.is_sign_negative())
        .map(|e| -e.amount)
        .sum();
    (credits, debits)
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Tolerance for leg amount comparisons (default: $0.01)
    pub tolerance: Decimal,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine { tolerance: CENT }
    }

    pub fn with_tolerance(tolerance: Decimal) -> Self {
        ReconciliationEngine { tolerance }
    }

    /// Exact comparison: sums of cents never drift
    fn result(&self, expected: Decimal, actual: Decimal) -> ReconciliationResult {
        if expected == actual {
            ReconciliationResult::Balanced { expected, actual }
        } else {
            ReconciliationResult::Discrepancy {
                expected,
                actual,
                difference: (expected - actual).abs(),
            }
        }
    }

    /// Conservation check for one allocation: entries match legs, net is exactly zero
    pub fn reconcile_allocation(&self, conn: &Connection, allocation_id: &str) -> Result<ReconciliationReport> {
        let allocation = get_allocation(conn, allocation_id)?;
        let entries = entries_for_allocation(conn, allocation_id)?;
        let mut discrepancies = Vec::new();

        if allocation.status != AllocationStatus::Completed {
            discrepancies.push(Discrepancy {
                description: format!("allocation {} is not completed", allocation.id),
                amount: allocation.total_amount,
                category: DiscrepancyCategory::IncompleteAllocation,
            });
        }

        // Every expected (owner, type, amount) must be matched by exactly one entry
        let mut expected: Vec<(OwnerRef, TransactionType, Decimal)> = Vec::new();
        for leg in &allocation.donors {
            expected.push((
                OwnerRef::Practice(leg.practice_id.clone()),
                TransactionType::AllocationOut,
                -leg.amount,
            ));
        }
        for leg in &allocation.recipients {
            expected.push((
                OwnerRef::Practice(leg.practice_id.clone()),
                TransactionType::AllocationIn,
                leg.amount,
            ));
        }
        if let Some(portfolio) = &allocation.recipient_portfolio_id {
            let owner = OwnerRef::Portfolio(portfolio.clone());
            match allocation.kind {
                AllocationKind::InterPortfolio => {
                    expected.push((owner, TransactionType::AllocationIn, allocation.total_amount))
                }
                AllocationKind::SuspenseDistribution => {
                    expected.push((owner, TransactionType::AllocationOut, -allocation.total_amount))
                }
                AllocationKind::PracticeToPractice => {}
            }
        }

        let mut unmatched: Vec<&LedgerEntry> = entries.iter().collect();
        for (owner, transaction_type, amount) in expected {
            let position = unmatched
                .iter()
                .position(|e| e.owner == owner && e.transaction_type == transaction_type);
            match position {
                Some(index) => {
                    let entry = unmatched.remove(index);
                    if !within_tolerance(entry.amount, amount, self.tolerance) {
                        discrepancies.push(Discrepancy {
                            description: format!(
                                "{} {} entry #{} is {}, leg says {}",
                                owner, transaction_type, entry.id, entry.amount, amount
                            ),
                            amount: entry.amount - amount,
                            category: DiscrepancyCategory::AmountMismatch,
                        });
                    }
                }
                None => discrepancies.push(Discrepancy {
                    description: format!("no {} entry for {}", transaction_type, owner),
                    amount,
                    category: DiscrepancyCategory::MissingEntry,
                }),
            }
        }
        for entry in unmatched {
            discrepancies.push(Discrepancy {
                description: format!("entry #{} ({}) has no matching leg", entry.id, entry.transaction_type),
                amount: entry.amount,
                category: DiscrepancyCategory::UnexpectedEntry,
            });
        }

        let all: Vec<&LedgerEntry> = entries.iter().collect();
        let (total_credits, total_debits) = totals(&all);
        let net = total_credits - total_debits;
        let result = self.result(Decimal::ZERO, net);
        if !result.is_balanced() {
            discrepancies.push(Discrepancy {
                description: format!("allocation entries net to {} instead of zero", net),
                amount: net,
                category: DiscrepancyCategory::NotConserved,
            });
        }

        Ok(ReconciliationReport {
            subject: format!("allocation {}", allocation.id),
            result,
            entry_count: entries.len(),
            total_credits,
            total_debits,
            discrepancies,
            reconciled_at: Utc::now(),
        })
    }

    /// Replay vs. plain sum for a practice (year of `as_of`) or a portfolio's suspense
    pub fn reconcile_owner(
        &self,
        conn: &Connection,
        owner: &OwnerRef,
        as_of: PeriodRef,
        periods_per_year: u32,
    ) -> Result<ReconciliationReport> {
        let (entries, replayed, window) = match owner {
            OwnerRef::Practice(id) => {
                let entries = entries_for(conn, owner, Some(as_of.year))?;
                let balance = Balance::from_entries(id, &entries, as_of, periods_per_year);
                (entries, balance.available_balance, format!("{} as of {}", owner, as_of))
            }
            OwnerRef::Portfolio(id) => {
                let entries = entries_for(conn, owner, None)?;
                (entries, suspense_balance(conn, id)?, owner.to_string())
            }
        };

        // Cap entries dated after `as_of` are not yet in effect
        let counted: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|e| {
                let is_cap = match e.transaction_type {
                    TransactionType::OpeningBalance => e.amount.is_sign_positive(),
                    t => t.is_remeasurement(),
                };
                !(matches!(owner, OwnerRef::Practice(_)) && is_cap && e.period > as_of)
            })
            .collect();

        let (total_credits, total_debits) = totals(&counted);
        let plain_sum = total_credits - total_debits;

        let mut discrepancies = Vec::new();
        let result = self.result(plain_sum, replayed);
        if !result.is_balanced() {
            discrepancies.push(Discrepancy {
                description: format!("replayed balance {} differs from entry sum {}", replayed, plain_sum),
                amount: replayed - plain_sum,
                category: DiscrepancyCategory::BalanceMismatch,
            });
        }
        discrepancies.extend(check_reversals(&entries));

        Ok(ReconciliationReport {
            subject: window,
            result,
            entry_count: counted.len(),
            total_credits,
            total_debits,
            discrepancies,
            reconciled_at: Utc::now(),
        })
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellations must target an entry of the same owner, and at most once
fn check_reversals(entries: &[LedgerEntry]) -> Vec<Discrepancy> {
    let by_id: HashMap<EntryId, &LedgerEntry> = entries.iter().map(|e| (e.id, e)).collect();
    let mut cancelled: HashSet<EntryId> = HashSet::new();
    let mut discrepancies = Vec::new();

    for entry in entries {
        let Some(target) = entry.reverses_entry_id else {
            continue;
        };
        if !by_id.contains_key(&target) {
            discrepancies.push(Discrepancy {
                description: format!("entry #{} reverses #{} which is not in this window", entry.id, target),
                amount: entry.amount,
                category: DiscrepancyCategory::DanglingReversal,
            });
            continue;
        }
        if entry.transaction_type == TransactionType::Cancelled && !cancelled.insert(target) {
            discrepancies.push(Discrepancy {
                description: format!("entry #{} cancels #{} a second time", entry.id, target),
                amount: entry.amount,
                category: DiscrepancyCategory::DoubleReversal,
            });
        }
    }
    discrepancies
}
