// 🔀 Allocation Engine
//
// Three ways to move available balance, all dated to the current pay period:
//   - practice → practice         (N donors, M recipients, sums must match)
//   - practice → portfolio suspense (inter-portfolio transfer)
//   - portfolio suspense → practices (distribution, may be partial)
//
// The allocation row, its legs, its ledger entries and the final `completed`
// status are written in the caller's transaction: never half applied.

use crate::balance::{compute_balance, suspense_balance};
use crate::config::EngineConfig;
use crate::db::{insert_event, parse_timestamp, Event};
use crate::entities::portfolio::get_portfolio;
use crate::entities::practice::{get_practice, Practice};
use crate::error::{LedgerError, Result};
use crate::ledger::{append, NewEntry, OwnerRef, TransactionType};
use crate::money::{from_db, is_whole_cents, to_db};
use crate::periods::{current_period, PeriodRef};
use crate::workflow::{Actor, Role};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::info;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    PracticeToPractice,
    InterPortfolio,
    SuspenseDistribution,
}

impl AllocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationKind::PracticeToPractice => "practice_to_practice",
            AllocationKind::InterPortfolio => "inter_portfolio",
            AllocationKind::SuspenseDistribution => "suspense_distribution",
        }
    }
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "practice_to_practice" => Ok(AllocationKind::PracticeToPractice),
            "inter_portfolio" => Ok(AllocationKind::InterPortfolio),
            "suspense_distribution" => Ok(AllocationKind::SuspenseDistribution),
            other => Err(LedgerError::validation(format!("unknown allocation kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Pending,
    Completed,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Pending => "pending",
            AllocationStatus::Completed => "completed",
        }
    }
}

/// One (practice, amount) pair on either side of an allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationLeg {
    pub practice_id: String,
    pub amount: Decimal,
}

impl AllocationLeg {
    pub fn new(practice_id: &str, amount: Decimal) -> Self {
        AllocationLeg {
            practice_id: practice_id.to_string(),
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub kind: AllocationKind,
    pub donor_user_id: String,
    pub source_portfolio_id: Option<String>,
    pub recipient_portfolio_id: Option<String>,
    pub total_amount: Decimal,
    pub status: AllocationStatus,
    pub notes: Option<String>,
    pub donors: Vec<AllocationLeg>,
    pub recipients: Vec<AllocationLeg>,
    pub period: PeriodRef,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeTransfer {
    pub donors: Vec<AllocationLeg>,
    pub recipients: Vec<AllocationLeg>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioTransfer {
    pub donors: Vec<AllocationLeg>,
    pub recipient_portfolio_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspenseDistribution {
    pub portfolio_id: String,
    pub recipients: Vec<AllocationLeg>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ============================================================================
// VALIDATION HELPERS
// ============================================================================

fn sum(legs: &[AllocationLeg]) -> Decimal {
    legs.iter().map(|l| l.amount).sum()
}

fn require_positive(legs: &[AllocationLeg], side: &str) -> Result<()> {
    if legs.is_empty() {
        return Err(LedgerError::validation(format!("at least one {} is required", side)));
    }
    for leg in legs {
        if leg.amount <= Decimal::ZERO {
            return Err(LedgerError::validation(format!(
                "{} amount for {} must be greater than zero",
                side, leg.practice_id
            )));
        }
        if !is_whole_cents(leg.amount) {
            return Err(LedgerError::validation(format!(
                "{} amount {} for {} has fractions of a cent",
                side, leg.amount, leg.practice_id
            )));
        }
    }
    Ok(())
}

/// Recipients must exist and be active
fn active_recipient(conn: &Connection, practice_id: &str) -> Result<Practice> {
    let practice = get_practice(conn, practice_id)?;
    if !practice.active {
        return Err(LedgerError::validation(format!(
            "recipient practice {} is inactive",
            practice.id
        )));
    }
    Ok(practice)
}

fn require_distinct(legs: &[AllocationLeg], side: &str) -> Result<()> {
    let mut seen = BTreeSet::new();
    for leg in legs {
        if !seen.insert(leg.practice_id.as_str()) {
            return Err(LedgerError::validation(format!(
                "practice {} appears twice as a {}",
                leg.practice_id, side
            )));
        }
    }
    Ok(())
}

/// Each donor must cover its amount from its live available balance.
/// Donors are checked in practice-id order.
fn check_donor_balances(
    conn: &Connection,
    config: &EngineConfig,
    donors: &[AllocationLeg],
    as_of: PeriodRef,
) -> Result<()> {
    let mut ordered: Vec<&AllocationLeg> = donors.iter().collect();
    ordered.sort_by(|a, b| a.practice_id.cmp(&b.practice_id));

    for leg in ordered {
        let balance = compute_balance(conn, &leg.practice_id, as_of, config.periods_per_year)?;
        if leg.amount > balance.available_balance {
            return Err(LedgerError::InsufficientBalance {
                owner: leg.practice_id.clone(),
                available: balance.available_balance,
                requested: leg.amount,
            });
        }
    }
    Ok(())
}

fn validate_donors(
    conn: &Connection,
    config: &EngineConfig,
    donors: &[AllocationLeg],
    as_of: PeriodRef,
) -> Result<()> {
    require_positive(donors, "donor")?;
    require_distinct(donors, "donor")?;
    check_donor_balances(conn, config, donors, as_of)
}

// ============================================================================
// OPERATIONS
// ============================================================================

pub fn allocate_practice_to_practice(
    conn: &Connection,
    config: &EngineConfig,
    actor: &Actor,
    transfer: &PracticeTransfer,
) -> Result<Allocation> {
    actor.require(
        &[Role::Psm, Role::LeadPsm, Role::Admin],
        "allocate between practices",
    )?;
    let current = current_period(conn)?.period_ref();

    validate_donors(conn, config, &transfer.donors, current)?;
    require_positive(&transfer.recipients, "recipient")?;
    require_distinct(&transfer.recipients, "recipient")?;

    let given = sum(&transfer.donors);
    let received = sum(&transfer.recipients);
    if given != received {
        return Err(LedgerError::validation(format!(
            "donor total {} does not match recipient total {}",
            given, received
        )));
    }

    let donors: BTreeSet<&str> = transfer.donors.iter().map(|l| l.practice_id.as_str()).collect();
    if let Some(both) = transfer
        .recipients
        .iter()
        .find(|l| donors.contains(l.practice_id.as_str()))
    {
        return Err(LedgerError::validation(format!(
            "practice {} cannot be both donor and recipient",
            both.practice_id
        )));
    }
    for leg in &transfer.recipients {
        active_recipient(conn, &leg.practice_id)?;
    }

    let mut allocation = new_allocation(
        AllocationKind::PracticeToPractice,
        actor,
        current,
        given,
        transfer.notes.clone(),
    );
    allocation.donors = transfer.donors.clone();
    allocation.recipients = transfer.recipients.clone();

    write_allocation(conn, actor, &mut allocation, |conn, id| {
        write_donor_entries(conn, id, current, &transfer.donors)?;
        for leg in &transfer.recipients {
            append(
                conn,
                &NewEntry::new(
                    OwnerRef::Practice(leg.practice_id.clone()),
                    current,
                    TransactionType::AllocationIn,
                    leg.amount,
                    format!("Allocation {} in", id),
                )
                .for_allocation(id),
            )?;
        }
        Ok(())
    })?;
    Ok(allocation)
}

/// Donor practices → recipient portfolio's suspense balance
pub fn allocate_inter_portfolio(
    conn: &Connection,
    config: &EngineConfig,
    actor: &Actor,
    transfer: &PortfolioTransfer,
) -> Result<Allocation> {
    actor.require(&[Role::LeadPsm, Role::Admin], "allocate across portfolios")?;
    let current = current_period(conn)?.period_ref();
    let recipient = get_portfolio(conn, &transfer.recipient_portfolio_id)?;
    if !recipient.active {
        return Err(LedgerError::validation(format!(
            "recipient portfolio {} is inactive",
            recipient.id
        )));
    }
    validate_donors(conn, config, &transfer.donors, current)?;

    let mut source_portfolios = BTreeSet::new();
    for leg in &transfer.donors {
        let practice = get_practice(conn, &leg.practice_id)?;
        if practice.portfolio_id == recipient.id {
            return Err(LedgerError::validation(format!(
                "donor practice {} already belongs to portfolio {}",
                practice.id, recipient.id
            )));
        }
        source_portfolios.insert(practice.portfolio_id);
    }

    let total = sum(&transfer.donors);
    let mut allocation = new_allocation(
        AllocationKind::InterPortfolio,
        actor,
        current,
        total,
        transfer.notes.clone(),
    );
    allocation.donors = transfer.donors.clone();
    allocation.recipient_portfolio_id = Some(recipient.id.clone());
    if source_portfolios.len() == 1 {
        allocation.source_portfolio_id = source_portfolios.into_iter().next();
    }

    write_allocation(conn, actor, &mut allocation, |conn, id| {
        write_donor_entries(conn, id, current, &transfer.donors)?;
        append(
            conn,
            &NewEntry::new(
                OwnerRef::Portfolio(recipient.id.clone()),
                current,
                TransactionType::AllocationIn,
                total,
                format!("Allocation {} into suspense", id),
            )
            .for_allocation(id),
        )?;
        Ok(())
    })?;
    Ok(allocation)
}

/// Portfolio suspense → practices of that portfolio. Partial distribution is fine.
pub fn distribute_suspense(
    conn: &Connection,
    actor: &Actor,
    distribution: &SuspenseDistribution,
) -> Result<Allocation> {
    let portfolio = get_portfolio(conn, &distribution.portfolio_id)?;
    let is_portfolio_lead =
        actor.role == Role::LeadPsm && actor.portfolio_id.as_deref() == Some(portfolio.id.as_str());
    if !is_portfolio_lead && actor.role != Role::Admin {
        return Err(LedgerError::PermissionDenied {
            role: actor.role.to_string(),
            action: format!("distribute suspense of portfolio {}", portfolio.id),
        });
    }
    let current = current_period(conn)?.period_ref();

    require_positive(&distribution.recipients, "recipient")?;
    require_distinct(&distribution.recipients, "recipient")?;
    for leg in &distribution.recipients {
        let practice = active_recipient(conn, &leg.practice_id)?;
        if practice.portfolio_id != portfolio.id {
            return Err(LedgerError::validation(format!(
                "practice {} is not in portfolio {}",
                practice.id, portfolio.id
            )));
        }
    }

    let total = sum(&distribution.recipients);
    let available = suspense_balance(conn, &portfolio.id)?;
    if total > available {
        return Err(LedgerError::InsufficientBalance {
            owner: format!("portfolio {} suspense", portfolio.id),
            available,
            requested: total,
        });
    }
    let mut allocation = new_allocation(
        AllocationKind::SuspenseDistribution,
        actor,
        current,
        total,
        distribution.notes.clone(),
    );
    allocation.source_portfolio_id = Some(portfolio.id.clone());
    allocation.recipient_portfolio_id = Some(portfolio.id.clone());
    allocation.recipients = distribution.recipients.clone();

    write_allocation(conn, actor, &mut allocation, |conn, id| {
        append(
            conn,
            &NewEntry::new(
                OwnerRef::Portfolio(portfolio.id.clone()),
                current,
                TransactionType::AllocationOut,
                -total,
                format!("Suspense distribution {}", id),
            )
            .for_allocation(id),
        )?;
        for leg in &distribution.recipients {
            append(
                conn,
                &NewEntry::new(
                    OwnerRef::Practice(leg.practice_id.clone()),
                    current,
                    TransactionType::AllocationIn,
                    leg.amount,
                    format!("Suspense distribution {} in", id),
                )
                .for_allocation(id),
            )?;
        }
        Ok(())
    })?;
    Ok(allocation)
}

fn new_allocation(
    kind: AllocationKind,
    actor: &Actor,
    period: PeriodRef,
    total: Decimal,
    notes: Option<String>,
) -> Allocation {
    Allocation {
        id: uuid::Uuid::new_v4().to_string(),
        kind,
        donor_user_id: actor.id.clone(),
        source_portfolio_id: None,
        recipient_portfolio_id: None,
        total_amount: total,
        status: AllocationStatus::Pending,
        notes: notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        donors: Vec::new(),
        recipients: Vec::new(),
        period,
        created_at: Utc::now(),
        completed_at: None,
    }
}

fn write_donor_entries(
    conn: &Connection,
    allocation_id: &str,
    period: PeriodRef,
    donors: &[AllocationLeg],
) -> Result<()> {
    for leg in donors {
        append(
            conn,
            &NewEntry::new(
                OwnerRef::Practice(leg.practice_id.clone()),
                period,
                TransactionType::AllocationOut,
                -leg.amount,
                format!("Allocation {} out", allocation_id),
            )
            .for_allocation(allocation_id),
        )?;
    }
    Ok(())
}

/// Pending row + legs, then entries, then `completed`
fn write_allocation<F>(conn: &Connection, actor: &Actor, allocation: &mut Allocation, entries: F) -> Result<()>
where
    F: FnOnce(&Connection, &str) -> Result<()>,
{
    conn.execute(
        "INSERT INTO allocations (
            id, kind, donor_user_id, source_portfolio_id, recipient_portfolio_id,
            total_amount, status, notes, period, year, created_at, completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)",
        params![
            allocation.id,
            allocation.kind.as_str(),
            allocation.donor_user_id,
            allocation.source_portfolio_id,
            allocation.recipient_portfolio_id,
            to_db(allocation.total_amount),
            AllocationStatus::Pending.as_str(),
            allocation.notes,
            allocation.period.period,
            allocation.period.year,
            allocation.created_at.to_rfc3339(),
        ],
    )?;
    for (side, legs) in [("donor", &allocation.donors), ("recipient", &allocation.recipients)] {
        for leg in legs {
            conn.execute(
                "INSERT INTO allocation_legs (allocation_id, side, practice_id, amount)
                 VALUES (?1, ?2, ?3, ?4)",
                params![allocation.id, side, leg.practice_id, to_db(leg.amount)],
            )?;
        }
    }

    entries(conn, &allocation.id)?;

    let completed_at = Utc::now();
    conn.execute(
        "UPDATE allocations SET status = ?1, completed_at = ?2 WHERE id = ?3",
        params![
            AllocationStatus::Completed.as_str(),
            completed_at.to_rfc3339(),
            allocation.id
        ],
    )?;
    allocation.status = AllocationStatus::Completed;
    allocation.completed_at = Some(completed_at);

    insert_event(
        conn,
        &Event::new(
            "allocation_completed",
            "allocation",
            &allocation.id,
            json!({
                "kind": allocation.kind.as_str(),
                "total": to_db(allocation.total_amount),
                "donors": allocation.donors,
                "recipients": allocation.recipients,
                "recipient_portfolio_id": allocation.recipient_portfolio_id,
            }),
            &actor.id,
        ),
    )?;

    info!(
        allocation = %allocation.id,
        kind = %allocation.kind,
        total = %allocation.total_amount,
        "allocation completed"
    );
    Ok(())
}

// ============================================================================
// QUERIES
// ============================================================================

const ALLOCATION_COLUMNS: &str = "id, kind, donor_user_id, source_portfolio_id, \
     recipient_portfolio_id, total_amount, status, notes, period, year, created_at, completed_at";

fn allocation_from_row(row: &Row<'_>) -> rusqlite::Result<Allocation> {
    let kind: String = row.get(1)?;
    let total: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;

    Ok(Allocation {
        id: row.get(0)?,
        kind: AllocationKind::from_str(&kind).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        donor_user_id: row.get(2)?,
        source_portfolio_id: row.get(3)?,
        recipient_portfolio_id: row.get(4)?,
        total_amount: from_db(&total)?,
        status: if status == "completed" {
            AllocationStatus::Completed
        } else {
            AllocationStatus::Pending
        },
        notes: row.get(7)?,
        donors: Vec::new(),
        recipients: Vec::new(),
        period: PeriodRef::new(row.get(8)?, row.get(9)?),
        created_at: parse_timestamp(&created_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn load_legs(conn: &Connection, allocation: &mut Allocation) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT side, practice_id, amount FROM allocation_legs
         WHERE allocation_id = ?1 ORDER BY id ASC",
    )?;
    let legs = stmt
        .query_map([&allocation.id], |row| {
            let side: String = row.get(0)?;
            let amount: String = row.get(2)?;
            Ok((side, AllocationLeg {
                practice_id: row.get(1)?,
                amount: from_db(&amount)?,
            }))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (side, leg) in legs {
        if side == "donor" {
            allocation.donors.push(leg);
        } else {
            allocation.recipients.push(leg);
        }
    }
    Ok(())
}

pub fn find_allocation(conn: &Connection, id: &str) -> Result<Option<Allocation>> {
    let allocation = conn
        .query_row(
            &format!("SELECT {} FROM allocations WHERE id = ?1", ALLOCATION_COLUMNS),
            [id],
            allocation_from_row,
        )
        .optional()?;

    match allocation {
        Some(mut allocation) => {
            load_legs(conn, &mut allocation)?;
            Ok(Some(allocation))
        }
        None => Ok(None),
    }
}

pub fn get_allocation(conn: &Connection, id: &str) -> Result<Allocation> {
    find_allocation(conn, id)?.ok_or_else(|| LedgerError::not_found("allocation", id))
}

/// All allocations, oldest first
pub fn list_allocations(conn: &Connection) -> Result<Vec<Allocation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM allocations ORDER BY created_at ASC, id",
        ALLOCATION_COLUMNS
    ))?;
    let mut allocations = stmt
        .query_map([], allocation_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for allocation in &mut allocations {
        load_legs(conn, allocation)?;
    }
    Ok(allocations)
}
