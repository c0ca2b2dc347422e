// 📒 Ledger Store - append-only signed entries
//
// Positive amounts credit (raise) a balance, negative amounts debit it.
// There is no update or delete: a reversal is a new `cancelled` entry with the
// opposite sign that points at the entry it reverses.

use crate::db::parse_timestamp;
use crate::error::{LedgerError, Result};
use crate::money::{from_db, to_db};
use crate::periods::{find_period, PeriodRef};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type EntryId = i64;

// ============================================================================
// TRANSACTION TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    OpeningBalance,
    RemeasurementIncrease,
    RemeasurementDecrease,
    Committed,
    Paid,
    Cancelled,
    AllocationIn,
    AllocationOut,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::OpeningBalance => "opening_balance",
            TransactionType::RemeasurementIncrease => "remeasurement_increase",
            TransactionType::RemeasurementDecrease => "remeasurement_decrease",
            TransactionType::Committed => "committed",
            TransactionType::Paid => "paid",
            TransactionType::Cancelled => "cancelled",
            TransactionType::AllocationIn => "allocation_in",
            TransactionType::AllocationOut => "allocation_out",
        }
    }

    pub fn is_remeasurement(&self) -> bool {
        matches!(
            self,
            TransactionType::RemeasurementIncrease | TransactionType::RemeasurementDecrease
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "opening_balance" => Ok(TransactionType::OpeningBalance),
            "remeasurement_increase" => Ok(TransactionType::RemeasurementIncrease),
            "remeasurement_decrease" => Ok(TransactionType::RemeasurementDecrease),
            "committed" => Ok(TransactionType::Committed),
            "paid" => Ok(TransactionType::Paid),
            "cancelled" => Ok(TransactionType::Cancelled),
            "allocation_in" => Ok(TransactionType::AllocationIn),
            "allocation_out" => Ok(TransactionType::AllocationOut),
            other => Err(LedgerError::validation(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// OWNER
// ============================================================================

/// Who a ledger entry belongs to: a practice, or a portfolio's suspense account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OwnerRef {
    Practice(String),
    Portfolio(String),
}

impl OwnerRef {
    pub fn id(&self) -> &str {
        match self {
            OwnerRef::Practice(id) | OwnerRef::Portfolio(id) => id,
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerRef::Practice(id) => write!(f, "practice {}", id),
            OwnerRef::Portfolio(id) => write!(f, "portfolio {} suspense", id),
        }
    }
}

// ============================================================================
// ENTRIES
// ============================================================================

/// Entry as requested by a caller, before it has an id
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub owner: OwnerRef,
    pub period: PeriodRef,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub description: String,
    pub request_id: Option<String>,
    pub allocation_id: Option<String>,
    pub reverses_entry_id: Option<EntryId>,
}

impl NewEntry {
    pub fn new(
        owner: OwnerRef,
        period: PeriodRef,
        transaction_type: TransactionType,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Self {
        NewEntry {
            owner,
            period,
            transaction_type,
            amount,
            description: description.into(),
            request_id: None,
            allocation_id: None,
            reverses_entry_id: None,
        }
    }

    pub fn for_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn for_allocation(mut self, allocation_id: &str) -> Self {
        self.allocation_id = Some(allocation_id.to_string());
        self
    }

    pub fn reversing(mut self, entry_id: EntryId) -> Self {
        self.reverses_entry_id = Some(entry_id);
        self
    }
}

/// Stored, immutable entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub owner: OwnerRef,
    pub period: PeriodRef,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub description: String,
    pub request_id: Option<String>,
    pub allocation_id: Option<String>,
    pub reverses_entry_id: Option<EntryId>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let practice_id: Option<String> = row.get(1)?;
        let portfolio_id: Option<String> = row.get(2)?;
        let owner = match (practice_id, portfolio_id) {
            (Some(p), _) => OwnerRef::Practice(p),
            (None, Some(pf)) => OwnerRef::Portfolio(pf),
            (None, None) => return Err(rusqlite::Error::InvalidColumnType(
                1,
                "owner".to_string(),
                rusqlite::types::Type::Null,
            )),
        };

        let type_text: String = row.get(5)?;
        let transaction_type = TransactionType::from_str(&type_text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let amount: String = row.get(6)?;
        let created_at: String = row.get(11)?;

        Ok(LedgerEntry {
            id: row.get(0)?,
            owner,
            period: PeriodRef::new(row.get(3)?, row.get(4)?),
            transaction_type,
            amount: from_db(&amount)?,
            description: row.get(7)?,
            request_id: row.get(8)?,
            allocation_id: row.get(9)?,
            reverses_entry_id: row.get(10)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

const ENTRY_COLUMNS: &str = "id, practice_id, portfolio_id, period, year, transaction_type, \
     amount, description, request_id, allocation_id, reverses_entry_id, created_at";

// ============================================================================
// STORE OPERATIONS
// ============================================================================

fn owner_exists(conn: &Connection, owner: &OwnerRef) -> Result<bool> {
    let sql = match owner {
        OwnerRef::Practice(_) => "SELECT 1 FROM practices WHERE id = ?1",
        OwnerRef::Portfolio(_) => "SELECT 1 FROM portfolios WHERE id = ?1",
    };
    let found: Option<i64> = conn
        .query_row(sql, [owner.id()], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Append one entry. Rejects zero amounts, unknown periods and unknown owners.
pub fn append(conn: &Connection, entry: &NewEntry) -> Result<EntryId> {
    if entry.amount.is_zero() {
        return Err(LedgerError::validation("ledger entry amount must not be zero"));
    }
    if find_period(conn, entry.period)?.is_none() {
        return Err(LedgerError::validation(format!(
            "unknown pay period {}",
            entry.period
        )));
    }
    if !owner_exists(conn, &entry.owner)? {
        return Err(LedgerError::validation(format!("unknown {}", entry.owner)));
    }
    if let Some(reversed) = entry.reverses_entry_id {
        if find_entry(conn, reversed)?.is_none() {
            return Err(LedgerError::validation(format!(
                "reversed entry {} does not exist",
                reversed
            )));
        }
    }

    let (practice_id, portfolio_id) = match &entry.owner {
        OwnerRef::Practice(id) => (Some(id.as_str()), None),
        OwnerRef::Portfolio(id) => (None, Some(id.as_str())),
    };

    conn.execute(
        "INSERT INTO ledger_entries (
            practice_id, portfolio_id, period, year, transaction_type, amount,
            description, request_id, allocation_id, reverses_entry_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            practice_id,
            portfolio_id,
            entry.period.period,
            entry.period.year,
            entry.transaction_type.as_str(),
            to_db(entry.amount),
            entry.description,
            entry.request_id,
            entry.allocation_id,
            entry.reverses_entry_id,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

pub fn find_entry(conn: &Connection, id: EntryId) -> Result<Option<LedgerEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {} FROM ledger_entries WHERE id = ?1", ENTRY_COLUMNS),
            [id],
            LedgerEntry::from_row,
        )
        .optional()?;
    Ok(entry)
}

/// All entries of an owner in creation order, optionally limited to one year
pub fn entries_for(conn: &Connection, owner: &OwnerRef, year: Option<i32>) -> Result<Vec<LedgerEntry>> {
    let owner_column = match owner {
        OwnerRef::Practice(_) => "practice_id",
        OwnerRef::Portfolio(_) => "portfolio_id",
    };
    let sql = format!(
        "SELECT {} FROM ledger_entries
         WHERE {} = ?1 AND (?2 IS NULL OR year = ?2)
         ORDER BY id ASC",
        ENTRY_COLUMNS, owner_column
    );

    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params![owner.id(), year], LedgerEntry::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn entries_for_request(conn: &Connection, request_id: &str) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ledger_entries WHERE request_id = ?1 ORDER BY id ASC",
        ENTRY_COLUMNS
    ))?;
    let entries = stmt
        .query_map([request_id], LedgerEntry::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn entries_for_allocation(conn: &Connection, allocation_id: &str) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ledger_entries WHERE allocation_id = ?1 ORDER BY id ASC",
        ENTRY_COLUMNS
    ))?;
    let entries = stmt
        .query_map([allocation_id], LedgerEntry::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Every entry, optionally limited to one year (export projection)
pub fn all_entries(conn: &Connection, year: Option<i32>) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ledger_entries WHERE (?1 IS NULL OR year = ?1) ORDER BY id ASC",
        ENTRY_COLUMNS
    ))?;
    let entries = stmt
        .query_map(params![year], LedgerEntry::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn count_entries(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
    Ok(count)
}
