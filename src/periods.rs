// 📅 Pay Period Registry
// Fixed-length periods numbered 1..=N per year, contiguous from the anchor.
// Exactly one period may be current; switching is a single transaction.

use crate::config::EngineConfig;
use crate::error::{LedgerError, Result};
use chrono::{Duration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// PERIOD REFERENCE (pure arithmetic)
// ============================================================================

/// (period, year) pair. Orders by year, then period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodRef {
    pub period: u32,
    pub year: i32,
}

impl PeriodRef {
    pub fn new(period: u32, year: i32) -> Self {
        PeriodRef { period, year }
    }

    pub fn validate(&self, periods_per_year: u32) -> Result<()> {
        if self.period == 0 || self.period > periods_per_year {
            return Err(LedgerError::validation(format!(
                "pay period must be between 1 and {}, got {}",
                periods_per_year, self.period
            )));
        }
        Ok(())
    }

    /// Following period; the cycle restarts at 1 with the year incremented
    pub fn next(&self, periods_per_year: u32) -> PeriodRef {
        if self.period >= periods_per_year {
            PeriodRef::new(1, self.year + 1)
        } else {
            PeriodRef::new(self.period + 1, self.year)
        }
    }

    pub fn prev(&self, periods_per_year: u32) -> PeriodRef {
        if self.period <= 1 {
            PeriodRef::new(periods_per_year, self.year - 1)
        } else {
            PeriodRef::new(self.period - 1, self.year)
        }
    }

    /// Periods from this one through the last of the year, inclusive (always >= 1)
    pub fn remaining_in_year(&self, periods_per_year: u32) -> u32 {
        periods_per_year.saturating_sub(self.period) + 1
    }

    /// Inclusive sequence from `self` to `end`; empty when `end` precedes `self`
    pub fn range_to(&self, end: PeriodRef, periods_per_year: u32) -> Vec<PeriodRef> {
        let mut out = Vec::new();
        let mut cursor = *self;
        while cursor <= end {
            out.push(cursor);
            if cursor == end {
                break;
            }
            cursor = cursor.next(periods_per_year);
        }
        out
    }
}

impl Ord for PeriodRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.year
            .cmp(&other.year)
            .then(self.period.cmp(&other.period))
    }
}

impl PartialOrd for PeriodRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeriodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PP{}'{}", self.period, self.year)
    }
}

// ============================================================================
// PAY PERIOD ROW
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayPeriod {
    pub id: i64,
    pub period: u32,
    pub year: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_current: bool,
    pub remeasurement_completed: bool,
}

impl PayPeriod {
    pub fn period_ref(&self) -> PeriodRef {
        PeriodRef::new(self.period, self.year)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let start: String = row.get(3)?;
        let end: String = row.get(4)?;
        Ok(PayPeriod {
            id: row.get(0)?,
            period: row.get(1)?,
            year: row.get(2)?,
            start_date: parse_date(&start)?,
            end_date: parse_date(&end)?,
            is_current: row.get(5)?,
            remeasurement_completed: row.get(6)?,
        })
    }
}

fn parse_date(text: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

const PERIOD_COLUMNS: &str =
    "id, period, year, start_date, end_date, is_current, remeasurement_completed";

// ============================================================================
// REGISTRY OPERATIONS
// ============================================================================

/// Start date of a period, counting contiguous periods from the anchor
pub fn period_start(config: &EngineConfig, period: PeriodRef) -> NaiveDate {
    let per_year = config.periods_per_year as i64;
    let offset = (period.year - config.anchor_year) as i64 * per_year + (period.period as i64 - 1);
    config.anchor_date + Duration::days(offset * config.period_length_days)
}

/// Generate all periods of `year`. Existing rows are left untouched.
/// Returns how many periods were created.
pub fn seed_year(conn: &Connection, config: &EngineConfig, year: i32) -> Result<usize> {
    let mut created = 0;
    for period in 1..=config.periods_per_year {
        let pref = PeriodRef::new(period, year);
        let start = period_start(config, pref);
        let end = start + Duration::days(config.period_length_days - 1);

        created += conn.execute(
            "INSERT OR IGNORE INTO pay_periods (period, year, start_date, end_date)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                period,
                year,
                start.format("%Y-%m-%d").to_string(),
                end.format("%Y-%m-%d").to_string()
            ],
        )?;
    }
    Ok(created)
}

pub fn find_period(conn: &Connection, period: PeriodRef) -> Result<Option<PayPeriod>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM pay_periods WHERE period = ?1 AND year = ?2",
                PERIOD_COLUMNS
            ),
            params![period.period, period.year],
            PayPeriod::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn get_period(conn: &Connection, period: PeriodRef) -> Result<PayPeriod> {
    find_period(conn, period)?.ok_or_else(|| LedgerError::not_found("pay period", period.to_string()))
}

pub fn get_period_by_id(conn: &Connection, id: i64) -> Result<PayPeriod> {
    conn.query_row(
        &format!("SELECT {} FROM pay_periods WHERE id = ?1", PERIOD_COLUMNS),
        [id],
        PayPeriod::from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("pay period", id.to_string()))
}

/// The period marked current. Missing is a configuration error, not an empty case.
pub fn current_period(conn: &Connection) -> Result<PayPeriod> {
    conn.query_row(
        &format!(
            "SELECT {} FROM pay_periods WHERE is_current = 1",
            PERIOD_COLUMNS
        ),
        [],
        PayPeriod::from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::Configuration("no current pay period is set".to_string()))
}

/// Mark `period` current and unmark the previous one.
///
/// Must run inside the caller's write transaction so the switch is atomic.
pub fn set_current(conn: &Connection, period: PeriodRef) -> Result<PayPeriod> {
    let target = get_period(conn, period)?;

    conn.execute(
        "UPDATE pay_periods SET is_current = 0 WHERE is_current = 1 AND id <> ?1",
        [target.id],
    )?;
    conn.execute(
        "UPDATE pay_periods SET is_current = 1 WHERE id = ?1",
        [target.id],
    )?;

    get_period_by_id(conn, target.id)
}

pub fn mark_remeasurement_completed(conn: &Connection, period: PeriodRef) -> Result<()> {
    let changed = conn.execute(
        "UPDATE pay_periods SET remeasurement_completed = 1 WHERE period = ?1 AND year = ?2",
        params![period.period, period.year],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("pay period", period.to_string()));
    }
    Ok(())
}

/// Registered periods between `start` and `end` inclusive, in order
pub fn periods_in_range(conn: &Connection, start: PeriodRef, end: PeriodRef) -> Result<Vec<PayPeriod>> {
    if end < start {
        return Err(LedgerError::validation(format!(
            "range end {} precedes start {}",
            end, start
        )));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM pay_periods
         WHERE (year > ?2 OR (year = ?2 AND period >= ?1))
           AND (year < ?4 OR (year = ?4 AND period <= ?3))
         ORDER BY year ASC, period ASC",
        PERIOD_COLUMNS
    ))?;
    let rows = stmt
        .query_map(
            params![start.period, start.year, end.period, end.year],
            PayPeriod::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Period whose date window contains `date`
pub fn period_for_date(conn: &Connection, date: NaiveDate) -> Result<Option<PayPeriod>> {
    let text = date.format("%Y-%m-%d").to_string();
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM pay_periods WHERE start_date <= ?1 AND end_date >= ?1",
                PERIOD_COLUMNS
            ),
            [text],
            PayPeriod::from_row,
        )
        .optional()?;
    Ok(row)
}
