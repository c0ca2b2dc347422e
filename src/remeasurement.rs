// 📈 Remeasurement Processor
//
// Turns a metrics import (stipend cap per practice for the current pay period)
// into cap-delta ledger entries:
//   - first sighting of a practice       → opening_balance = new cap
//   - cap moved by more than a cent       → remeasurement_increase / _decrease
//   - cap unchanged                       → nothing (re-imports are no-ops)
//
// Each row is applied inside its own savepoint: one bad row is reported and
// rolled back without aborting the rest of the batch.

use crate::balance::running_cap;
use crate::config::EngineConfig;
use crate::entities::practice::find_practice;
use crate::error::{LedgerError, Result};
use crate::ledger::{append, entries_for, NewEntry, OwnerRef, TransactionType};
use crate::money::{from_db, parse_amount, to_db, within_tolerance};
use crate::periods::{current_period, find_period, mark_remeasurement_completed, PeriodRef};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Read;
use tracing::{debug, warn};

// ============================================================================
// IMPORT ROWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub practice_id: String,
    pub period: PeriodRef,
    pub stipend_cap: Decimal,
    pub negative_earnings_cap: Decimal,
    pub negative_earnings_utilized: Decimal,
}

impl MetricsRow {
    pub fn new(practice_id: &str, period: PeriodRef, stipend_cap: Decimal) -> Self {
        MetricsRow {
            practice_id: practice_id.to_string(),
            period,
            stipend_cap,
            negative_earnings_cap: Decimal::ZERO,
            negative_earnings_utilized: Decimal::ZERO,
        }
    }

    /// Fingerprint used to store each distinct metrics row once
    pub fn row_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}",
            self.practice_id,
            self.period.period,
            self.period.year,
            to_db(self.stipend_cap),
            to_db(self.negative_earnings_cap),
            to_db(self.negative_earnings_utilized)
        ));
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningBalanceRow {
    pub practice_id: String,
    pub period: PeriodRef,
    pub amount: Decimal,
}

/// A row that could not be applied, with its 1-based position in the input
/// of the stage that rejected it (CSV data row, or batch index)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    pub row: usize,
    pub practice_id: String,
    pub reason: String,
}

// ============================================================================
// SUMMARIES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsImportSummary {
    pub period: Option<PeriodRef>,
    /// Rows applied without error (including unchanged and unregistered ones)
    pub imported: usize,
    pub opening_balances: usize,
    pub remeasurements: usize,
    pub unchanged: usize,
    /// Metrics stored, but no ledger entry is possible
    pub practices_not_in_registry: Vec<String>,
    /// In the prior period's import but not this one; cap carried forward
    pub disappeared_practices: Vec<String>,
    pub failures: Vec<RowFailure>,
    pub remeasurement_completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpeningBalanceImportSummary {
    pub created: usize,
    pub skipped: usize,
    pub unknown_practices: Vec<String>,
    pub failures: Vec<RowFailure>,
}

enum RowOutcome {
    OpeningBalance,
    Remeasured,
    Unchanged,
    NotInRegistry,
}

// ============================================================================
// METRICS IMPORT
// ============================================================================

/// Apply a metrics batch for the current pay period.
///
/// Only a missing current period aborts the batch; every other problem is a
/// per-row failure. `parse_failures` are rows that never made it into `rows`
/// (e.g. malformed CSV lines). The period is marked remeasured only when no
/// row failed at either stage.
pub fn apply_metrics_import(
    tx: &mut Transaction<'_>,
    config: &EngineConfig,
    rows: &[MetricsRow],
    parse_failures: Vec<RowFailure>,
) -> Result<MetricsImportSummary> {
    let current = current_period(tx)?.period_ref();
    let mut summary = MetricsImportSummary {
        period: Some(current),
        failures: parse_failures,
        ..Default::default()
    };

    let mut seen = BTreeSet::new();
    let mut not_in_registry = BTreeSet::new();

    for (index, row) in rows.iter().enumerate() {
        let sp = tx.savepoint()?;
        match apply_metrics_row(&sp, config, current, row) {
            Ok(outcome) => {
                sp.commit()?;
                summary.imported += 1;
                seen.insert(row.practice_id.clone());
                match outcome {
                    RowOutcome::OpeningBalance => summary.opening_balances += 1,
                    RowOutcome::Remeasured => summary.remeasurements += 1,
                    RowOutcome::Unchanged => summary.unchanged += 1,
                    RowOutcome::NotInRegistry => {
                        not_in_registry.insert(row.practice_id.clone());
                    }
                }
            }
            Err(err) => {
                // Dropping the savepoint rolls the row back
                drop(sp);
                warn!(row = index + 1, practice = %row.practice_id, error = %err, "metrics row rejected");
                summary.failures.push(RowFailure {
                    row: index + 1,
                    practice_id: row.practice_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    summary.practices_not_in_registry = not_in_registry.into_iter().collect();
    summary.disappeared_practices = prior_cap_set(tx, current)?
        .into_iter()
        .filter(|id| !seen.contains(id))
        .collect();

    if summary.failures.is_empty() {
        mark_remeasurement_completed(tx, current)?;
        summary.remeasurement_completed = true;
    }

    Ok(summary)
}

fn apply_metrics_row(
    conn: &Connection,
    config: &EngineConfig,
    current: PeriodRef,
    row: &MetricsRow,
) -> Result<RowOutcome> {
    if row.practice_id.trim().is_empty() {
        return Err(LedgerError::validation("practice id is empty"));
    }
    if row.period != current {
        return Err(LedgerError::validation(format!(
            "row is for {} but the current pay period is {}",
            row.period, current
        )));
    }
    if row.stipend_cap.is_sign_negative() {
        return Err(LedgerError::validation(format!(
            "stipend cap must not be negative, got {}",
            row.stipend_cap
        )));
    }

    store_metrics(conn, row)?;

    if find_practice(conn, &row.practice_id)?.is_none() {
        return Ok(RowOutcome::NotInRegistry);
    }

    let owner = OwnerRef::Practice(row.practice_id.clone());
    let entries = entries_for(conn, &owner, Some(current.year))?;
    let mut prior = running_cap(&entries, current);

    if prior.is_none() && config.carry_forward_cap_across_years {
        prior = carry_forward(conn, &owner, current, config.periods_per_year)?;
    }

    match prior {
        None => {
            if row.stipend_cap.is_zero() {
                return Ok(RowOutcome::Unchanged);
            }
            append(
                conn,
                &NewEntry::new(
                    owner,
                    current,
                    TransactionType::OpeningBalance,
                    row.stipend_cap,
                    format!("Opening stipend cap for {}", current),
                ),
            )?;
            Ok(RowOutcome::OpeningBalance)
        }
        Some(prior_cap) => {
            if within_tolerance(row.stipend_cap, prior_cap, config.cent_tolerance) {
                debug!(practice = %row.practice_id, cap = %prior_cap, "cap unchanged");
                return Ok(RowOutcome::Unchanged);
            }
            let delta = row.stipend_cap - prior_cap;
            let transaction_type = if delta.is_sign_positive() {
                TransactionType::RemeasurementIncrease
            } else {
                TransactionType::RemeasurementDecrease
            };
            append(
                conn,
                &NewEntry::new(
                    owner,
                    current,
                    transaction_type,
                    delta,
                    format!(
                        "Remeasurement {}: cap {} -> {}",
                        current, prior_cap, row.stipend_cap
                    ),
                ),
            )?;
            Ok(RowOutcome::Remeasured)
        }
    }
}

/// Seed this year's baseline from last year's closing cap
fn carry_forward(
    conn: &Connection,
    owner: &OwnerRef,
    current: PeriodRef,
    periods_per_year: u32,
) -> Result<Option<Decimal>> {
    let last_year = PeriodRef::new(periods_per_year, current.year - 1);
    let previous = entries_for(conn, owner, Some(last_year.year))?;
    let Some(cap) = running_cap(&previous, last_year) else {
        return Ok(None);
    };
    if cap.is_zero() || cap.is_sign_negative() {
        return Ok(None);
    }

    append(
        conn,
        &NewEntry::new(
            owner.clone(),
            current,
            TransactionType::OpeningBalance,
            cap,
            format!("Cap carried forward from {}", last_year.year),
        ),
    )?;
    Ok(Some(cap))
}

fn store_metrics(conn: &Connection, row: &MetricsRow) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO practice_metrics (
            row_hash, practice_id, period, year, stipend_cap,
            negative_earnings_cap, negative_earnings_utilized, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            row.row_hash(),
            row.practice_id,
            row.period.period,
            row.period.year,
            to_db(row.stipend_cap),
            to_db(row.negative_earnings_cap),
            to_db(row.negative_earnings_utilized),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Practices seen in the most recent import before `current`
fn prior_cap_set(conn: &Connection, current: PeriodRef) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT practice_id FROM practice_metrics
         WHERE (year, period) = (
             SELECT year, period FROM practice_metrics
             WHERE year < ?2 OR (year = ?2 AND period < ?1)
             ORDER BY year DESC, period DESC
             LIMIT 1
         )",
    )?;
    let ids = stmt
        .query_map(params![current.period, current.year], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

// ============================================================================
// OPENING BALANCE BACKFILL
// ============================================================================

/// One-time historical backfill: each row records prior consumption as a
/// negative opening_balance entry. Existing practice+period+year rows are skipped.
pub fn apply_opening_balance_import(
    tx: &mut Transaction<'_>,
    rows: &[OpeningBalanceRow],
) -> Result<OpeningBalanceImportSummary> {
    let mut summary = OpeningBalanceImportSummary::default();
    let mut unknown = BTreeSet::new();

    for (index, row) in rows.iter().enumerate() {
        if find_practice(tx, &row.practice_id)?.is_none() {
            summary.skipped += 1;
            unknown.insert(row.practice_id.clone());
            continue;
        }
        if find_period(tx, row.period)?.is_none() {
            summary.failures.push(RowFailure {
                row: index + 1,
                practice_id: row.practice_id.clone(),
                reason: format!("unknown pay period {}", row.period),
            });
            continue;
        }
        if row.amount.is_zero() {
            summary.failures.push(RowFailure {
                row: index + 1,
                practice_id: row.practice_id.clone(),
                reason: "amount must not be zero".to_string(),
            });
            continue;
        }

        if has_backfilled_balance(tx, &row.practice_id, row.period)? {
            summary.skipped += 1;
            continue;
        }

        append(
            tx,
            &NewEntry::new(
                OwnerRef::Practice(row.practice_id.clone()),
                row.period,
                TransactionType::OpeningBalance,
                -row.amount.abs(),
                format!("Historical stipend spend through {}", row.period),
            ),
        )?;
        summary.created += 1;
    }

    summary.unknown_practices = unknown.into_iter().collect();
    Ok(summary)
}

/// A negative opening_balance already recorded for the practice in `period`
fn has_backfilled_balance(conn: &Connection, practice_id: &str, period: PeriodRef) -> Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT amount FROM ledger_entries
         WHERE practice_id = ?1 AND period = ?2 AND year = ?3
           AND transaction_type = 'opening_balance'",
    )?;
    let amounts = stmt
        .query_map(params![practice_id, period.period, period.year], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for text in amounts {
        if from_db(&text)?.is_sign_negative() {
            return Ok(true);
        }
    }
    Ok(false)
}

// ============================================================================
// CSV PARSING
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawMetricsRow {
    #[serde(alias = "Practice ID", alias = "practice", alias = "Practice")]
    practice_id: String,
    #[serde(alias = "Pay Period", alias = "period", alias = "PP")]
    pay_period: String,
    #[serde(alias = "Year")]
    year: String,
    #[serde(alias = "Stipend Cap")]
    stipend_cap: String,
    #[serde(default, alias = "Negative Earnings Cap")]
    negative_earnings_cap: String,
    #[serde(default, alias = "Negative Earnings Utilized")]
    negative_earnings_utilized: String,
}

#[derive(Debug, Deserialize)]
struct RawOpeningBalanceRow {
    #[serde(alias = "Practice ID", alias = "practice", alias = "Practice")]
    practice_id: String,
    #[serde(alias = "Pay Period", alias = "period", alias = "PP")]
    pay_period: String,
    #[serde(alias = "Year")]
    year: String,
    #[serde(alias = "Amount")]
    amount: String,
}

fn parse_period(period: &str, year: &str) -> std::result::Result<PeriodRef, String> {
    let period: u32 = period
        .trim()
        .trim_start_matches("PP")
        .parse()
        .map_err(|_| format!("invalid pay period '{}'", period))?;
    let year: i32 = year
        .trim()
        .parse()
        .map_err(|_| format!("invalid year '{}'", year))?;
    Ok(PeriodRef::new(period, year))
}

fn parse_optional_amount(raw: &str, field: &str) -> std::result::Result<Decimal, String> {
    if raw.trim().is_empty() {
        return Ok(Decimal::ZERO);
    }
    parse_amount(raw).ok_or_else(|| format!("invalid {} '{}'", field, raw))
}

fn convert_metrics_row(raw: &RawMetricsRow) -> std::result::Result<MetricsRow, String> {
    let stipend_cap = parse_amount(&raw.stipend_cap)
        .ok_or_else(|| format!("invalid stipend cap '{}'", raw.stipend_cap))?;
    Ok(MetricsRow {
        practice_id: raw.practice_id.clone(),
        period: parse_period(&raw.pay_period, &raw.year)?,
        stipend_cap,
        negative_earnings_cap: parse_optional_amount(&raw.negative_earnings_cap, "negative earnings cap")?,
        negative_earnings_utilized: parse_optional_amount(
            &raw.negative_earnings_utilized,
            "negative earnings utilized",
        )?,
    })
}

fn reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input)
}

/// Parse a metrics CSV. Malformed rows become failures (1-based data rows).
pub fn parse_metrics_csv<R: Read>(input: R) -> Result<(Vec<MetricsRow>, Vec<RowFailure>)> {
    let mut rows = Vec::new();
    let mut failures = Vec::new();

    for (index, record) in reader(input).deserialize::<RawMetricsRow>().enumerate() {
        let raw = match record {
            Ok(raw) => raw,
            Err(e) => {
                failures.push(RowFailure {
                    row: index + 1,
                    practice_id: String::new(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let parsed = convert_metrics_row(&raw);

        match parsed {
            Ok(row) => rows.push(row),
            Err(reason) => failures.push(RowFailure {
                row: index + 1,
                practice_id: raw.practice_id,
                reason,
            }),
        }
    }

    Ok((rows, failures))
}

pub fn parse_opening_balance_csv<R: Read>(
    input: R,
) -> Result<(Vec<OpeningBalanceRow>, Vec<RowFailure>)> {
    let mut rows = Vec::new();
    let mut failures = Vec::new();

    for (index, record) in reader(input).deserialize::<RawOpeningBalanceRow>().enumerate() {
        let raw = match record {
            Ok(raw) => raw,
            Err(e) => {
                failures.push(RowFailure {
                    row: index + 1,
                    practice_id: String::new(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let parsed = parse_period(&raw.pay_period, &raw.year).and_then(|period| {
            parse_amount(&raw.amount)
                .map(|amount| OpeningBalanceRow {
                    practice_id: raw.practice_id.clone(),
                    period,
                    amount,
                })
                .ok_or_else(|| format!("invalid amount '{}'", raw.amount))
        });

        match parsed {
            Ok(row) => rows.push(row),
            Err(reason) => failures.push(RowFailure {
                row: index + 1,
                practice_id: raw.practice_id,
                reason,
            }),
        }
    }

    Ok((rows, failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::compute_balance;
    use crate::db::setup_database;
    use crate::entities::portfolio::{insert_portfolio, Portfolio};
    use crate::entities::practice::{insert_practice, Practice};
    use crate::ledger::count_entries;
    use crate::periods::{get_period, seed_year, set_current};
    use crate::test_support::{dec, grant_cap};
    use rusqlite::TransactionBehavior;

    fn setup() -> (Connection, EngineConfig) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let config = EngineConfig::in_memory();
        seed_year(&conn, &config, 2025).unwrap();
        seed_year(&conn, &config, 2026).unwrap();
        insert_portfolio(&conn, &Portfolio::new("PF-A", "Northeast")).unwrap();
        insert_practice(&conn, &Practice::new("P-1", "Clinic One", "PF-A")).unwrap();
        insert_practice(&conn, &Practice::new("P-2", "Clinic Two", "PF-A")).unwrap();
        set_current(&conn, PeriodRef::new(1, 2025)).unwrap();
        (conn, config)
    }

    fn import(conn: &mut Connection, config: &EngineConfig, rows: &[MetricsRow]) -> MetricsImportSummary {
        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).unwrap();
        let summary = apply_metrics_import(&mut tx, config, rows, Vec::new()).unwrap();
        tx.commit().unwrap();
        summary
    }

    #[test]
    fn test_first_sighting_creates_opening_balance() {
        let (mut conn, config) = setup();
        let summary = import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("10000"))]);

        assert_eq!(summary.imported, 1);
        assert_eq!(summary.opening_balances, 1);
        assert_eq!(summary.remeasurements, 0);
        assert!(summary.remeasurement_completed);
        assert!(get_period(&conn, PeriodRef::new(1, 2025)).unwrap().remeasurement_completed);

        let bal = compute_balance(&conn, "P-1", PeriodRef::new(1, 2025), 26).unwrap();
        assert_eq!(bal.available_balance, dec("10000"));
    }

    #[test]
    fn test_reimport_is_idempotent() {
        let (mut conn, config) = setup();
        let rows = [MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("10000"))];
        import(&mut conn, &config, &rows);
        let after_first = count_entries(&conn).unwrap();

        let summary = import(&mut conn, &config, &rows);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(count_entries(&conn).unwrap(), after_first);

        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM practice_metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, 1);
    }

    #[test]
    fn test_increase_and_decrease() {
        let (mut conn, config) = setup();
        import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("10000"))]);

        set_current(&conn, PeriodRef::new(2, 2025)).unwrap();
        let summary = import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(2, 2025), dec("12500"))]);
        assert_eq!(summary.remeasurements, 1);
        let bal = compute_balance(&conn, "P-1", PeriodRef::new(2, 2025), 26).unwrap();
        assert_eq!(bal.stipend_cap, dec("12500"));

        set_current(&conn, PeriodRef::new(3, 2025)).unwrap();
        import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(3, 2025), dec("11000"))]);
        let entries = entries_for(&conn, &OwnerRef::Practice("P-1".into()), Some(2025)).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.transaction_type, TransactionType::RemeasurementDecrease);
        assert_eq!(last.amount, dec("-1500"));
    }

    #[test]
    fn test_sub_cent_change_is_ignored() {
        let (mut conn, config) = setup();
        import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("10000.00"))]);
        set_current(&conn, PeriodRef::new(2, 2025)).unwrap();
        let summary = import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(2, 2025), dec("10000.01"))]);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.remeasurements, 0);
    }

    #[test]
    fn test_wrong_period_rows_are_reported_not_skipped() {
        let (mut conn, config) = setup();
        let summary = import(
            &mut conn,
            &config,
            &[
                MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("100")),
                MetricsRow::new("P-2", PeriodRef::new(5, 2025), dec("200")),
            ],
        );
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].row, 2);
        assert_eq!(summary.failures[0].practice_id, "P-2");
        assert!(!summary.remeasurement_completed);
        assert!(!get_period(&conn, PeriodRef::new(1, 2025)).unwrap().remeasurement_completed);
    }

    #[test]
    fn test_unregistered_and_disappeared_practices() {
        let (mut conn, config) = setup();
        import(
            &mut conn,
            &config,
            &[
                MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("100")),
                MetricsRow::new("P-2", PeriodRef::new(1, 2025), dec("200")),
            ],
        );

        set_current(&conn, PeriodRef::new(2, 2025)).unwrap();
        let summary = import(
            &mut conn,
            &config,
            &[
                MetricsRow::new("P-1", PeriodRef::new(2, 2025), dec("100")),
                MetricsRow::new("P-999", PeriodRef::new(2, 2025), dec("300")),
            ],
        );
        assert_eq!(summary.practices_not_in_registry, vec!["P-999".to_string()]);
        assert_eq!(summary.disappeared_practices, vec!["P-2".to_string()]);

        // P-2 keeps its cap
        let bal = compute_balance(&conn, "P-2", PeriodRef::new(2, 2025), 26).unwrap();
        assert_eq!(bal.stipend_cap, dec("200"));
    }

    #[test]
    fn test_year_boundary_without_carry_forward() {
        let (mut conn, config) = setup();
        import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("10000"))]);
        set_current(&conn, PeriodRef::new(1, 2026)).unwrap();
        let summary = import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(1, 2026), dec("8000"))]);
        assert_eq!(summary.opening_balances, 1);
        let bal = compute_balance(&conn, "P-1", PeriodRef::new(1, 2026), 26).unwrap();
        assert_eq!(bal.stipend_cap, dec("8000"));
    }

    #[test]
    fn test_year_boundary_with_carry_forward() {
        let (mut conn, mut config) = setup();
        config.carry_forward_cap_across_years = true;
        import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("10000"))]);
        set_current(&conn, PeriodRef::new(1, 2026)).unwrap();
        let summary = import(&mut conn, &config, &[MetricsRow::new("P-1", PeriodRef::new(1, 2026), dec("8000"))]);
        assert_eq!(summary.remeasurements, 1);

        let entries = entries_for(&conn, &OwnerRef::Practice("P-1".into()), Some(2026)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].transaction_type, TransactionType::OpeningBalance);
        assert_eq!(entries[0].amount, dec("10000"));
        assert_eq!(entries[1].amount, dec("-2000"));
    }

    #[test]
    fn test_no_current_period_aborts() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let config = EngineConfig::in_memory();
        let mut tx = conn.transaction().unwrap();
        let result = apply_metrics_import(&mut tx, &config, &[], Vec::new());
        assert!(matches!(result, Err(LedgerError::Configuration(_))));
    }

    #[test]
    fn test_opening_balance_backfill_skips_duplicates() {
        let (mut conn, _) = setup();
        let rows = vec![
            OpeningBalanceRow { practice_id: "P-1".into(), period: PeriodRef::new(1, 2025), amount: dec("750") },
            OpeningBalanceRow { practice_id: "P-404".into(), period: PeriodRef::new(1, 2025), amount: dec("10") },
        ];

        let mut tx = conn.transaction().unwrap();
        let first = apply_opening_balance_import(&mut tx, &rows).unwrap();
        let second = apply_opening_balance_import(&mut tx, &rows).unwrap();
        tx.commit().unwrap();

        assert_eq!(first.created, 1);
        assert_eq!(first.skipped, 1);
        assert_eq!(first.unknown_practices, vec!["P-404".to_string()]);
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 2);

        let bal = compute_balance(&conn, "P-1", PeriodRef::new(1, 2025), 26).unwrap();
        assert_eq!(bal.stipend_paid, dec("750"));
    }

    #[test]
    fn test_positive_opening_balance_is_not_a_backfill() {
        let (mut conn, _) = setup();
        grant_cap(&conn, "P-2", "4000");
        let rows = vec![OpeningBalanceRow {
            practice_id: "P-2".into(),
            period: PeriodRef::new(1, 2025),
            amount: dec("-250.50"),
        }];

        let mut tx = conn.transaction().unwrap();
        let first = apply_opening_balance_import(&mut tx, &rows).unwrap();
        let second = apply_opening_balance_import(&mut tx, &rows).unwrap();
        tx.commit().unwrap();

        assert_eq!(first.created, 1);
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 1);

        let bal = compute_balance(&conn, "P-2", PeriodRef::new(1, 2025), 26).unwrap();
        assert_eq!(bal.stipend_cap, dec("4000"));
        assert_eq!(bal.stipend_paid, dec("250.50"));
    }

    #[test]
    fn test_parse_metrics_csv() {
        let input = "Practice ID,Pay Period,Year,Stipend Cap,Negative Earnings Cap,Negative Earnings Utilized\n\
                     P-1,PP3,2025,\"$10,000.00\",500,0\n\
                     P-2,4,2025,abc,,\n\
                     P-3,4,2025,2500,,\n";
        let (rows, failures) = parse_metrics_csv(input.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].period, PeriodRef::new(3, 2025));
        assert_eq!(rows[0].stipend_cap, dec("10000"));
        assert_eq!(rows[0].negative_earnings_cap, dec("500"));
        assert_eq!(rows[1].negative_earnings_utilized, Decimal::ZERO);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].row, 2);
        assert_eq!(failures[0].practice_id, "P-2");
    }

    #[test]
    fn test_parse_opening_balance_csv() {
        let input = "practice_id,pay_period,year,amount\nP-1,1,2025,(250.00)\nP-2,x,2025,10\n";
        let (rows, failures) = parse_opening_balance_csv(input.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, dec("-250"));
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_row_hash_is_stable() {
        let a = MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("100.00"));
        let b = MetricsRow::new("P-1", PeriodRef::new(1, 2025), dec("100"));
        assert_eq!(a.row_hash(), b.row_hash());
        assert_eq!(a.row_hash().len(), 64);
    }
}
