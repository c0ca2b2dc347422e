// 🗂️ Portfolio Entity - named grouping of practices
//
// A portfolio also owns a suspense balance: ledger entries tagged to the
// portfolio itself rather than a practice (see balance::suspense_balance).

use crate::db::parse_timestamp;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    /// Stable external key
    pub id: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(id: &str, name: &str) -> Self {
        Portfolio {
            id: id.trim().to_string(),
            name: name.trim().to_string(),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get(3)?;
        Ok(Portfolio {
            id: row.get(0)?,
            name: row.get(1)?,
            active: row.get(2)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

pub fn insert_portfolio(conn: &Connection, portfolio: &Portfolio) -> Result<()> {
    if portfolio.id.is_empty() || portfolio.name.is_empty() {
        return Err(LedgerError::validation("portfolio id and name are required"));
    }
    if find_portfolio(conn, &portfolio.id)?.is_some() {
        return Err(LedgerError::validation(format!(
            "portfolio {} already exists",
            portfolio.id
        )));
    }

    conn.execute(
        "INSERT INTO portfolios (id, name, active, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            portfolio.id,
            portfolio.name,
            portfolio.active,
            portfolio.created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

pub fn find_portfolio(conn: &Connection, id: &str) -> Result<Option<Portfolio>> {
    let portfolio = conn
        .query_row(
            "SELECT id, name, active, created_at FROM portfolios WHERE id = ?1",
            [id],
            Portfolio::from_row,
        )
        .optional()?;
    Ok(portfolio)
}

pub fn get_portfolio(conn: &Connection, id: &str) -> Result<Portfolio> {
    find_portfolio(conn, id)?.ok_or_else(|| LedgerError::not_found("portfolio", id))
}

pub fn all_portfolios(conn: &Connection) -> Result<Vec<Portfolio>> {
    let mut stmt =
        conn.prepare("SELECT id, name, active, created_at FROM portfolios ORDER BY id")?;
    let portfolios = stmt
        .query_map([], Portfolio::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(portfolios)
}

pub fn set_portfolio_active(conn: &Connection, id: &str, active: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE portfolios SET active = ?1 WHERE id = ?2",
        params![active, id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("portfolio", id));
    }
    Ok(())
}
