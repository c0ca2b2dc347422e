// 🏥 Practice Entity - the funded unit
//
// Identity is the external practice key; the owning portfolio is a value that
// can change. Reassignment is recorded as an audit row and never touches
// historical ledger entries.

use crate::db::parse_timestamp;
use crate::entities::portfolio::get_portfolio;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

// ============================================================================
// PRACTICE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Practice {
    /// Stable external key (e.g. the clinic number used in metric imports)
    pub id: String,
    pub name: String,
    /// Owning portfolio (reassignable)
    pub portfolio_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Practice {
    pub fn new(id: &str, name: &str, portfolio_id: &str) -> Self {
        Practice {
            id: id.trim().to_string(),
            name: name.trim().to_string(),
            portfolio_id: portfolio_id.trim().to_string(),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get(4)?;
        Ok(Practice {
            id: row.get(0)?,
            name: row.get(1)?,
            portfolio_id: row.get(2)?,
            active: row.get(3)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

// ============================================================================
// REASSIGNMENT AUDIT RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeReassignment {
    pub id: String,
    pub practice_id: String,
    pub from_portfolio_id: String,
    pub to_portfolio_id: String,
    pub reassigned_by: String,
    pub reassigned_at: DateTime<Utc>,
}

// ============================================================================
// PERSISTENCE
// ============================================================================

const PRACTICE_COLUMNS: &str = "id, name, portfolio_id, active, created_at";

pub fn insert_practice(conn: &Connection, practice: &Practice) -> Result<()> {
    if practice.id.is_empty() || practice.name.is_empty() {
        return Err(LedgerError::validation("practice id and name are required"));
    }
    // Owning portfolio must exist
    get_portfolio(conn, &practice.portfolio_id)?;

    if find_practice(conn, &practice.id)?.is_some() {
        return Err(LedgerError::validation(format!(
            "practice {} already exists",
            practice.id
        )));
    }

    conn.execute(
        "INSERT INTO practices (id, name, portfolio_id, active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            practice.id,
            practice.name,
            practice.portfolio_id,
            practice.active,
            practice.created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

pub fn find_practice(conn: &Connection, id: &str) -> Result<Option<Practice>> {
    let practice = conn
        .query_row(
            &format!("SELECT {} FROM practices WHERE id = ?1", PRACTICE_COLUMNS),
            [id],
            Practice::from_row,
        )
        .optional()?;
    Ok(practice)
}

pub fn get_practice(conn: &Connection, id: &str) -> Result<Practice> {
    find_practice(conn, id)?.ok_or_else(|| LedgerError::not_found("practice", id))
}

pub fn all_practices(conn: &Connection) -> Result<Vec<Practice>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM practices ORDER BY id",
        PRACTICE_COLUMNS
    ))?;
    let practices = stmt
        .query_map([], Practice::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(practices)
}

pub fn practices_in_portfolio(conn: &Connection, portfolio_id: &str) -> Result<Vec<Practice>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM practices WHERE portfolio_id = ?1 ORDER BY id",
        PRACTICE_COLUMNS
    ))?;
    let practices = stmt
        .query_map([portfolio_id], Practice::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(practices)
}

pub fn set_practice_active(conn: &Connection, id: &str, active: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE practices SET active = ?1 WHERE id = ?2",
        params![active, id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("practice", id));
    }
    Ok(())
}

/// Move a practice to another portfolio and record the audit row
pub fn reassign_practice(
    conn: &Connection,
    practice_id: &str,
    to_portfolio_id: &str,
    actor: &str,
) -> Result<PracticeReassignment> {
    let practice = get_practice(conn, practice_id)?;
    get_portfolio(conn, to_portfolio_id)?;

    if practice.portfolio_id == to_portfolio_id {
        return Err(LedgerError::validation(format!(
            "practice {} already belongs to portfolio {}",
            practice_id, to_portfolio_id
        )));
    }

    let reassignment = PracticeReassignment {
        id: uuid::Uuid::new_v4().to_string(),
        practice_id: practice.id.clone(),
        from_portfolio_id: practice.portfolio_id.clone(),
        to_portfolio_id: to_portfolio_id.to_string(),
        reassigned_by: actor.to_string(),
        reassigned_at: Utc::now(),
    };

    conn.execute(
        "UPDATE practices SET portfolio_id = ?1 WHERE id = ?2",
        params![to_portfolio_id, practice_id],
    )?;
    conn.execute(
        "INSERT INTO practice_reassignments
            (id, practice_id, from_portfolio_id, to_portfolio_id, reassigned_by, reassigned_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            reassignment.id,
            reassignment.practice_id,
            reassignment.from_portfolio_id,
            reassignment.to_portfolio_id,
            reassignment.reassigned_by,
            reassignment.reassigned_at.to_rfc3339(),
        ],
    )?;

    Ok(reassignment)
}

pub fn reassignments_for(conn: &Connection, practice_id: &str) -> Result<Vec<PracticeReassignment>> {
    let mut stmt = conn.prepare(
        "SELECT id, practice_id, from_portfolio_id, to_portfolio_id, reassigned_by, reassigned_at
         FROM practice_reassignments
         WHERE practice_id = ?1
         ORDER BY reassigned_at ASC",
    )?;
    let rows = stmt
        .query_map([practice_id], |row| {
            let at: String = row.get(5)?;
            Ok(PracticeReassignment {
                id: row.get(0)?,
                practice_id: row.get(1)?,
                from_portfolio_id: row.get(2)?,
                to_portfolio_id: row.get(3)?,
                reassigned_by: row.get(4)?,
                reassigned_at: parse_timestamp(&at)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
