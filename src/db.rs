use crate::config::EngineConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Event for the audit trail: every state change on the ledger side is an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open the configured database and apply connection pragmas
pub fn open(config: &EngineConfig) -> Result<Connection> {
    let conn = if config.database_path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        Connection::open(&config.database_path)?
    };

    // WAL is ignored for in-memory databases
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Registry: portfolios, practices, reassignment audit
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS portfolios (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS practices (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            portfolio_id TEXT NOT NULL REFERENCES portfolios(id),
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS practice_reassignments (
            id TEXT PRIMARY KEY,
            practice_id TEXT NOT NULL REFERENCES practices(id),
            from_portfolio_id TEXT NOT NULL,
            to_portfolio_id TEXT NOT NULL,
            reassigned_by TEXT NOT NULL,
            reassigned_at TEXT NOT NULL
        );",
    )?;

    // ==========================================================================
    // Pay periods (at most one current row, enforced by a partial unique index)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pay_periods (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            period INTEGER NOT NULL,
            year INTEGER NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            remeasurement_completed INTEGER NOT NULL DEFAULT 0,
            UNIQUE (period, year)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_pay_periods_single_current
            ON pay_periods(is_current) WHERE is_current = 1;",
    )?;

    // ==========================================================================
    // Ledger (append-only). Back-references are plain columns: deleting a
    // request or allocation never cascades into ledger history.
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            practice_id TEXT REFERENCES practices(id),
            portfolio_id TEXT REFERENCES portfolios(id),
            period INTEGER NOT NULL,
            year INTEGER NOT NULL,
            transaction_type TEXT NOT NULL,
            amount TEXT NOT NULL,
            description TEXT NOT NULL,
            request_id TEXT,
            allocation_id TEXT,
            reverses_entry_id INTEGER REFERENCES ledger_entries(id),
            created_at TEXT NOT NULL,
            CHECK ((practice_id IS NULL) <> (portfolio_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_practice_year
            ON ledger_entries(practice_id, year);
        CREATE INDEX IF NOT EXISTS idx_ledger_portfolio
            ON ledger_entries(portfolio_id);
        CREATE INDEX IF NOT EXISTS idx_ledger_request
            ON ledger_entries(request_id);
        CREATE INDEX IF NOT EXISTS idx_ledger_allocation
            ON ledger_entries(allocation_id);",
    )?;

    // ==========================================================================
    // Stipend requests
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stipend_requests (
            id TEXT PRIMARY KEY,
            practice_id TEXT NOT NULL REFERENCES practices(id),
            requestor_id TEXT NOT NULL,
            requestor_email TEXT NOT NULL,
            amount TEXT NOT NULL,
            request_type TEXT NOT NULL,
            category TEXT NOT NULL,
            description TEXT NOT NULL,
            justification TEXT NOT NULL,
            staff_ids TEXT,
            effective_period INTEGER NOT NULL,
            effective_year INTEGER NOT NULL,
            end_period INTEGER,
            end_year INTEGER,
            status TEXT NOT NULL,
            psm_approval TEXT,
            lead_psm_approval TEXT,
            finance_approval TEXT,
            rejection TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_requests_practice
            ON stipend_requests(practice_id);
        CREATE INDEX IF NOT EXISTS idx_requests_status
            ON stipend_requests(status);",
    )?;

    // ==========================================================================
    // Allocations
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS allocations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            donor_user_id TEXT NOT NULL,
            source_portfolio_id TEXT,
            recipient_portfolio_id TEXT,
            total_amount TEXT NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            period INTEGER NOT NULL,
            year INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS allocation_legs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            allocation_id TEXT NOT NULL REFERENCES allocations(id),
            side TEXT NOT NULL,
            practice_id TEXT NOT NULL,
            amount TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_allocation_legs
            ON allocation_legs(allocation_id);",
    )?;

    // ==========================================================================
    // Raw metrics imports (kept even for practices missing from the registry)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS practice_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            row_hash TEXT UNIQUE NOT NULL,
            practice_id TEXT NOT NULL,
            period INTEGER NOT NULL,
            year INTEGER NOT NULL,
            stipend_cap TEXT NOT NULL,
            negative_earnings_cap TEXT NOT NULL,
            negative_earnings_utilized TEXT NOT NULL,
            imported_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_metrics_period
            ON practice_metrics(year, period);",
    )?;

    // ==========================================================================
    // Events Table (audit trail / event sourcing)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Parse an RFC 3339 column into UTC
pub fn parse_timestamp(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('portfolios', 'practices', 'pay_periods', 'ledger_entries',
                  'stipend_requests', 'allocations', 'allocation_legs', 'events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 8);
    }

    #[test]
    fn test_event_log() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let event = Event::new(
            "request_submitted",
            "stipend_request",
            "req-123",
            serde_json::json!({"amount": "3000"}),
            "psm@example.com",
        );
        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "stipend_request", "req-123").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "request_submitted");
        assert_eq!(events[0].actor, "psm@example.com");
        assert_eq!(events[0].data["amount"], "3000");
    }

    #[test]
    fn test_single_current_period_enforced_by_schema() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        conn.execute(
            "INSERT INTO pay_periods (period, year, start_date, end_date, is_current)
             VALUES (1, 2025, '2025-01-05', '2025-01-18', 1)",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO pay_periods (period, year, start_date, end_date, is_current)
             VALUES (2, 2025, '2025-01-19', '2025-02-01', 1)",
            [],
        );
        assert!(second.is_err());
    }
}
