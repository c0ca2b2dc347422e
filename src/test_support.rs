// Shared fixtures for the inline test modules

use crate::config::EngineConfig;
use crate::db::setup_database;
use crate::engine::StipendEngine;
use crate::entities::portfolio::{insert_portfolio, Portfolio};
use crate::entities::practice::{insert_practice, Practice};
use crate::ledger::{append, NewEntry, OwnerRef, TransactionType};
use crate::periods::{seed_year, set_current, PeriodRef};
use crate::workflow::{Actor, Role};
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::str::FromStr;

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// In-memory database with:
/// - pay periods for 2025 and 2026, current = PP1'2025
/// - portfolios PF-A (P-1, P-2) and PF-B (P-3, P-4)
pub fn seeded_connection() -> (Connection, EngineConfig) {
    let conn = Connection::open_in_memory().unwrap();
    setup_database(&conn).unwrap();
    let config = EngineConfig::in_memory();
    seed_registry(&conn, &config);
    (conn, config)
}

fn seed_registry(conn: &Connection, config: &EngineConfig) {
    seed_year(conn, config, 2025).unwrap();
    seed_year(conn, config, 2026).unwrap();
    insert_portfolio(conn, &Portfolio::new("PF-A", "Northeast")).unwrap();
    insert_portfolio(conn, &Portfolio::new("PF-B", "Southwest")).unwrap();
    insert_practice(conn, &Practice::new("P-1", "Clinic One", "PF-A")).unwrap();
    insert_practice(conn, &Practice::new("P-2", "Clinic Two", "PF-A")).unwrap();
    insert_practice(conn, &Practice::new("P-3", "Clinic Three", "PF-B")).unwrap();
    insert_practice(conn, &Practice::new("P-4", "Clinic Four", "PF-B")).unwrap();
    set_current(conn, PeriodRef::new(1, 2025)).unwrap();
}

/// Give a practice a cap at the current period (PP1'2025)
pub fn grant_cap(conn: &Connection, practice_id: &str, amount: &str) {
    append(
        conn,
        &NewEntry::new(
            OwnerRef::Practice(practice_id.to_string()),
            PeriodRef::new(1, 2025),
            TransactionType::OpeningBalance,
            dec(amount),
            "test cap",
        ),
    )
    .unwrap();
}

/// Engine over the same seeded registry
pub fn seeded_engine() -> StipendEngine {
    let engine = StipendEngine::open(EngineConfig::in_memory()).unwrap();
    engine
        .with_connection(|conn| {
            seed_registry(conn, engine.config());
            Ok(())
        })
        .unwrap();
    engine
}

pub fn actor(role: Role) -> Actor {
    let id = match role {
        Role::Psm => "u-psm",
        Role::LeadPsm => "u-lead",
        Role::Finance => "u-finance",
        Role::Admin => "u-admin",
    };
    Actor::new(id, &format!("{}@example.com", id), role)
}

pub fn psm() -> Actor {
    actor(Role::Psm)
}

pub fn lead_psm(portfolio_id: &str) -> Actor {
    actor(Role::LeadPsm).in_portfolio(portfolio_id)
}

pub fn finance() -> Actor {
    actor(Role::Finance)
}

pub fn admin() -> Actor {
    actor(Role::Admin)
}
