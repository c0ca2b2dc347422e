// ⚙️ Engine Configuration
// Loaded from a JSON file (same shape as the rule files), with env overrides.

use crate::error::{LedgerError, Result};
use crate::money::CENT;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_PATH_ENV: &str = "STIPEND_CONFIG";
pub const DB_PATH_ENV: &str = "STIPEND_DB_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file; ":memory:" for an ephemeral database
    pub database_path: String,

    /// First day of pay period 1 of `anchor_year`
    pub anchor_date: NaiveDate,
    pub anchor_year: i32,

    pub period_length_days: i64,
    pub periods_per_year: u32,

    /// Differences at or below this are treated as equal
    pub cent_tolerance: Decimal,

    /// Category whose requests must list staff identifiers
    pub staff_cost_category: String,

    /// When a practice has no cap entry yet this year, seed it from last year's
    /// running cap instead of treating the import as a first sighting
    pub carry_forward_cap_across_years: bool,

    pub busy_timeout_ms: u64,

    /// Years whose pay periods are generated on startup
    pub seed_years: Vec<i32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: "stipends.db".to_string(),
            anchor_date: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap_or_default(),
            anchor_year: 2025,
            period_length_days: 14,
            periods_per_year: 26,
            cent_tolerance: CENT,
            staff_cost_category: "staff_cost".to_string(),
            carry_forward_cap_across_years: false,
            busy_timeout_ms: 5_000,
            seed_years: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Config for tests and throwaway runs
    pub fn in_memory() -> Self {
        EngineConfig {
            database_path: ":memory:".to_string(),
            ..Default::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// `STIPEND_CONFIG` names a JSON file; `STIPEND_DB_PATH` overrides the database path
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(db_path) = std::env::var(DB_PATH_ENV) {
            config.database_path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.trim().is_empty() {
            return Err(LedgerError::Configuration(
                "database_path must not be empty".to_string(),
            ));
        }
        if self.period_length_days <= 0 {
            return Err(LedgerError::Configuration(format!(
                "period_length_days must be positive, got {}",
                self.period_length_days
            )));
        }
        if self.periods_per_year == 0 {
            return Err(LedgerError::Configuration(
                "periods_per_year must be at least 1".to_string(),
            ));
        }
        if self.cent_tolerance.is_sign_negative() {
            return Err(LedgerError::Configuration(
                "cent_tolerance must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
