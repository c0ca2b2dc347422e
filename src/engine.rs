// 🏦 Stipend Engine - the single entry point used by the CLI and the server
//
// Every state-changing operation:
//   1. takes the connection lock (one writer per process)
//   2. opens a BEGIN IMMEDIATE transaction (one writer per database file)
//   3. validates, writes entries + audit events, commits
//   4. only then sends notifications
//
// A lock conflict from SQLite is retried once before it reaches the caller.

use crate::allocation::{
    self, Allocation, PortfolioTransfer, PracticeTransfer, SuspenseDistribution,
};
use crate::balance::{self, Balance, PortfolioSummary};
use crate::config::EngineConfig;
use crate::db::{self, get_events_for_entity, insert_event, setup_database, Event};
use crate::entities::portfolio::{
    all_portfolios, get_portfolio, insert_portfolio, set_portfolio_active, Portfolio,
};
use crate::entities::practice::{
    all_practices, get_practice, insert_practice, practices_in_portfolio, reassign_practice,
    set_practice_active, Practice, PracticeReassignment,
};
use crate::error::{LedgerError, Result};
use crate::export;
use crate::ledger::{self, LedgerEntry, OwnerRef};
use crate::notify::{dispatch, LogSink, Notification, NotificationSink};
use crate::periods::{self, PayPeriod, PeriodRef};
use crate::reconciliation::{ReconciliationEngine, ReconciliationReport};
use crate::remeasurement::{
    self, MetricsImportSummary, MetricsRow, OpeningBalanceImportSummary, OpeningBalanceRow,
};
use crate::workflow::{
    self, Actor, NewRequest, PeriodLine, RequestStatus, Role, StipendRequest,
};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::json;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// Roles allowed to administer the registry, the period calendar and imports
const ADMIN_ROLES: &[Role] = &[Role::Admin, Role::Finance];

pub struct StipendEngine {
    conn: Mutex<Connection>,
    config: EngineConfig,
    notifier: Arc<dyn NotificationSink>,
    reconciler: ReconciliationEngine,
}

impl StipendEngine {
    /// Open (or create) the database, apply the schema and seed configured years
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let conn = db::open(&config)?;
        setup_database(&conn)?;
        for year in &config.seed_years {
            let created = periods::seed_year(&conn, &config, *year)?;
            if created > 0 {
                info!(year, created, "seeded pay periods");
            }
        }

        info!(path = %config.database_path, "stipend ledger opened");
        Ok(StipendEngine {
            conn: Mutex::new(conn),
            reconciler: ReconciliationEngine::with_tolerance(config.cent_tolerance),
            config,
            notifier: Arc::new(LogSink),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `f` once more if it fails with a retryable error
    pub fn with_retry<T, F>(operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        match f() {
            Err(e) if e.is_retryable() => {
                warn!(operation, error = %e, "retrying after concurrency conflict");
                f()
            }
            other => other,
        }
    }

    /// One IMMEDIATE transaction, committed only if `op` succeeds
    fn write<T, F>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn(&mut Transaction<'_>, &EngineConfig) -> Result<T>,
    {
        Self::with_retry(operation, || {
            let mut conn = self.conn.lock();
            let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = op(&mut tx, &self.config)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Read-only access (also used by tests to seed fixtures)
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    fn notify(&self, notification: Notification) {
        dispatch(self.notifier.as_ref(), &notification);
    }

    fn current(&self) -> Result<PeriodRef> {
        self.with_connection(|conn| Ok(periods::current_period(conn)?.period_ref()))
    }

    // ========================================================================
    // REGISTRY
    // ========================================================================

    pub fn create_portfolio(&self, actor: &Actor, id: &str, name: &str) -> Result<Portfolio> {
        actor.require(ADMIN_ROLES, "create portfolios")?;
        let portfolio = Portfolio::new(id, name);
        self.write("create_portfolio", |tx, _| {
            insert_portfolio(tx, &portfolio)?;
            insert_event(
                tx,
                &Event::new("portfolio_created", "portfolio", &portfolio.id, json!({ "name": portfolio.name }), &actor.id),
            )
        })?;
        info!(portfolio = %portfolio.id, "portfolio created");
        Ok(portfolio)
    }

    pub fn create_practice(&self, actor: &Actor, id: &str, name: &str, portfolio_id: &str) -> Result<Practice> {
        actor.require(ADMIN_ROLES, "create practices")?;
        let practice = Practice::new(id, name, portfolio_id);
        self.write("create_practice", |tx, _| {
            insert_practice(tx, &practice)?;
            insert_event(
                tx,
                &Event::new(
                    "practice_created",
                    "practice",
                    &practice.id,
                    json!({ "name": practice.name, "portfolio_id": practice.portfolio_id }),
                    &actor.id,
                ),
            )
        })?;
        info!(practice = %practice.id, portfolio = %practice.portfolio_id, "practice created");
        Ok(practice)
    }

    pub fn set_practice_active(&self, actor: &Actor, id: &str, active: bool) -> Result<()> {
        actor.require(ADMIN_ROLES, "change practice status")?;
        self.write("set_practice_active", |tx, _| {
            set_practice_active(tx, id, active)?;
            insert_event(
                tx,
                &Event::new("practice_status_changed", "practice", id, json!({ "active": active }), &actor.id),
            )
        })
    }

    pub fn set_portfolio_active(&self, actor: &Actor, id: &str, active: bool) -> Result<()> {
        actor.require(ADMIN_ROLES, "change portfolio status")?;
        self.write("set_portfolio_active", |tx, _| {
            set_portfolio_active(tx, id, active)?;
            insert_event(
                tx,
                &Event::new("portfolio_status_changed", "portfolio", id, json!({ "active": active }), &actor.id),
            )
        })
    }

    /// Ownership change only; historical entries are untouched
    pub fn reassign_practice(&self, actor: &Actor, practice_id: &str, to_portfolio_id: &str) -> Result<PracticeReassignment> {
        actor.require(ADMIN_ROLES, "reassign practices")?;
        let record = self.write("reassign_practice", |tx, _| {
            let record = reassign_practice(tx, practice_id, to_portfolio_id, &actor.id)?;
            insert_event(
                tx,
                &Event::new(
                    "practice_reassigned",
                    "practice",
                    practice_id,
                    json!({ "from": record.from_portfolio_id, "to": record.to_portfolio_id }),
                    &actor.id,
                ),
            )?;
            Ok(record)
        })?;
        info!(practice = %practice_id, from = %record.from_portfolio_id, to = %record.to_portfolio_id, "practice reassigned");
        Ok(record)
    }

    pub fn portfolios(&self) -> Result<Vec<Portfolio>> {
        self.with_connection(all_portfolios)
    }

    pub fn portfolio(&self, id: &str) -> Result<Portfolio> {
        self.with_connection(|conn| get_portfolio(conn, id))
    }

    /// All practices, or those of one portfolio
    pub fn practices(&self, portfolio_id: Option<&str>) -> Result<Vec<Practice>> {
        self.with_connection(|conn| match portfolio_id {
            Some(id) => {
                get_portfolio(conn, id)?;
                practices_in_portfolio(conn, id)
            }
            None => all_practices(conn),
        })
    }

    pub fn practice(&self, id: &str) -> Result<Practice> {
        self.with_connection(|conn| get_practice(conn, id))
    }

    // ========================================================================
    // PAY PERIODS
    // ========================================================================

    pub fn seed_year(&self, actor: &Actor, year: i32) -> Result<usize> {
        actor.require(ADMIN_ROLES, "seed pay periods")?;
        let created = self.write("seed_year", |tx, config| periods::seed_year(tx, config, year))?;
        info!(year, created, "pay periods seeded");
        Ok(created)
    }

    /// Globally serialized switch of the current period
    pub fn set_current_period(&self, actor: &Actor, period: PeriodRef) -> Result<PayPeriod> {
        actor.require(ADMIN_ROLES, "set the current pay period")?;
        let row = self.write("set_current_period", |tx, _| {
            let row = periods::set_current(tx, period)?;
            insert_event(
                tx,
                &Event::new(
                    "current_period_set",
                    "pay_period",
                    &row.id.to_string(),
                    json!({ "period": period.period, "year": period.year }),
                    &actor.id,
                ),
            )?;
            Ok(row)
        })?;
        info!(period = %period, "current pay period set");
        Ok(row)
    }

    pub fn current_period(&self) -> Result<PayPeriod> {
        self.with_connection(periods::current_period)
    }

    pub fn periods_in_range(&self, start: PeriodRef, end: PeriodRef) -> Result<Vec<PayPeriod>> {
        self.with_connection(|conn| periods::periods_in_range(conn, start, end))
    }

    // ========================================================================
    // IMPORTS
    // ========================================================================

    pub fn import_metrics(&self, actor: &Actor, rows: &[MetricsRow]) -> Result<MetricsImportSummary> {
        self.import_metrics_batch(actor, rows, Vec::new())
    }

    /// Parse then apply; malformed lines are reported alongside row failures
    pub fn import_metrics_csv<R: Read>(&self, actor: &Actor, input: R) -> Result<MetricsImportSummary> {
        actor.require(ADMIN_ROLES, "import metrics")?;
        let (rows, parse_failures) = remeasurement::parse_metrics_csv(input)?;
        self.import_metrics_batch(actor, &rows, parse_failures)
    }

    fn import_metrics_batch(
        &self,
        actor: &Actor,
        rows: &[MetricsRow],
        parse_failures: Vec<remeasurement::RowFailure>,
    ) -> Result<MetricsImportSummary> {
        actor.require(ADMIN_ROLES, "import metrics")?;
        let summary = self.write("import_metrics", |tx, config| {
            let summary = remeasurement::apply_metrics_import(tx, config, rows, parse_failures.clone())?;
            if let Some(period) = summary.period {
                insert_event(
                    tx,
                    &Event::new(
                        "metrics_imported",
                        "pay_period",
                        &period.to_string(),
                        serde_json::to_value(&summary)?,
                        &actor.id,
                    ),
                )?;
            }
            Ok(summary)
        })?;

        info!(
            imported = summary.imported,
            opening_balances = summary.opening_balances,
            remeasurements = summary.remeasurements,
            failures = summary.failures.len(),
            "metrics import applied"
        );
        if !summary.disappeared_practices.is_empty() {
            warn!(practices = ?summary.disappeared_practices, "practices missing from this import keep their prior cap");
        }
        if !summary.practices_not_in_registry.is_empty() {
            warn!(practices = ?summary.practices_not_in_registry, "metrics for practices not in the registry");
        }
        Ok(summary)
    }

    pub fn import_opening_balances(&self, actor: &Actor, rows: &[OpeningBalanceRow]) -> Result<OpeningBalanceImportSummary> {
        actor.require(ADMIN_ROLES, "import opening balances")?;
        let summary = self.write("import_opening_balances", |tx, _| {
            let summary = remeasurement::apply_opening_balance_import(tx, rows)?;
            insert_event(
                tx,
                &Event::new(
                    "opening_balances_imported",
                    "ledger",
                    "opening_balance",
                    serde_json::to_value(&summary)?,
                    &actor.id,
                ),
            )?;
            Ok(summary)
        })?;
        info!(created = summary.created, skipped = summary.skipped, "opening balances imported");
        Ok(summary)
    }

    pub fn import_opening_balances_csv<R: Read>(&self, actor: &Actor, input: R) -> Result<OpeningBalanceImportSummary> {
        actor.require(ADMIN_ROLES, "import opening balances")?;
        let (rows, parse_failures) = remeasurement::parse_opening_balance_csv(input)?;
        let mut summary = self.import_opening_balances(actor, &rows)?;
        let mut failures = parse_failures;
        failures.append(&mut summary.failures);
        summary.failures = failures;
        Ok(summary)
    }

    // ========================================================================
    // BALANCES & LEDGER
    // ========================================================================

    /// Balance as of `as_of`, or as of the current period
    pub fn balance(&self, practice_id: &str, as_of: Option<PeriodRef>) -> Result<Balance> {
        let as_of = match as_of {
            Some(period) => period,
            None => self.current()?,
        };
        as_of.validate(self.config.periods_per_year)?;
        self.with_connection(|conn| {
            balance::compute_balance(conn, practice_id, as_of, self.config.periods_per_year)
        })
    }

    pub fn suspense_balance(&self, portfolio_id: &str) -> Result<rust_decimal::Decimal> {
        self.with_connection(|conn| balance::suspense_balance(conn, portfolio_id))
    }

    pub fn portfolio_summary(&self, portfolio_id: &str, as_of: Option<PeriodRef>) -> Result<PortfolioSummary> {
        let as_of = match as_of {
            Some(period) => period,
            None => self.current()?,
        };
        self.with_connection(|conn| {
            balance::portfolio_summary(conn, portfolio_id, as_of, self.config.periods_per_year)
        })
    }

    pub fn ledger_entries(&self, owner: &OwnerRef, year: Option<i32>) -> Result<Vec<LedgerEntry>> {
        self.with_connection(|conn| ledger::entries_for(conn, owner, year))
    }

    // ========================================================================
    // STIPEND REQUESTS
    // ========================================================================

    pub fn submit_request(&self, actor: &Actor, new: &NewRequest) -> Result<StipendRequest> {
        let request = self.write("submit_request", |tx, config| {
            workflow::submit_request(tx, config, actor, new)
        })?;
        self.notify(Notification::RequestSubmitted {
            request_id: request.id.clone(),
            practice_id: request.practice_id.clone(),
            amount: request.amount,
            requestor_email: request.requestor_email.clone(),
        });
        Ok(request)
    }

    pub fn approve_request(&self, actor: &Actor, request_id: &str, comment: Option<&str>) -> Result<StipendRequest> {
        let request = self.write("approve_request", |tx, config| {
            workflow::approve_request(tx, config, actor, request_id, comment)
        })?;
        self.notify(Notification::RequestApproved {
            request_id: request.id.clone(),
            status: request.status,
            approver_email: actor.email.clone(),
        });
        Ok(request)
    }

    pub fn reject_request(&self, actor: &Actor, request_id: &str, reason: &str) -> Result<StipendRequest> {
        let request = self.write("reject_request", |tx, _| {
            workflow::reject_request(tx, actor, request_id, reason)
        })?;
        self.notify(Notification::RequestRejected {
            request_id: request.id.clone(),
            requestor_email: request.requestor_email.clone(),
            reason: reason.trim().to_string(),
        });
        Ok(request)
    }

    pub fn cancel_period(&self, actor: &Actor, request_id: &str, period: PeriodRef) -> Result<PeriodLine> {
        self.write("cancel_period", |tx, _| {
            workflow::cancel_period(tx, actor, request_id, period)
        })
    }

    pub fn mark_period_paid(&self, actor: &Actor, request_id: &str, period: PeriodRef) -> Result<PeriodLine> {
        self.write("mark_period_paid", |tx, _| {
            workflow::mark_period_paid(tx, actor, request_id, period)
        })
    }

    pub fn delete_request(&self, actor: &Actor, request_id: &str) -> Result<()> {
        self.write("delete_request", |tx, _| workflow::delete_request(tx, actor, request_id))
    }

    pub fn request(&self, request_id: &str) -> Result<StipendRequest> {
        self.with_connection(|conn| workflow::get_request(conn, request_id))
    }

    pub fn requests(&self, practice_id: Option<&str>, status: Option<RequestStatus>) -> Result<Vec<StipendRequest>> {
        self.with_connection(|conn| workflow::list_requests(conn, practice_id, status))
    }

    pub fn request_period_lines(&self, request_id: &str) -> Result<Vec<PeriodLine>> {
        self.with_connection(|conn| {
            workflow::get_request(conn, request_id)?;
            workflow::request_period_lines(conn, request_id)
        })
    }

    // ========================================================================
    // ALLOCATIONS
    // ========================================================================

    fn allocation_done(&self, allocation: &Allocation) {
        self.notify(Notification::AllocationCompleted {
            allocation_id: allocation.id.clone(),
            kind: allocation.kind,
            total: allocation.total_amount,
        });
    }

    pub fn allocate_practice_to_practice(&self, actor: &Actor, transfer: &PracticeTransfer) -> Result<Allocation> {
        let allocation = self.write("allocate_practice_to_practice", |tx, config| {
            allocation::allocate_practice_to_practice(tx, config, actor, transfer)
        })?;
        self.allocation_done(&allocation);
        Ok(allocation)
    }

    pub fn allocate_inter_portfolio(&self, actor: &Actor, transfer: &PortfolioTransfer) -> Result<Allocation> {
        let allocation = self.write("allocate_inter_portfolio", |tx, config| {
            allocation::allocate_inter_portfolio(tx, config, actor, transfer)
        })?;
        self.allocation_done(&allocation);
        Ok(allocation)
    }

    pub fn distribute_suspense(&self, actor: &Actor, distribution: &SuspenseDistribution) -> Result<Allocation> {
        let allocation = self.write("distribute_suspense", |tx, _| {
            allocation::distribute_suspense(tx, actor, distribution)
        })?;
        self.allocation_done(&allocation);
        Ok(allocation)
    }

    pub fn allocation(&self, id: &str) -> Result<Allocation> {
        self.with_connection(|conn| allocation::get_allocation(conn, id))
    }

    pub fn allocations(&self) -> Result<Vec<Allocation>> {
        self.with_connection(allocation::list_allocations)
    }

    // ========================================================================
    // RECONCILIATION, AUDIT, EXPORT
    // ========================================================================

    pub fn reconcile_allocation(&self, id: &str) -> Result<ReconciliationReport> {
        self.with_connection(|conn| self.reconciler.reconcile_allocation(conn, id))
    }

    pub fn reconcile_owner(&self, owner: &OwnerRef, as_of: Option<PeriodRef>) -> Result<ReconciliationReport> {
        let as_of = match as_of {
            Some(period) => period,
            None => self.current()?,
        };
        self.with_connection(|conn| {
            self.reconciler
                .reconcile_owner(conn, owner, as_of, self.config.periods_per_year)
        })
    }

    pub fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        self.with_connection(|conn| get_events_for_entity(conn, entity_type, entity_id))
    }

    pub fn export_ledger<W: Write>(&self, writer: W, year: Option<i32>) -> Result<usize> {
        let entries = self.with_connection(|conn| ledger::all_entries(conn, year))?;
        export::write_ledger_csv(writer, &entries)
    }

    pub fn export_requests<W: Write>(
        &self,
        writer: W,
        practice_id: Option<&str>,
        status: Option<RequestStatus>,
    ) -> Result<usize> {
        let requests = self.requests(practice_id, status)?;
        export::write_requests_csv(writer, &requests)
    }
}

impl std::fmt::Debug for StipendEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StipendEngine")
            .field("database_path", &self.config.database_path)
            .finish_non_exhaustive()
    }
}

/// Reject unknown entity kinds early in callers that take them as strings
pub fn owner_from_parts(kind: &str, id: &str) -> Result<OwnerRef> {
    match kind {
        "practice" => Ok(OwnerRef::Practice(id.to_string())),
        "portfolio" => Ok(OwnerRef::Portfolio(id.to_string())),
        other => Err(LedgerError::validation(format!(
            "owner kind must be 'practice' or 'portfolio', got '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationLeg;
    use crate::ledger::TransactionType;
    use crate::notify::RecordingSink;
    use crate::test_support::{admin, dec, finance, lead_psm, psm, seeded_engine};
    use crate::workflow::RequestType;
    use rust_decimal::Decimal;

    fn import_cap(engine: &StipendEngine, practice: &str, period: PeriodRef, cap: &str) -> MetricsImportSummary {
        engine
            .import_metrics(&admin(), &[MetricsRow::new(practice, period, dec(cap))])
            .unwrap()
    }

    fn request(practice: &str, amount: &str, period: PeriodRef) -> NewRequest {
        NewRequest {
            practice_id: practice.to_string(),
            amount: dec(amount),
            request_type: RequestType::OneTime,
            category: "recruitment".to_string(),
            description: "Signing bonus".to_string(),
            justification: "Needed to fill an open provider slot".to_string(),
            staff_ids: None,
            effective_period: period,
            end_period: None,
        }
    }

    fn approve_through(engine: &StipendEngine, id: &str) -> StipendRequest {
        engine.approve_request(&psm(), id, None).unwrap();
        engine.approve_request(&lead_psm("PF-A"), id, None).unwrap();
        engine.approve_request(&finance(), id, Some("Approved for payroll")).unwrap()
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    #[test]
    fn test_scenario_first_import_sets_opening_balance() {
        let engine = seeded_engine();
        let summary = import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "10000");
        assert_eq!(summary.opening_balances, 1);

        let entries = engine
            .ledger_entries(&OwnerRef::Practice("P-1".into()), Some(2025))
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transaction_type, TransactionType::OpeningBalance);
        assert_eq!(entries[0].amount, dec("10000"));
        assert_eq!(engine.balance("P-1", None).unwrap().available_balance, dec("10000"));
    }

    #[test]
    fn test_scenario_next_period_remeasurement() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "10000");
        engine.set_current_period(&admin(), PeriodRef::new(2, 2025)).unwrap();
        let summary = import_cap(&engine, "P-1", PeriodRef::new(2, 2025), "12500");
        assert_eq!(summary.remeasurements, 1);

        let entries = engine
            .ledger_entries(&OwnerRef::Practice("P-1".into()), Some(2025))
            .unwrap();
        assert_eq!(entries[1].transaction_type, TransactionType::RemeasurementIncrease);
        assert_eq!(entries[1].amount, dec("2500"));
        assert_eq!(engine.balance("P-1", None).unwrap().available_balance, dec("12500"));
    }

    #[test]
    fn test_scenario_request_commitment_and_utilization() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "10000");
        engine.set_current_period(&admin(), PeriodRef::new(2, 2025)).unwrap();
        import_cap(&engine, "P-1", PeriodRef::new(2, 2025), "12500");

        let submitted = engine
            .submit_request(&psm(), &request("P-1", "3000", PeriodRef::new(3, 2025)))
            .unwrap();
        let approved = approve_through(&engine, &submitted.id);
        assert_eq!(approved.status, RequestStatus::Approved);

        let lines = engine.request_period_lines(&submitted.id).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].amount, dec("3000"));

        let balance = engine.balance("P-1", None).unwrap();
        assert_eq!(balance.stipend_committed, dec("3000"));
        assert_eq!(balance.available_balance, dec("9500"));
        assert_eq!(balance.utilization_percent, dec("24"));
    }

    #[test]
    fn test_scenario_practice_to_practice_allocation() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "5000");
        import_cap(&engine, "P-2", PeriodRef::new(1, 2025), "1000");
        let total_before: Decimal = ["P-1", "P-2"]
            .iter()
            .map(|p| engine.balance(p, None).unwrap().available_balance)
            .sum();

        let allocation = engine
            .allocate_practice_to_practice(
                &psm(),
                &PracticeTransfer {
                    donors: vec![AllocationLeg::new("P-1", dec("2000"))],
                    recipients: vec![AllocationLeg::new("P-2", dec("2000"))],
                    notes: None,
                },
            )
            .unwrap();

        let p1 = engine.balance("P-1", None).unwrap();
        let p2 = engine.balance("P-2", None).unwrap();
        assert_eq!(p1.allocated_out, dec("2000"));
        assert_eq!(p1.available_balance, dec("3000"));
        assert_eq!(p2.allocated_in, dec("2000"));
        assert_eq!(p2.available_balance, dec("3000"));
        assert_eq!(p1.available_balance + p2.available_balance, total_before);

        assert!(engine.reconcile_allocation(&allocation.id).unwrap().is_balanced());
    }

    #[test]
    fn test_scenario_inter_portfolio_and_distribution() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "6000");

        engine
            .allocate_inter_portfolio(
                &lead_psm("PF-A"),
                &PortfolioTransfer {
                    donors: vec![AllocationLeg::new("P-1", dec("5000"))],
                    recipient_portfolio_id: "PF-B".to_string(),
                    notes: Some("Coverage for southwest".to_string()),
                },
            )
            .unwrap();
        assert_eq!(engine.suspense_balance("PF-B").unwrap(), dec("5000"));

        engine
            .distribute_suspense(
                &lead_psm("PF-B"),
                &SuspenseDistribution {
                    portfolio_id: "PF-B".to_string(),
                    recipients: vec![
                        AllocationLeg::new("P-3", dec("3000")),
                        AllocationLeg::new("P-4", dec("2000")),
                    ],
                    notes: None,
                },
            )
            .unwrap();

        assert_eq!(engine.suspense_balance("PF-B").unwrap(), Decimal::ZERO);
        assert_eq!(engine.balance("P-3", None).unwrap().allocated_in, dec("3000"));
        assert_eq!(engine.balance("P-4", None).unwrap().allocated_in, dec("2000"));

        let summary = engine.portfolio_summary("PF-B", None).unwrap();
        assert_eq!(summary.total_available, dec("5000"));
        assert_eq!(summary.suspense_balance, Decimal::ZERO);
    }

    #[test]
    fn test_scenario_mark_paid_after_cancel_fails() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "5000");
        let submitted = engine
            .submit_request(&psm(), &request("P-1", "700", PeriodRef::new(2, 2025)))
            .unwrap();
        approve_through(&engine, &submitted.id);

        engine
            .cancel_period(&finance(), &submitted.id, PeriodRef::new(2, 2025))
            .unwrap();
        let result = engine.mark_period_paid(&finance(), &submitted.id, PeriodRef::new(2, 2025));
        assert!(matches!(result, Err(LedgerError::InvalidStateTransition { .. })));
    }

    // ========================================================================
    // ENGINE BEHAVIOUR
    // ========================================================================

    #[test]
    fn test_failed_final_approval_leaves_no_trace() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "1000");
        let submitted = engine
            .submit_request(&psm(), &request("P-1", "800", PeriodRef::new(2, 2025)))
            .unwrap();
        engine.approve_request(&psm(), &submitted.id, None).unwrap();
        engine.approve_request(&lead_psm("PF-A"), &submitted.id, None).unwrap();

        // Balance drained while the request waited for Finance
        engine
            .allocate_practice_to_practice(
                &psm(),
                &PracticeTransfer {
                    donors: vec![AllocationLeg::new("P-1", dec("500"))],
                    recipients: vec![AllocationLeg::new("P-2", dec("500"))],
                    notes: None,
                },
            )
            .unwrap();

        let result = engine.approve_request(&finance(), &submitted.id, None);
        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));

        let stored = engine.request(&submitted.id).unwrap();
        assert_eq!(stored.status, RequestStatus::PendingFinance);
        assert!(stored.finance_approval.is_none());
        assert!(engine.request_period_lines(&submitted.id).unwrap().is_empty());
        assert_eq!(engine.balance("P-1", None).unwrap().available_balance, dec("500"));
    }

    #[test]
    fn test_concurrent_allocations_cannot_overdraw_donor() {
        let engine = Arc::new(seeded_engine());
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "1000");
        let transfer = PracticeTransfer {
            donors: vec![AllocationLeg::new("P-1", dec("700"))],
            recipients: vec![AllocationLeg::new("P-2", dec("700"))],
            notes: None,
        };

        let results: Vec<Result<Allocation>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let engine = Arc::clone(&engine);
                    let transfer = &transfer;
                    scope.spawn(move || engine.allocate_practice_to_practice(&psm(), transfer))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(LedgerError::InsufficientBalance { .. })))
                .count(),
            1
        );
        assert_eq!(engine.balance("P-1", None).unwrap().available_balance, dec("300"));
        assert_eq!(engine.balance("P-2", None).unwrap().allocated_in, dec("700"));
        assert_eq!(engine.allocations().unwrap().len(), 1);
    }

    #[test]
    fn test_notifications_follow_commits() {
        let sink = Arc::new(RecordingSink::new());
        let engine = seeded_engine().with_notifier(sink.clone());
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "1000");

        let submitted = engine
            .submit_request(&psm(), &request("P-1", "100", PeriodRef::new(2, 2025)))
            .unwrap();
        let _ = engine.approve_request(&finance(), &submitted.id, None);
        engine
            .reject_request(&psm(), &submitted.id, "Budget moved to Q3")
            .unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Notification::RequestSubmitted { .. }));
        assert!(matches!(sent[1], Notification::RequestRejected { .. }));
    }

    #[test]
    fn test_with_retry_retries_once() {
        let mut calls = 0;
        let result = StipendEngine::with_retry("test", || {
            calls += 1;
            if calls == 1 {
                Err(LedgerError::ConcurrencyConflict("busy".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);

        let mut calls = 0;
        let result: Result<()> = StipendEngine::with_retry("test", || {
            calls += 1;
            Err(LedgerError::ConcurrencyConflict("busy".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);

        let mut calls = 0;
        let result: Result<()> = StipendEngine::with_retry("test", || {
            calls += 1;
            Err(LedgerError::validation("bad"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_admin_operations_are_gated_and_audited() {
        let engine = seeded_engine();
        assert!(matches!(
            engine.set_current_period(&psm(), PeriodRef::new(2, 2025)),
            Err(LedgerError::PermissionDenied { .. })
        ));
        assert!(matches!(
            engine.create_practice(&lead_psm("PF-A"), "P-9", "Clinic Nine", "PF-A"),
            Err(LedgerError::PermissionDenied { .. })
        ));

        engine.create_practice(&admin(), "P-9", "Clinic Nine", "PF-A").unwrap();
        engine.reassign_practice(&finance(), "P-9", "PF-B").unwrap();
        assert_eq!(engine.practice("P-9").unwrap().portfolio_id, "PF-B");
        assert_eq!(engine.practices(Some("PF-B")).unwrap().len(), 3);

        let events = engine.events_for("practice", "P-9").unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["practice_created", "practice_reassigned"]);
    }

    #[test]
    fn test_metrics_csv_with_bad_line_does_not_complete_period() {
        let engine = seeded_engine();
        let csv = "practice_id,pay_period,year,stipend_cap\nP-1,1,2025,1000\nP-2,1,2025,n/a\n";
        let summary = engine.import_metrics_csv(&admin(), csv.as_bytes()).unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.failures.len(), 1);
        assert!(!summary.remeasurement_completed);
        assert!(!engine.current_period().unwrap().remeasurement_completed);
    }

    #[test]
    fn test_opening_balance_csv_counts_as_paid() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "5000");
        let csv = "practice_id,pay_period,year,amount\nP-1,1,2025,750\nP-77,1,2025,10\n";
        let summary = engine.import_opening_balances_csv(&admin(), csv.as_bytes()).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.unknown_practices, vec!["P-77".to_string()]);

        let balance = engine.balance("P-1", None).unwrap();
        assert_eq!(balance.stipend_paid, dec("750"));
        assert_eq!(balance.available_balance, dec("4250"));
        assert_eq!(balance.utilization_percent, dec("15"));
    }

    #[test]
    fn test_exports_and_owner_reconciliation() {
        let engine = seeded_engine();
        import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "5000");
        engine
            .submit_request(&psm(), &request("P-1", "100", PeriodRef::new(2, 2025)))
            .unwrap();

        let mut ledger_csv = Vec::new();
        assert_eq!(engine.export_ledger(&mut ledger_csv, Some(2025)).unwrap(), 1);
        let mut requests_csv = Vec::new();
        assert_eq!(engine.export_requests(&mut requests_csv, Some("P-1"), None).unwrap(), 1);

        let owner = owner_from_parts("practice", "P-1").unwrap();
        assert!(engine.reconcile_owner(&owner, None).unwrap().is_balanced());
        assert!(owner_from_parts("bank", "x").is_err());
    }

    #[test]
    fn test_file_backed_engine_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::in_memory();
        config.database_path = dir.path().join("ledger.db").to_string_lossy().into_owned();
        config.seed_years = vec![2025];

        {
            let engine = StipendEngine::open(config.clone()).unwrap();
            engine.create_portfolio(&admin(), "PF-A", "Northeast").unwrap();
            engine.create_practice(&admin(), "P-1", "Clinic One", "PF-A").unwrap();
            engine.set_current_period(&admin(), PeriodRef::new(1, 2025)).unwrap();
            import_cap(&engine, "P-1", PeriodRef::new(1, 2025), "2500");
        }

        let reopened = StipendEngine::open(config).unwrap();
        assert_eq!(reopened.balance("P-1", None).unwrap().available_balance, dec("2500"));
        assert_eq!(reopened.current_period().unwrap().period, 1);
    }
}
