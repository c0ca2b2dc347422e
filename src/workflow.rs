// 📝 Stipend Request Workflow
//
// pending_psm → pending_lead_psm → pending_finance → approved
//      └──────────────┴─────────────────┴──────────→ rejected
//
// Role gating is a transition table, not handler conditionals. Final Finance
// approval materializes one `committed` ledger entry per requested period.
// Post-approval actions (cancel-period, mark-period-paid) act on a single
// period and append entries; nothing already written is mutated.

use crate::balance::compute_balance;
use crate::config::EngineConfig;
use crate::db::{insert_event, parse_timestamp, Event};
use crate::entities::practice::get_practice;
use crate::error::{LedgerError, Result};
use crate::ledger::{append, entries_for_request, EntryId, NewEntry, OwnerRef, TransactionType};
use crate::money::{from_db, to_db};
use crate::periods::{current_period, get_period, PeriodRef};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

// ============================================================================
// IDENTITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Psm,
    LeadPsm,
    Finance,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Psm => "psm",
            Role::LeadPsm => "lead_psm",
            Role::Finance => "finance",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LedgerError;

    /// Accepts "psm", "PSM", "Lead PSM", "lead-psm", "lead_psm", ...
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "psm" => Ok(Role::Psm),
            "lead_psm" | "leadpsm" => Ok(Role::LeadPsm),
            "finance" => Ok(Role::Finance),
            "admin" => Ok(Role::Admin),
            _ => Err(LedgerError::validation(format!("unknown role: {}", s))),
        }
    }
}

/// Authenticated caller, as supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub email: String,
    pub role: Role,
    /// Portfolio a Lead PSM is responsible for
    pub portfolio_id: Option<String>,
}

impl Actor {
    pub fn new(id: &str, email: &str, role: Role) -> Self {
        Actor {
            id: id.to_string(),
            email: email.to_string(),
            role,
            portfolio_id: None,
        }
    }

    pub fn in_portfolio(mut self, portfolio_id: &str) -> Self {
        self.portfolio_id = Some(portfolio_id.to_string());
        self
    }

    /// PermissionDenied unless the actor holds one of `allowed`
    pub fn require(&self, allowed: &[Role], action: &str) -> Result<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(LedgerError::PermissionDenied {
                role: self.role.to_string(),
                action: action.to_string(),
            })
        }
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    PendingPsm,
    PendingLeadPsm,
    PendingFinance,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::PendingPsm => "pending_psm",
            RequestStatus::PendingLeadPsm => "pending_lead_psm",
            RequestStatus::PendingFinance => "pending_finance",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Approved | RequestStatus::Rejected)
    }

    /// Role that may act on a request in this state
    pub fn gate_role(&self) -> Option<Role> {
        match self {
            RequestStatus::PendingPsm => Some(Role::Psm),
            RequestStatus::PendingLeadPsm => Some(Role::LeadPsm),
            RequestStatus::PendingFinance => Some(Role::Finance),
            RequestStatus::Approved | RequestStatus::Rejected => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending_psm" => Ok(RequestStatus::PendingPsm),
            "pending_lead_psm" => Ok(RequestStatus::PendingLeadPsm),
            "pending_finance" => Ok(RequestStatus::PendingFinance),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(LedgerError::validation(format!("unknown request status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestAction {
    Approve,
    Reject,
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestAction::Approve => f.write_str("approve"),
            RequestAction::Reject => f.write_str("reject"),
        }
    }
}

/// (state, role, action) -> next state. Everything not listed is rejected.
pub fn next_status(status: RequestStatus, role: Role, action: RequestAction) -> Result<RequestStatus> {
    use RequestStatus::*;

    match (status, role, action) {
        (PendingPsm, Role::Psm, RequestAction::Approve) => Ok(PendingLeadPsm),
        (PendingLeadPsm, Role::LeadPsm, RequestAction::Approve) => Ok(PendingFinance),
        (PendingFinance, Role::Finance, RequestAction::Approve) => Ok(Approved),
        (PendingPsm, Role::Psm, RequestAction::Reject)
        | (PendingLeadPsm, Role::LeadPsm, RequestAction::Reject)
        | (PendingFinance, Role::Finance, RequestAction::Reject) => Ok(Rejected),
        _ => Err(LedgerError::transition(
            status.as_str(),
            format!("{} as {}", action, role),
        )),
    }
}

// ============================================================================
// REQUEST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    OneTime,
    Recurring,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::OneTime => "one_time",
            RequestType::Recurring => "recurring",
        }
    }
}

impl FromStr for RequestType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "one_time" => Ok(RequestType::OneTime),
            "recurring" => Ok(RequestType::Recurring),
            other => Err(LedgerError::validation(format!("unknown request type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStamp {
    pub user_id: String,
    pub email: String,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Submission payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub practice_id: String,
    /// Per-period amount for recurring requests
    pub amount: Decimal,
    pub request_type: RequestType,
    pub category: String,
    pub description: String,
    pub justification: String,
    #[serde(default)]
    pub staff_ids: Option<String>,
    pub effective_period: PeriodRef,
    #[serde(default)]
    pub end_period: Option<PeriodRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StipendRequest {
    pub id: String,
    pub practice_id: String,
    pub requestor_id: String,
    pub requestor_email: String,
    pub amount: Decimal,
    pub request_type: RequestType,
    pub category: String,
    pub description: String,
    pub justification: String,
    pub staff_ids: Option<String>,
    pub effective_period: PeriodRef,
    pub end_period: Option<PeriodRef>,
    pub status: RequestStatus,
    pub psm_approval: Option<ApprovalStamp>,
    pub lead_psm_approval: Option<ApprovalStamp>,
    pub finance_approval: Option<ApprovalStamp>,
    pub rejection: Option<Rejection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn requested_periods(
    request_type: RequestType,
    effective: PeriodRef,
    end: Option<PeriodRef>,
    periods_per_year: u32,
) -> Vec<PeriodRef> {
    match request_type {
        RequestType::OneTime => vec![effective],
        RequestType::Recurring => effective.range_to(end.unwrap_or(effective), periods_per_year),
    }
}

impl NewRequest {
    pub fn periods(&self, periods_per_year: u32) -> Vec<PeriodRef> {
        requested_periods(self.request_type, self.effective_period, self.end_period, periods_per_year)
    }

    /// Field-level checks that need no database access
    pub fn validate(&self, config: &EngineConfig) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::validation("amount must be greater than zero"));
        }
        if self.justification.trim().chars().count() < 10 {
            return Err(LedgerError::validation(
                "justification must be at least 10 characters",
            ));
        }
        if self.description.trim().chars().count() < 5 {
            return Err(LedgerError::validation(
                "stipend description must be at least 5 characters",
            ));
        }
        if self.category == config.staff_cost_category {
            let staff = self.staff_ids.as_deref().unwrap_or("").trim();
            if staff.chars().count() < 5 {
                return Err(LedgerError::validation(
                    "staff cost requests must list staff identifiers (at least 5 characters)",
                ));
            }
        }

        self.effective_period.validate(config.periods_per_year)?;
        match (self.request_type, self.end_period) {
            (RequestType::OneTime, Some(_)) => {
                return Err(LedgerError::validation(
                    "one-time requests do not take an end period",
                ));
            }
            (RequestType::Recurring, None) => {
                return Err(LedgerError::validation("recurring requests require an end period"));
            }
            (RequestType::Recurring, Some(end)) => {
                end.validate(config.periods_per_year)?;
                if end < self.effective_period {
                    return Err(LedgerError::validation(format!(
                        "end period {} precedes effective period {}",
                        end, self.effective_period
                    )));
                }
            }
            (RequestType::OneTime, None) => {}
        }
        Ok(())
    }
}

impl StipendRequest {
    pub fn periods(&self, periods_per_year: u32) -> Vec<PeriodRef> {
        requested_periods(self.request_type, self.effective_period, self.end_period, periods_per_year)
    }

    /// Amount across every requested period
    pub fn total_amount(&self, periods_per_year: u32) -> Decimal {
        self.amount * Decimal::from(self.periods(periods_per_year).len())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let amount: String = row.get(4)?;
        let request_type: String = row.get(5)?;
        let status: String = row.get(14)?;
        let end_period: Option<u32> = row.get(12)?;
        let end_year: Option<i32> = row.get(13)?;
        let created_at: String = row.get(19)?;
        let updated_at: String = row.get(20)?;

        Ok(StipendRequest {
            id: row.get(0)?,
            practice_id: row.get(1)?,
            requestor_id: row.get(2)?,
            requestor_email: row.get(3)?,
            amount: from_db(&amount)?,
            request_type: RequestType::from_str(&request_type).map_err(|e| conversion(5, e))?,
            category: row.get(6)?,
            description: row.get(7)?,
            justification: row.get(8)?,
            staff_ids: row.get(9)?,
            effective_period: PeriodRef::new(row.get(10)?, row.get(11)?),
            end_period: match (end_period, end_year) {
                (Some(p), Some(y)) => Some(PeriodRef::new(p, y)),
                _ => None,
            },
            status: RequestStatus::from_str(&status).map_err(|e| conversion(14, e))?,
            psm_approval: json_column(row, 15)?,
            lead_psm_approval: json_column(row, 16)?,
            finance_approval: json_column(row, 17)?,
            rejection: json_column(row, 18)?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }
}

fn conversion<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(column)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion(column, e)))
        .transpose()
}

fn to_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

// ============================================================================
// PERSISTENCE
// ============================================================================

const REQUEST_COLUMNS: &str = "id, practice_id, requestor_id, requestor_email, amount, \
     request_type, category, description, justification, staff_ids, effective_period, \
     effective_year, end_period, end_year, status, psm_approval, lead_psm_approval, \
     finance_approval, rejection, created_at, updated_at";

fn insert_request(conn: &Connection, request: &StipendRequest) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO stipend_requests ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            REQUEST_COLUMNS
        ),
        params![
            request.id,
            request.practice_id,
            request.requestor_id,
            request.requestor_email,
            to_db(request.amount),
            request.request_type.as_str(),
            request.category,
            request.description,
            request.justification,
            request.staff_ids,
            request.effective_period.period,
            request.effective_period.year,
            request.end_period.map(|p| p.period),
            request.end_period.map(|p| p.year),
            request.status.as_str(),
            to_json(&request.psm_approval)?,
            to_json(&request.lead_psm_approval)?,
            to_json(&request.finance_approval)?,
            to_json(&request.rejection)?,
            request.created_at.to_rfc3339(),
            request.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Persist status and approval columns
fn save_progress(conn: &Connection, request: &StipendRequest) -> Result<()> {
    conn.execute(
        "UPDATE stipend_requests
         SET status = ?1, psm_approval = ?2, lead_psm_approval = ?3,
             finance_approval = ?4, rejection = ?5, updated_at = ?6
         WHERE id = ?7",
        params![
            request.status.as_str(),
            to_json(&request.psm_approval)?,
            to_json(&request.lead_psm_approval)?,
            to_json(&request.finance_approval)?,
            to_json(&request.rejection)?,
            request.updated_at.to_rfc3339(),
            request.id,
        ],
    )?;
    Ok(())
}

pub fn find_request(conn: &Connection, id: &str) -> Result<Option<StipendRequest>> {
    let request = conn
        .query_row(
            &format!("SELECT {} FROM stipend_requests WHERE id = ?1", REQUEST_COLUMNS),
            [id],
            StipendRequest::from_row,
        )
        .optional()?;
    Ok(request)
}

pub fn get_request(conn: &Connection, id: &str) -> Result<StipendRequest> {
    find_request(conn, id)?.ok_or_else(|| LedgerError::not_found("stipend request", id))
}

/// Requests, newest first, optionally narrowed by practice and/or status
pub fn list_requests(
    conn: &Connection,
    practice_id: Option<&str>,
    status: Option<RequestStatus>,
) -> Result<Vec<StipendRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM stipend_requests
         WHERE (?1 IS NULL OR practice_id = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at DESC, id",
        REQUEST_COLUMNS
    ))?;
    let requests = stmt
        .query_map(
            params![practice_id, status.map(|s| s.as_str())],
            StipendRequest::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(requests)
}

fn record(conn: &Connection, event_type: &str, request_id: &str, data: serde_json::Value, actor: &Actor) -> Result<()> {
    insert_event(
        conn,
        &Event::new(event_type, "stipend_request", request_id, data, &actor.id),
    )
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Create a request in `pending_psm` after validating it against the live balance
pub fn submit_request(
    conn: &Connection,
    config: &EngineConfig,
    actor: &Actor,
    new: &NewRequest,
) -> Result<StipendRequest> {
    new.validate(config)?;

    let practice = get_practice(conn, &new.practice_id)?;
    if !practice.active {
        return Err(LedgerError::validation(format!(
            "practice {} is inactive",
            practice.id
        )));
    }

    let current = current_period(conn)?.period_ref();
    if new.effective_period <= current {
        return Err(LedgerError::validation(format!(
            "effective period {} must be after the current period {}",
            new.effective_period, current
        )));
    }

    // Both ends must be registered before the range is expanded
    get_period(conn, new.effective_period)?;
    if let Some(end) = new.end_period {
        get_period(conn, end)?;
    }
    let periods = new.periods(config.periods_per_year);
    for period in &periods {
        get_period(conn, *period)?;
    }

    check_funds_by_year(conn, config, &practice.id, new.amount, &periods, current)?;

    let now = Utc::now();
    let request = StipendRequest {
        id: uuid::Uuid::new_v4().to_string(),
        practice_id: practice.id,
        requestor_id: actor.id.clone(),
        requestor_email: actor.email.clone(),
        amount: new.amount,
        request_type: new.request_type,
        category: new.category.trim().to_string(),
        description: new.description.trim().to_string(),
        justification: new.justification.trim().to_string(),
        staff_ids: new.staff_ids.as_ref().map(|s| s.trim().to_string()),
        effective_period: new.effective_period,
        end_period: new.end_period,
        status: RequestStatus::PendingPsm,
        psm_approval: None,
        lead_psm_approval: None,
        finance_approval: None,
        rejection: None,
        created_at: now,
        updated_at: now,
    };

    insert_request(conn, &request)?;
    record(
        conn,
        "request_submitted",
        &request.id,
        json!({
            "practice_id": request.practice_id,
            "amount": to_db(request.amount),
            "request_type": request.request_type.as_str(),
            "periods": periods.len(),
        }),
        actor,
    )?;

    info!(request = %request.id, practice = %request.practice_id, amount = %request.amount, "stipend request submitted");
    Ok(request)
}

/// Advance one gate. Finance approval writes the committed entries.
pub fn approve_request(
    conn: &Connection,
    config: &EngineConfig,
    actor: &Actor,
    request_id: &str,
    comment: Option<&str>,
) -> Result<StipendRequest> {
    let mut request = get_request(conn, request_id)?;
    let next = next_status(request.status, actor.role, RequestAction::Approve)?;

    let comment = comment.map(str::trim).filter(|c| !c.is_empty());
    if let Some(c) = comment {
        if c.chars().count() < 5 {
            return Err(LedgerError::validation(
                "approval comment must be at least 5 characters",
            ));
        }
    }

    let stamp = Some(ApprovalStamp {
        user_id: actor.id.clone(),
        email: actor.email.clone(),
        comment: comment.map(str::to_string),
        at: Utc::now(),
    });
    match request.status {
        RequestStatus::PendingPsm => request.psm_approval = stamp,
        RequestStatus::PendingLeadPsm => request.lead_psm_approval = stamp,
        RequestStatus::PendingFinance => request.finance_approval = stamp,
        RequestStatus::Approved | RequestStatus::Rejected => {
            return Err(LedgerError::transition(request.status.as_str(), "approve"));
        }
    }

    let mut committed = Vec::new();
    if next == RequestStatus::Approved {
        committed = materialize(conn, config, &request)?;
    }

    let from = request.status;
    request.status = next;
    request.updated_at = Utc::now();
    save_progress(conn, &request)?;
    record(
        conn,
        "request_approved",
        &request.id,
        json!({
            "from": from.as_str(),
            "to": next.as_str(),
            "role": actor.role.as_str(),
            "comment": comment,
            "committed_entries": committed,
        }),
        actor,
    )?;

    info!(request = %request.id, from = %from, to = %next, "stipend request approved");
    Ok(request)
}

/// Balances are year-scoped, so each touched year must cover its own share.
/// The current year is checked as of the current period; later years as of
/// their last period.
fn check_funds_by_year(
    conn: &Connection,
    config: &EngineConfig,
    practice_id: &str,
    amount: Decimal,
    periods: &[PeriodRef],
    current: PeriodRef,
) -> Result<()> {
    let mut by_year: BTreeMap<i32, Decimal> = BTreeMap::new();
    for period in periods {
        *by_year.entry(period.year).or_insert(Decimal::ZERO) += amount;
    }

    for (year, share) in by_year {
        let as_of = if year == current.year {
            current
        } else {
            PeriodRef::new(config.periods_per_year, year)
        };
        let balance = compute_balance(conn, practice_id, as_of, config.periods_per_year)?;
        if share > balance.available_balance {
            return Err(LedgerError::InsufficientBalance {
                owner: practice_id.to_string(),
                available: balance.available_balance,
                requested: share,
            });
        }
    }
    Ok(())
}

/// One `committed` entry per requested period, after a live balance check
fn materialize(conn: &Connection, config: &EngineConfig, request: &StipendRequest) -> Result<Vec<EntryId>> {
    let current = current_period(conn)?.period_ref();
    let periods = request.periods(config.periods_per_year);
    check_funds_by_year(conn, config, &request.practice_id, request.amount, &periods, current)?;

    let owner = OwnerRef::Practice(request.practice_id.clone());
    periods
        .into_iter()
        .map(|period| {
            append(
                conn,
                &NewEntry::new(
                    owner.clone(),
                    period,
                    TransactionType::Committed,
                    -request.amount,
                    format!("Stipend {} ({}) for {}", request.id, request.category, period),
                )
                .for_request(&request.id),
            )
        })
        .collect()
}

/// Terminal rejection from any pending state, by the gating role
pub fn reject_request(conn: &Connection, actor: &Actor, request_id: &str, reason: &str) -> Result<StipendRequest> {
    let mut request = get_request(conn, request_id)?;
    let next = next_status(request.status, actor.role, RequestAction::Reject)?;

    let reason = reason.trim();
    if reason.is_empty() {
        return Err(LedgerError::validation("a rejection reason is required"));
    }

    let from = request.status;
    request.status = next;
    request.rejection = Some(Rejection {
        user_id: actor.id.clone(),
        email: actor.email.clone(),
        role: actor.role,
        reason: reason.to_string(),
        at: Utc::now(),
    });
    request.updated_at = Utc::now();
    save_progress(conn, &request)?;
    record(
        conn,
        "request_rejected",
        &request.id,
        json!({ "from": from.as_str(), "reason": reason }),
        actor,
    )?;

    info!(request = %request.id, from = %from, "stipend request rejected");
    Ok(request)
}

/// Hard delete; only before any ledger effect is possible
pub fn delete_request(conn: &Connection, actor: &Actor, request_id: &str) -> Result<()> {
    let request = get_request(conn, request_id)?;
    if !matches!(
        request.status,
        RequestStatus::PendingPsm | RequestStatus::PendingLeadPsm
    ) {
        return Err(LedgerError::transition(request.status.as_str(), "delete"));
    }
    if actor.id != request.requestor_id && actor.role != Role::Admin {
        return Err(LedgerError::PermissionDenied {
            role: actor.role.to_string(),
            action: "delete another user's request".to_string(),
        });
    }

    conn.execute("DELETE FROM stipend_requests WHERE id = ?1", [request_id])?;
    record(
        conn,
        "request_deleted",
        request_id,
        json!({ "status": request.status.as_str(), "practice_id": request.practice_id }),
        actor,
    )?;

    info!(request = %request_id, "stipend request deleted");
    Ok(())
}

// ============================================================================
// PERIOD LINES (derived per-period status of an approved request)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodLineStatus {
    Committed,
    Paid,
    Cancelled,
}

impl PeriodLineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodLineStatus::Committed => "committed",
            PeriodLineStatus::Paid => "paid",
            PeriodLineStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodLine {
    pub request_id: String,
    pub period: PeriodRef,
    /// Positive amount committed for this period
    pub amount: Decimal,
    pub status: PeriodLineStatus,
    pub committed_entry_id: EntryId,
    pub paid_entry_id: Option<EntryId>,
    pub cancelled_entry_id: Option<EntryId>,
}

/// Status of each materialized period, derived from the request's entries
pub fn request_period_lines(conn: &Connection, request_id: &str) -> Result<Vec<PeriodLine>> {
    let entries = entries_for_request(conn, request_id)?;
    let mut lines: BTreeMap<PeriodRef, PeriodLine> = BTreeMap::new();

    // Original commitments: negative committed entries that reverse nothing
    for entry in &entries {
        if entry.transaction_type == TransactionType::Committed
            && entry.reverses_entry_id.is_none()
            && entry.amount.is_sign_negative()
        {
            lines.entry(entry.period).or_insert(PeriodLine {
                request_id: request_id.to_string(),
                period: entry.period,
                amount: -entry.amount,
                status: PeriodLineStatus::Committed,
                committed_entry_id: entry.id,
                paid_entry_id: None,
                cancelled_entry_id: None,
            });
        }
    }

    for entry in &entries {
        let Some(line) = lines.get_mut(&entry.period) else {
            continue;
        };
        match entry.transaction_type {
            TransactionType::Paid => line.paid_entry_id = Some(entry.id),
            TransactionType::Cancelled => line.cancelled_entry_id = Some(entry.id),
            _ => {}
        }
    }

    for line in lines.values_mut() {
        line.status = if line.cancelled_entry_id.is_some() {
            PeriodLineStatus::Cancelled
        } else if line.paid_entry_id.is_some() {
            PeriodLineStatus::Paid
        } else {
            PeriodLineStatus::Committed
        };
    }

    Ok(lines.into_values().collect())
}

fn approved_line(conn: &Connection, request_id: &str, period: PeriodRef, action: &str) -> Result<(StipendRequest, PeriodLine)> {
    let request = get_request(conn, request_id)?;
    if request.status != RequestStatus::Approved {
        return Err(LedgerError::transition(request.status.as_str(), action));
    }
    let line = request_period_lines(conn, request_id)?
        .into_iter()
        .find(|l| l.period == period)
        .ok_or_else(|| LedgerError::not_found("request period", format!("{} {}", request_id, period)))?;
    Ok((request, line))
}

/// Reverse one period's committed (or paid) entry. Other periods are untouched.
pub fn cancel_period(conn: &Connection, actor: &Actor, request_id: &str, period: PeriodRef) -> Result<PeriodLine> {
    actor.require(&[Role::Finance], "cancel a request period")?;
    let (request, mut line) = approved_line(conn, request_id, period, "cancel period")?;

    let target = match line.status {
        PeriodLineStatus::Committed => line.committed_entry_id,
        PeriodLineStatus::Paid => line.paid_entry_id.unwrap_or(line.committed_entry_id),
        PeriodLineStatus::Cancelled => {
            return Err(LedgerError::transition(line.status.as_str(), "cancel period"));
        }
    };

    let entry_id = append(
        conn,
        &NewEntry::new(
            OwnerRef::Practice(request.practice_id.clone()),
            period,
            TransactionType::Cancelled,
            line.amount,
            format!("Cancelled stipend {} for {}", request.id, period),
        )
        .for_request(&request.id)
        .reversing(target),
    )?;

    record(
        conn,
        "request_period_cancelled",
        &request.id,
        json!({
            "period": period.period,
            "year": period.year,
            "was": line.status.as_str(),
            "entry_id": entry_id,
        }),
        actor,
    )?;

    info!(request = %request.id, period = %period, "request period cancelled");
    line.cancelled_entry_id = Some(entry_id);
    line.status = PeriodLineStatus::Cancelled;
    Ok(line)
}

/// Reclassify one committed period as paid: a `paid` entry plus a release of
/// the commitment. Available balance is unchanged.
pub fn mark_period_paid(conn: &Connection, actor: &Actor, request_id: &str, period: PeriodRef) -> Result<PeriodLine> {
    actor.require(&[Role::Finance], "mark a request period paid")?;
    let (request, mut line) = approved_line(conn, request_id, period, "mark period paid")?;

    if line.status != PeriodLineStatus::Committed {
        return Err(LedgerError::transition(line.status.as_str(), "mark period paid"));
    }

    let owner = OwnerRef::Practice(request.practice_id.clone());
    let paid_id = append(
        conn,
        &NewEntry::new(
            owner.clone(),
            period,
            TransactionType::Paid,
            -line.amount,
            format!("Paid stipend {} for {}", request.id, period),
        )
        .for_request(&request.id),
    )?;
    append(
        conn,
        &NewEntry::new(
            owner,
            period,
            TransactionType::Committed,
            line.amount,
            format!("Commitment released on payment of stipend {}", request.id),
        )
        .for_request(&request.id)
        .reversing(line.committed_entry_id),
    )?;

    record(
        conn,
        "request_period_paid",
        &request.id,
        json!({ "period": period.period, "year": period.year, "entry_id": paid_id }),
        actor,
    )?;

    info!(request = %request.id, period = %period, "request period marked paid");
    line.paid_entry_id = Some(paid_id);
    line.status = PeriodLineStatus::Paid;
    Ok(line)
}
