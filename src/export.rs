// 📤 CSV Export
// Read-only projections of the ledger and of stipend requests. There is no
// import path back from these files.

use crate::error::Result;
use crate::ledger::{LedgerEntry, OwnerRef};
use crate::money::to_db;
use crate::workflow::StipendRequest;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct LedgerRow<'a> {
    id: i64,
    owner_kind: &'static str,
    owner_id: &'a str,
    period: u32,
    year: i32,
    transaction_type: &'static str,
    amount: String,
    description: &'a str,
    request_id: Option<&'a str>,
    allocation_id: Option<&'a str>,
    reverses_entry_id: Option<i64>,
    created_at: String,
}

impl<'a> From<&'a LedgerEntry> for LedgerRow<'a> {
    fn from(entry: &'a LedgerEntry) -> Self {
        let owner_kind = match entry.owner {
            OwnerRef::Practice(_) => "practice",
            OwnerRef::Portfolio(_) => "portfolio",
        };
        LedgerRow {
            id: entry.id,
            owner_kind,
            owner_id: entry.owner.id(),
            period: entry.period.period,
            year: entry.period.year,
            transaction_type: entry.transaction_type.as_str(),
            amount: to_db(entry.amount),
            description: &entry.description,
            request_id: entry.request_id.as_deref(),
            allocation_id: entry.allocation_id.as_deref(),
            reverses_entry_id: entry.reverses_entry_id,
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestRow<'a> {
    id: &'a str,
    practice_id: &'a str,
    requestor_email: &'a str,
    amount: String,
    request_type: &'static str,
    category: &'a str,
    description: &'a str,
    effective_period: u32,
    effective_year: i32,
    end_period: Option<u32>,
    end_year: Option<i32>,
    status: &'static str,
    rejection_reason: Option<&'a str>,
    created_at: String,
    updated_at: String,
}

impl<'a> From<&'a StipendRequest> for RequestRow<'a> {
    fn from(request: &'a StipendRequest) -> Self {
        RequestRow {
            id: &request.id,
            practice_id: &request.practice_id,
            requestor_email: &request.requestor_email,
            amount: to_db(request.amount),
            request_type: request.request_type.as_str(),
            category: &request.category,
            description: &request.description,
            effective_period: request.effective_period.period,
            effective_year: request.effective_period.year,
            end_period: request.end_period.map(|p| p.period),
            end_year: request.end_period.map(|p| p.year),
            status: request.status.as_str(),
            rejection_reason: request.rejection.as_ref().map(|r| r.reason.as_str()),
            created_at: request.created_at.to_rfc3339(),
            updated_at: request.updated_at.to_rfc3339(),
        }
    }
}

/// Write entries as CSV with a header row; returns the number of data rows
pub fn write_ledger_csv<W: Write>(writer: W, entries: &[LedgerEntry]) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    for entry in entries {
        wtr.serialize(LedgerRow::from(entry))?;
    }
    wtr.flush()?;
    Ok(entries.len())
}

pub fn write_requests_csv<W: Write>(writer: W, requests: &[StipendRequest]) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    for request in requests {
        wtr.serialize(RequestRow::from(request))?;
    }
    wtr.flush()?;
    Ok(requests.len())
}
