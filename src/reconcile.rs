//! Bill reconciliation.
//!
//! A session records the bill it belongs to, and the bill lists its
//! sessions.  The two copies can drift apart when a multi-step move is
//! interrupted, or when records predate atomic moves.  [`reconcile`]
//! walks one organisation's sessions and repairs the listing side so
//! it agrees with each session's pointer:
//!
//! 1. repeated ids inside one bill are collapsed;
//! 2. a session listed by a bill it does not point to is removed from
//!    that bill, and a bill left empty is merged into another open bill
//!    (same table first, else the newest) or deleted;
//! 3. a session missing from the bill it points to is added back.
//!
//! The pass is idempotent: a second run with no writes in between
//! changes nothing.  Failures on one bill are logged and recorded in
//! the [`ReconcileReport`]; the pass moves on to the next one.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::{absorb, attach_session, dedupe_sessions, detach_session, new_bill, recalculate};
use crate::error::{LoungeError, Result};
use crate::models::{Bill, Session};
use crate::store::{Store, WriteBatch};

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub organization: String,
    pub sessions_checked: usize,
    pub duplicates_dropped: usize,
    pub orphans_adopted: usize,
    pub removed_from_foreign_bills: usize,
    pub added_to_owning_bill: usize,
    pub bills_recreated: usize,
    pub bills_merged: usize,
    pub bills_deleted: usize,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    /// Number of repairs written to the store.
    pub fn mutations(&self) -> usize {
        self.duplicates_dropped
            + self.orphans_adopted
            + self.removed_from_foreign_bills
            + self.added_to_owning_bill
            + self.bills_recreated
            + self.bills_merged
            + self.bills_deleted
    }
}

fn newest_first(a: &&Bill, b: &&Bill) -> Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

/// Picks the open bill that should absorb `empty`: an open bill on the
/// same table if there is one, otherwise the most recently created
/// open bill of the organisation.
pub fn pick_merge_target<'b>(empty: &Bill, candidates: &'b [Bill]) -> Option<&'b Bill> {
    let open = move || {
        candidates.iter().filter(move |b| {
            b.id != empty.id && b.organization == empty.organization && b.status.is_open()
        })
    };
    if let Some(table_id) = empty.table_id() {
        let same_table: Vec<&Bill> = open().filter(|b| b.table_id() == Some(table_id)).collect();
        if same_table.len() > 1 {
            tracing::warn!(
                table_id,
                open_bills = same_table.len(),
                "several open bills on one table, using the newest"
            );
        }
        if let Some(bill) = same_table.into_iter().max_by(newest_first) {
            return Some(bill);
        }
    }
    open().max_by(newest_first)
}

/// Runs a reconciliation pass over one organisation.  Only failing to
/// load the organisation's records aborts the pass.
pub async fn reconcile(
    store: &dyn Store,
    organization: &str,
    now: DateTime<Utc>,
) -> Result<ReconcileReport> {
    let sessions = store.sessions_by_org(organization).await?;
    let mut pass = Pass {
        store,
        now,
        report: ReconcileReport {
            organization: organization.to_string(),
            ..ReconcileReport::default()
        },
        sessions,
    };

    pass.collapse_duplicates(organization).await?;
    for idx in 0..pass.sessions.len() {
        pass.report.sessions_checked += 1;
        if let Err(err) = pass.reconcile_session(idx).await {
            let session_id = pass.sessions[idx].id;
            tracing::error!(%session_id, error = %err, "failed to reconcile session");
            pass.report.errors.push(format!("session {session_id}: {err}"));
        }
    }

    if pass.report.mutations() > 0 || !pass.report.errors.is_empty() {
        tracing::info!(report = ?pass.report, "reconciliation repaired bills");
    }
    Ok(pass.report)
}

struct Pass<'a> {
    store: &'a dyn Store,
    now: DateTime<Utc>,
    report: ReconcileReport,
    sessions: Vec<Session>,
}

impl Pass<'_> {
    fn record_bill_error(&mut self, bill_id: Uuid, err: LoungeError) {
        tracing::error!(%bill_id, error = %err, "failed to repair bill");
        self.report.errors.push(format!("bill {bill_id}: {err}"));
    }

    async fn collapse_duplicates(&mut self, organization: &str) -> Result<()> {
        for mut bill in self.store.bills_by_org(organization).await? {
            let dropped = dedupe_sessions(&mut bill);
            if dropped == 0 {
                continue;
            }
            let bill_id = bill.id;
            recalculate(&mut bill, &self.sessions);
            bill.updated_at = self.now;
            match self.store.save_bill(bill).await {
                Ok(()) => self.report.duplicates_dropped += dropped,
                Err(err) => self.record_bill_error(bill_id, err.into()),
            }
        }
        Ok(())
    }

    async fn reconcile_session(&mut self, idx: usize) -> Result<()> {
        let session_id = self.sessions[idx].id;
        let organization = self.sessions[idx].organization.clone();
        let bills = self.store.bills_by_org(&organization).await?;
        let listing: Vec<&Bill> = bills.iter().filter(|b| b.contains_session(&session_id)).collect();

        let owner = match self.sessions[idx].bill {
            Some(owner) => owner,
            None => {
                let Some(adopter) = listing.iter().copied().max_by(newest_first) else {
                    return Ok(());
                };
                let mut session = self.sessions[idx].clone();
                session.bill = Some(adopter.id);
                session.updated_at = self.now;
                self.store.save_session(session.clone()).await?;
                tracing::info!(%session_id, bill_id = %adopter.id, "adopted unpointed session");
                self.sessions[idx] = session;
                self.report.orphans_adopted += 1;
                adopter.id
            }
        };

        let foreign: Vec<Uuid> = listing.iter().map(|b| b.id).filter(|id| *id != owner).collect();
        for bill_id in foreign {
            if let Err(err) = self.remove_from_foreign(bill_id, session_id).await {
                self.record_bill_error(bill_id, err);
            }
        }

        self.ensure_listed(idx, owner).await
    }

    async fn remove_from_foreign(&mut self, bill_id: Uuid, session_id: Uuid) -> Result<()> {
        let Some(mut bill) = self.store.bill(bill_id).await? else {
            return Ok(());
        };
        if !detach_session(&mut bill, &session_id) {
            return Ok(());
        }
        recalculate(&mut bill, &self.sessions);
        bill.updated_at = self.now;
        tracing::info!(%session_id, %bill_id, "removed session from foreign bill");

        let still_pointed_at = self.sessions.iter().any(|s| s.bill == Some(bill.id));
        if !bill.is_empty() || still_pointed_at {
            self.store.save_bill(bill).await?;
            self.report.removed_from_foreign_bills += 1;
            return Ok(());
        }

        let candidates = self.store.bills_by_org(&bill.organization).await?;
        let mut batch = WriteBatch::new();
        let merged = match pick_merge_target(&bill, &candidates) {
            Some(target) => {
                let mut target = target.clone();
                absorb(&mut target, &bill, self.now);
                recalculate(&mut target, &self.sessions);
                tracing::info!(source = %bill.bill_number, target = %target.bill_number, "merging empty bill");
                batch.put_bill(target);
                true
            }
            None => {
                tracing::info!(bill = %bill.bill_number, "deleting empty bill");
                false
            }
        };
        batch.delete_bill(bill.id);
        self.store.commit(batch).await?;

        self.report.removed_from_foreign_bills += 1;
        if merged {
            self.report.bills_merged += 1;
        } else {
            self.report.bills_deleted += 1;
        }
        Ok(())
    }

    async fn ensure_listed(&mut self, idx: usize, owner: Uuid) -> Result<()> {
        let session = self.sessions[idx].clone();
        match self.store.bill(owner).await? {
            Some(bill) if bill.contains_session(&session.id) => Ok(()),
            Some(mut bill) => {
                attach_session(&mut bill, session.id);
                recalculate(&mut bill, &self.sessions);
                bill.updated_at = self.now;
                self.store.save_bill(bill).await?;
                tracing::info!(session_id = %session.id, bill_id = %owner, "re-added session to its bill");
                self.report.added_to_owning_bill += 1;
                Ok(())
            }
            None => {
                let number = self.store.next_bill_number(self.now).await?;
                let mut bill = new_bill(
                    number,
                    &session.organization,
                    &session.customer_name,
                    None,
                    self.now,
                );
                bill.notes.push(format!("Recreated for session on {}", session.device.number));
                attach_session(&mut bill, session.id);
                recalculate(&mut bill, std::slice::from_ref(&session));

                let mut updated = session;
                updated.bill = Some(bill.id);
                updated.updated_at = self.now;
                tracing::warn!(
                    session_id = %updated.id,
                    missing_bill = %owner,
                    new_bill = %bill.bill_number,
                    "session pointed at a missing bill"
                );
                let mut batch = WriteBatch::new();
                batch.put_bill(bill).put_session(updated.clone());
                self.store.commit(batch).await?;
                self.sessions[idx] = updated;
                self.report.bills_recreated += 1;
                Ok(())
            }
        }
    }
}
