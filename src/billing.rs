//! Bill aggregation.
//!
//! A bill's money fields are always derived: `subtotal` is the sum of
//! the attached sessions' `final_cost` plus the order lines, `total`
//! adds tax and takes off the bill discount, and `remaining` is what
//! is left after payments.  Callers run [`recalculate`] whenever
//! membership, a session cost, or a payment changes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{LoungeError, Result};
use crate::models::{Bill, BillStatus, Payment, Session, Table};

/// Creates an empty draft bill.
pub fn new_bill(
    bill_number: String,
    organization: &str,
    customer_name: &str,
    table: Option<Table>,
    now: DateTime<Utc>,
) -> Bill {
    Bill {
        id: Uuid::new_v4(),
        bill_number,
        organization: organization.to_string(),
        customer_name: customer_name.to_string(),
        table,
        status: BillStatus::Draft,
        subtotal: Decimal::ZERO,
        total: Decimal::ZERO,
        discount: Decimal::ZERO,
        tax: Decimal::ZERO,
        paid: Decimal::ZERO,
        remaining: Decimal::ZERO,
        sessions: Vec::new(),
        orders: Vec::new(),
        payments: Vec::new(),
        notes: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

/// Fails unless the bill can still be changed.
pub fn ensure_open(bill: &Bill) -> Result<()> {
    if bill.status.is_open() {
        Ok(())
    } else {
        Err(LoungeError::conflict(format!(
            "bill {} is {}",
            bill.bill_number,
            bill.status.as_str()
        )))
    }
}

/// Recomputes the derived money fields and payment status.  `sessions`
/// may hold more records than the bill references; only those listed
/// on the bill count, each once.
pub fn recalculate(bill: &mut Bill, sessions: &[Session]) {
    let mut counted: Vec<Uuid> = Vec::with_capacity(bill.sessions.len());
    let mut session_total = Decimal::ZERO;
    for session in sessions {
        if bill.contains_session(&session.id) && !counted.contains(&session.id) {
            counted.push(session.id);
            session_total += session.final_cost;
        }
    }
    let order_total: Decimal = bill.orders.iter().map(|o| o.amount).sum();

    bill.subtotal = session_total + order_total;
    bill.total = bill.subtotal + bill.tax - bill.discount;
    bill.remaining = bill.total - bill.paid;
    bill.status = derive_status(bill);
}

fn derive_status(bill: &Bill) -> BillStatus {
    match bill.status {
        BillStatus::Cancelled => BillStatus::Cancelled,
        _ if bill.paid > Decimal::ZERO && bill.remaining <= Decimal::ZERO => BillStatus::Paid,
        BillStatus::Overdue => BillStatus::Overdue,
        _ if bill.paid > Decimal::ZERO => BillStatus::Partial,
        _ => BillStatus::Draft,
    }
}

/// Adds a session id unless already present.  Returns whether the bill
/// changed.
pub fn attach_session(bill: &mut Bill, session_id: Uuid) -> bool {
    if bill.contains_session(&session_id) {
        false
    } else {
        bill.sessions.push(session_id);
        true
    }
}

/// Removes every occurrence of a session id.  Returns whether the bill
/// changed.
pub fn detach_session(bill: &mut Bill, session_id: &Uuid) -> bool {
    let before = bill.sessions.len();
    bill.sessions.retain(|id| id != session_id);
    bill.sessions.len() != before
}

/// Collapses repeated session ids, keeping first occurrences.  Returns
/// the number of entries dropped.
pub fn dedupe_sessions(bill: &mut Bill) -> usize {
    let before = bill.sessions.len();
    let mut seen = Vec::with_capacity(before);
    bill.sessions.retain(|id| {
        if seen.contains(id) {
            false
        } else {
            seen.push(*id);
            true
        }
    });
    before - bill.sessions.len()
}

/// Records a payment.  The amount must be positive and no more than
/// what remains.
pub fn record_payment(
    bill: &mut Bill,
    amount: Decimal,
    method: &str,
    sessions: &[Session],
    now: DateTime<Utc>,
) -> Result<()> {
    ensure_open(bill)?;
    if amount <= Decimal::ZERO {
        return Err(LoungeError::validation("payment amount must be positive"));
    }
    if method.trim().is_empty() {
        return Err(LoungeError::validation("payment method is required"));
    }
    recalculate(bill, sessions);
    if amount > bill.remaining {
        return Err(LoungeError::validation(format!(
            "payment {amount} exceeds remaining balance {}",
            bill.remaining
        )));
    }
    bill.payments.push(Payment {
        amount,
        method: method.trim().to_string(),
        paid_at: now,
    });
    bill.paid += amount;
    bill.updated_at = now;
    recalculate(bill, sessions);
    Ok(())
}

/// Sets bill-level discount and/or tax.
pub fn adjust(
    bill: &mut Bill,
    discount: Option<Decimal>,
    tax: Option<Decimal>,
    sessions: &[Session],
    now: DateTime<Utc>,
) -> Result<()> {
    ensure_open(bill)?;
    if discount.is_some_and(|d| d.is_sign_negative()) || tax.is_some_and(|t| t.is_sign_negative()) {
        return Err(LoungeError::validation("discount and tax must be non-negative"));
    }
    if let Some(discount) = discount {
        bill.discount = discount;
    }
    if let Some(tax) = tax {
        bill.tax = tax;
    }
    bill.updated_at = now;
    recalculate(bill, sessions);
    Ok(())
}

/// Folds `source` into `target`: sessions, orders, payment history,
/// notes and the amount already paid.  The caller deletes `source` and
/// recalculates `target` with the full session set.
pub fn absorb(target: &mut Bill, source: &Bill, now: DateTime<Utc>) {
    for id in &source.sessions {
        attach_session(target, *id);
    }
    target.orders.extend(source.orders.iter().cloned());
    target.payments.extend(source.payments.iter().cloned());
    target.notes.extend(source.notes.iter().cloned());
    target.notes.push(format!("Merged from bill {}", source.bill_number));
    target.paid += source.paid;
    target.updated_at = now;
}
