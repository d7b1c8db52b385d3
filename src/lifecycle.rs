//! Session lifecycle.
//!
//! A session starts `active` and ends `completed`.  While active, the
//! controller count may change; each change closes the open
//! [`ControllerPeriod`] and opens a new one at the same instant, so
//! the history stays contiguous.  Every mutation here recomputes the
//! session cost before returning.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::engine::calculate_cost;
use crate::error::{LoungeError, Result};
use crate::models::{ControllerPeriod, Device, Session, SessionStatus};
use crate::rates::{validate_controllers, RateCard};

fn ensure_active(session: &Session, action: &str) -> Result<()> {
    if session.is_active() {
        Ok(())
    } else {
        Err(LoungeError::conflict(format!(
            "cannot {action}: session {} is {}",
            session.id,
            session.status.as_str()
        )))
    }
}

/// Rejects counts outside `[1, 4]` or above the device's capacity.
fn check_capacity(device_number: &str, capacity: u8, count: u8) -> Result<()> {
    validate_controllers(count)?;
    if count > capacity {
        return Err(LoungeError::validation(format!(
            "device {device_number} supports at most {capacity} controllers"
        )));
    }
    Ok(())
}

/// Opens a new active session on `device`.
pub fn open_session(
    device: &Device,
    organization: &str,
    customer_name: &str,
    controllers: u8,
    now: DateTime<Utc>,
) -> Result<Session> {
    check_capacity(&device.number, device.controller_capacity, controllers)?;
    let customer_name = customer_name.trim();
    if customer_name.is_empty() {
        return Err(LoungeError::validation("customer name is required"));
    }
    if organization.trim().is_empty() {
        return Err(LoungeError::validation("organization is required"));
    }

    Ok(Session {
        id: Uuid::new_v4(),
        organization: organization.to_string(),
        device: device.to_ref(),
        customer_name: customer_name.to_string(),
        start_time: now,
        end_time: None,
        status: SessionStatus::Active,
        controllers,
        controllers_history: vec![ControllerPeriod {
            controllers,
            from: now,
            to: None,
        }],
        total_cost: Decimal::ZERO,
        discount: Decimal::ZERO,
        final_cost: Decimal::ZERO,
        bill: None,
        created_at: now,
        updated_at: now,
    })
}

/// Switches an active session to `count` controllers at `now`.
/// `capacity` is the controller capacity of the session's device.
pub fn change_controllers(
    session: &mut Session,
    count: u8,
    capacity: u8,
    card: &RateCard,
    now: DateTime<Utc>,
) -> Result<()> {
    check_capacity(&session.device.number, capacity, count)?;
    ensure_active(session, "change controllers")?;

    for period in session.controllers_history.iter_mut().filter(|p| p.to.is_none()) {
        period.to = Some(now);
    }
    session.controllers_history.push(ControllerPeriod {
        controllers: count,
        from: now,
        to: None,
    });
    session.controllers = count;
    session.updated_at = now;
    calculate_cost(session, card, now)?;
    Ok(())
}

/// Ends an active session at `now`, closing every open period there.
pub fn end_session(session: &mut Session, card: &RateCard, now: DateTime<Utc>) -> Result<()> {
    ensure_active(session, "end session")?;

    session.end_time = Some(now);
    session.status = SessionStatus::Completed;
    if session.controllers_history.is_empty() {
        session.controllers_history.push(ControllerPeriod {
            controllers: session.controllers,
            from: session.start_time,
            to: Some(now),
        });
    } else {
        for period in session.controllers_history.iter_mut().filter(|p| p.to.is_none()) {
            period.to = Some(now);
        }
    }
    session.updated_at = now;
    calculate_cost(session, card, now)?;
    Ok(())
}

/// Moves the start of a session.  The first period moves with it, so
/// the new start must fall before that period's end (or before the
/// session end / `now` when the period is still open).
pub fn correct_start_time(
    session: &mut Session,
    new_start: DateTime<Utc>,
    card: &RateCard,
    now: DateTime<Utc>,
) -> Result<()> {
    if session.status == SessionStatus::Cancelled {
        return Err(LoungeError::conflict(format!(
            "cannot correct start time: session {} is cancelled",
            session.id
        )));
    }
    let limit = session
        .controllers_history
        .first()
        .and_then(|p| p.to)
        .or(session.end_time)
        .unwrap_or(now);
    if new_start >= limit {
        return Err(LoungeError::validation(format!(
            "start time {new_start} must be before {limit}"
        )));
    }

    session.start_time = new_start;
    if let Some(first) = session.controllers_history.first_mut() {
        first.from = new_start;
    }
    session.updated_at = now;
    calculate_cost(session, card, now)?;
    Ok(())
}

/// Sets the session discount.  Must be non-negative; a discount above
/// the current total is accepted but logged.
pub fn apply_discount(
    session: &mut Session,
    discount: Decimal,
    card: &RateCard,
    now: DateTime<Utc>,
) -> Result<()> {
    if discount.is_sign_negative() {
        return Err(LoungeError::validation("discount must be non-negative"));
    }
    if session.status == SessionStatus::Cancelled {
        return Err(LoungeError::conflict(format!(
            "cannot discount cancelled session {}",
            session.id
        )));
    }
    session.discount = discount;
    session.updated_at = now;
    calculate_cost(session, card, now)?;
    Ok(())
}
