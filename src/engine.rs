//! Session accrual engine.
//!
//! The `engine` module turns a session's controller history into a
//! cost.  Every [`ControllerPeriod`] is priced on its own at the rate
//! in effect for its controller count, and each period's cost is
//! rounded *up* to the next whole currency unit before summing.  A
//! session with no usable history falls back to pricing the whole
//! span from `start_time` at the current controller count, which keeps
//! older records billable.
//!
//! Live quotes for a whole floor of active sessions are computed in
//! parallel with [`rayon`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ControllerPeriod, Session};
use crate::rates::RateCard;

const MS_PER_MINUTE: i64 = 60_000;
const MS_PER_HOUR: i64 = 3_600_000;

/// Cost of one priced span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodCost {
    pub controllers: u8,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub minutes: Decimal,
    pub hourly_rate: Decimal,
    pub cost: Decimal,
}

/// Result of pricing a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accrual {
    pub periods: Vec<PeriodCost>,
    pub total_cost: Decimal,
    /// True when the controller history was unusable and the whole
    /// session was priced at the current controller count.
    pub fallback: bool,
}

/// Prices a span: `ceil(minutes * rate / 60)`.  Spans of zero or
/// negative length cost nothing; any positive span at a positive rate
/// costs at least one unit.
pub fn span_cost(
    controllers: u8,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    card: &RateCard,
) -> Result<PeriodCost> {
    let hourly_rate = card.rate(controllers)?;
    let elapsed_ms = (to - from).num_milliseconds().max(0);
    let minutes = Decimal::from(elapsed_ms) / Decimal::from(MS_PER_MINUTE);
    // One division from exact milliseconds; `minutes` is display only.
    let cost = (Decimal::from(elapsed_ms) * hourly_rate / Decimal::from(MS_PER_HOUR)).ceil();
    Ok(PeriodCost {
        controllers,
        from,
        to,
        minutes,
        hourly_rate,
        cost,
    })
}

/// End of a period for pricing: its own `to`, else the session end,
/// else `now`.
fn effective_end(
    period: &ControllerPeriod,
    session: &Session,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    period.to.or(session.end_time).unwrap_or(now)
}

/// Prices a session without mutating it.
pub fn accrue(session: &Session, card: &RateCard, now: DateTime<Utc>) -> Result<Accrual> {
    let mut periods = Vec::with_capacity(session.controllers_history.len());
    for period in &session.controllers_history {
        let end = effective_end(period, session, now);
        if end < period.from {
            tracing::warn!(
                session_id = %session.id,
                from = %period.from,
                to = %end,
                "skipping controller period that ends before it starts"
            );
            continue;
        }
        periods.push(span_cost(period.controllers, period.from, end, card)?);
    }

    if periods.is_empty() {
        let end = session.end_time.unwrap_or(now);
        let whole = span_cost(session.controllers, session.start_time, end, card)?;
        let total_cost = whole.cost;
        return Ok(Accrual {
            periods: vec![whole],
            total_cost,
            fallback: true,
        });
    }

    let total_cost = periods.iter().map(|p| p.cost).sum();
    Ok(Accrual {
        periods,
        total_cost,
        fallback: false,
    })
}

/// Recomputes and stores `total_cost` and `final_cost` on the session.
pub fn calculate_cost(session: &mut Session, card: &RateCard, now: DateTime<Utc>) -> Result<Decimal> {
    let accrual = accrue(session, card, now)?;
    session.total_cost = accrual.total_cost;
    session.final_cost = accrual.total_cost - session.discount;
    if session.final_cost.is_sign_negative() {
        tracing::warn!(
            session_id = %session.id,
            total_cost = %session.total_cost,
            discount = %session.discount,
            "discount exceeds session cost"
        );
    }
    Ok(session.total_cost)
}

/// Cost for live display.  Active sessions are priced up to `now`
/// without touching the record; finished sessions report the stored
/// `total_cost`.
pub fn calculate_current_cost(session: &Session, card: &RateCard, now: DateTime<Utc>) -> Result<Decimal> {
    if !session.is_active() {
        return Ok(session.total_cost);
    }
    Ok(accrue(session, card, now)?.total_cost)
}

/// Live cost of one active session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQuote {
    pub session_id: Uuid,
    pub device_number: String,
    pub customer_name: String,
    pub controllers: u8,
    pub elapsed_minutes: i64,
    pub current_cost: Decimal,
    pub bill: Option<Uuid>,
}

/// Quotes every session in parallel.  `cards` maps device numbers to
/// rate cards; sessions whose device has no card are skipped with a
/// warning, as are sessions that fail to price.
pub fn quote_sessions(
    sessions: &[Session],
    cards: &HashMap<String, RateCard>,
    now: DateTime<Utc>,
) -> Vec<LiveQuote> {
    sessions
        .par_iter()
        .filter_map(|session| {
            let Some(card) = cards.get(&session.device.number) else {
                tracing::warn!(device = %session.device.number, "no rate card for device");
                return None;
            };
            match calculate_current_cost(session, card, now) {
                Ok(current_cost) => Some(LiveQuote {
                    session_id: session.id,
                    device_number: session.device.number.clone(),
                    customer_name: session.customer_name.clone(),
                    controllers: session.controllers,
                    elapsed_minutes: (session.end_time.unwrap_or(now) - session.start_time)
                        .num_minutes(),
                    current_cost,
                    bill: session.bill,
                }),
                Err(err) => {
                    tracing::warn!(session_id = %session.id, error = %err, "failed to quote session");
                    None
                }
            }
        })
        .collect()
}
