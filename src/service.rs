//! Session and bill operations.
//!
//! [`LoungeService`] is the entry point for everything a request can
//! do: start and end sessions, change controllers, move sessions
//! between bills and tables, take payments, and trigger
//! reconciliation.  Each operation validates first, then builds one
//! [`WriteBatch`] and commits it, so a rejected request writes nothing
//! and a session move is never half applied.  Notifications and device
//! status updates happen after the commit and never fail the request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::{self, absorb, attach_session, detach_session, ensure_open, new_bill, recalculate};
use crate::engine::{calculate_current_cost, quote_sessions, LiveQuote};
use crate::error::{LoungeError, Result};
use crate::lifecycle;
use crate::models::{Bill, BillSummary, Device, DeviceStatus, Session, SessionStatus, Table};
use crate::notify::{dispatch, Notification, Notifier};
use crate::rates::{validate_controllers, RateCard, RateTable, MAX_CONTROLLERS};
use crate::reconcile::{self, ReconcileReport};
use crate::store::{Store, WriteBatch};
use crate::tables::TableRegistry;

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// Response of every successful operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill: Option<BillSummary>,
}

impl Outcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            session: None,
            bill: None,
        }
    }

    fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    fn with_bill(mut self, bill: &Bill) -> Self {
        self.bill = Some(BillSummary::from(bill));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub organization: String,
    pub device_number: String,
    pub customer_name: String,
    pub controllers: u8,
    /// Join the open bill on this table (or open one there).
    #[serde(default)]
    pub table_id: Option<String>,
    /// Join this bill.  Takes precedence over `table_id`.
    #[serde(default)]
    pub bill_id: Option<Uuid>,
}

/// Live cost of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostView {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub current_cost: Decimal,
    pub discount: Decimal,
    pub current_final_cost: Decimal,
}

pub struct LoungeService {
    store: Arc<dyn Store>,
    rates: RateTable,
    notifier: Arc<dyn Notifier>,
    tables: Arc<dyn TableRegistry>,
    clock: Arc<dyn Clock>,
    reconcile_after_moves: bool,
}

impl LoungeService {
    pub fn new(
        store: Arc<dyn Store>,
        rates: RateTable,
        notifier: Arc<dyn Notifier>,
        tables: Arc<dyn TableRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            rates,
            notifier,
            tables,
            clock,
            reconcile_after_moves: true,
        }
    }

    pub fn with_reconcile_after_moves(mut self, enabled: bool) -> Self {
        self.reconcile_after_moves = enabled;
        self
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.store.devices().await?)
    }

    async fn load_session(&self, id: Uuid) -> Result<Session> {
        self.store
            .session(id)
            .await?
            .ok_or_else(|| LoungeError::not_found("Session", id))
    }

    async fn load_bill(&self, id: Uuid) -> Result<Bill> {
        self.store
            .bill(id)
            .await?
            .ok_or_else(|| LoungeError::not_found("Bill", id))
    }

    fn resolve_table(&self, id: &str) -> Result<Table> {
        self.tables
            .table(id)
            .ok_or_else(|| LoungeError::not_found("Table", id))
    }

    async fn rate_card(&self, session: &Session) -> Result<RateCard> {
        let device = self.store.device_by_number(&session.device.number).await?;
        Ok(self.rates.resolve(device.as_ref(), session.device.device_type))
    }

    /// Controller capacity of the session's device, or the maximum
    /// when the device record is gone.
    async fn controller_capacity(&self, session: &Session) -> Result<u8> {
        let device = self.store.device_by_number(&session.device.number).await?;
        Ok(device.map_or(MAX_CONTROLLERS, |d| d.controller_capacity))
    }

    /// Sessions listed on `bill`, with `changed` standing in for its
    /// stored copy.
    async fn bill_sessions(&self, bill: &Bill, changed: Option<&Session>) -> Result<Vec<Session>> {
        let mut sessions = Vec::with_capacity(bill.sessions.len());
        for id in &bill.sessions {
            match changed {
                Some(session) if session.id == *id => sessions.push(session.clone()),
                _ => {
                    if let Some(session) = self.store.session(*id).await? {
                        sessions.push(session);
                    }
                }
            }
        }
        Ok(sessions)
    }

    /// Queues `session` and its recalculated bill.
    async fn stage_session(&self, batch: &mut WriteBatch, session: &Session) -> Result<Option<Bill>> {
        batch.put_session(session.clone());
        let Some(bill_id) = session.bill else {
            return Ok(None);
        };
        let Some(mut bill) = self.store.bill(bill_id).await? else {
            tracing::warn!(session_id = %session.id, %bill_id, "session points at a missing bill");
            return Ok(None);
        };
        let sessions = self.bill_sessions(&bill, Some(session)).await?;
        recalculate(&mut bill, &sessions);
        bill.updated_at = session.updated_at;
        batch.put_bill(bill.clone());
        Ok(Some(bill))
    }

    async fn set_device_status(&self, device_number: &str, status: DeviceStatus) {
        match self.store.device_by_number(device_number).await {
            Ok(Some(mut device)) => {
                device.status = status;
                if let Err(err) = self.store.save_device(device).await {
                    tracing::warn!(device = device_number, error = %err, "failed to update device status");
                }
            }
            Ok(None) => tracing::warn!(device = device_number, "device vanished before status update"),
            Err(err) => tracing::warn!(device = device_number, error = %err, "failed to load device for status update"),
        }
    }

    async fn open_table_bill(&self, organization: &str, table_id: &str) -> Result<Option<Bill>> {
        let bills = self.store.open_bills_for_table(organization, table_id).await?;
        if bills.len() > 1 {
            tracing::warn!(
                organization,
                table_id,
                open_bills = bills.len(),
                "several open bills on one table, using the newest"
            );
        }
        Ok(bills.into_iter().next())
    }

    async fn draft_bill(
        &self,
        organization: &str,
        customer_name: &str,
        table: Option<Table>,
        now: DateTime<Utc>,
    ) -> Result<Bill> {
        let number = self.store.next_bill_number(now).await?;
        Ok(new_bill(number, organization, customer_name, table, now))
    }

    pub async fn start_session(&self, request: StartSession) -> Result<Outcome> {
        validate_controllers(request.controllers)?;
        let now = self.clock.now();

        let device = self
            .store
            .device_by_number(&request.device_number)
            .await?
            .ok_or_else(|| LoungeError::not_found("Device", &request.device_number))?;
        if device.status == DeviceStatus::Maintenance {
            return Err(LoungeError::conflict(format!(
                "device {} is under maintenance",
                device.number
            )));
        }
        if let Some(existing) = self.store.active_session_for_device(&device.number).await? {
            return Err(LoungeError::conflict(format!(
                "device {} is already in use by session {}",
                device.number, existing.id
            )));
        }

        let mut session = lifecycle::open_session(
            &device,
            &request.organization,
            &request.customer_name,
            request.controllers,
            now,
        )?;

        let mut bill = match (request.bill_id, request.table_id.as_deref()) {
            (Some(bill_id), _) => {
                let bill = self.load_bill(bill_id).await?;
                if bill.organization != session.organization {
                    return Err(LoungeError::validation("bill belongs to another organization"));
                }
                ensure_open(&bill)?;
                bill
            }
            (None, Some(table_id)) => {
                let table = self.resolve_table(table_id)?;
                match self.open_table_bill(&session.organization, table_id).await? {
                    Some(bill) => bill,
                    None => {
                        self.draft_bill(&session.organization, &session.customer_name, Some(table), now)
                            .await?
                    }
                }
            }
            (None, None) => {
                self.draft_bill(&session.organization, &session.customer_name, None, now)
                    .await?
            }
        };

        session.bill = Some(bill.id);
        attach_session(&mut bill, session.id);
        let sessions = self.bill_sessions(&bill, Some(&session)).await?;
        recalculate(&mut bill, &sessions);
        bill.updated_at = now;

        let mut batch = WriteBatch::new();
        batch.put_session(session.clone()).put_bill(bill.clone());
        self.store.commit(batch).await?;
        tracing::info!(
            session_id = %session.id,
            device = %session.device.number,
            bill = %bill.bill_number,
            "session started"
        );

        self.set_device_status(&device.number, DeviceStatus::Busy).await;
        dispatch(
            self.notifier.as_ref(),
            &session.organization,
            Notification::SessionStarted {
                session_id: session.id,
                device_number: session.device.number.clone(),
                customer_name: session.customer_name.clone(),
            },
        )
        .await;

        Ok(Outcome::ok(format!("Session started on {}", device.number))
            .with_session(session)
            .with_bill(&bill))
    }

    pub async fn update_controllers(&self, session_id: Uuid, controllers: u8) -> Result<Outcome> {
        validate_controllers(controllers)?;
        let now = self.clock.now();
        let mut session = self.load_session(session_id).await?;
        let capacity = self.controller_capacity(&session).await?;
        let card = self.rate_card(&session).await?;
        lifecycle::change_controllers(&mut session, controllers, capacity, &card, now)?;

        let mut batch = WriteBatch::new();
        let bill = self.stage_session(&mut batch, &session).await?;
        self.store.commit(batch).await?;
        tracing::info!(%session_id, controllers, "controllers updated");

        let outcome = Outcome::ok(format!("Controllers set to {controllers}")).with_session(session);
        Ok(match bill {
            Some(bill) => outcome.with_bill(&bill),
            None => outcome,
        })
    }

    pub async fn end_session(&self, session_id: Uuid) -> Result<Outcome> {
        let now = self.clock.now();
        let mut session = self.load_session(session_id).await?;
        let card = self.rate_card(&session).await?;
        lifecycle::end_session(&mut session, &card, now)?;

        let mut batch = WriteBatch::new();
        let bill = self.stage_session(&mut batch, &session).await?;
        self.store.commit(batch).await?;
        tracing::info!(%session_id, final_cost = %session.final_cost, "session ended");

        self.set_device_status(&session.device.number, DeviceStatus::Available)
            .await;
        dispatch(
            self.notifier.as_ref(),
            &session.organization,
            Notification::SessionEnded {
                session_id,
                device_number: session.device.number.clone(),
                final_cost: session.final_cost,
            },
        )
        .await;

        let outcome = Outcome::ok(format!("Session ended, total {}", session.final_cost))
            .with_session(session);
        Ok(match bill {
            Some(bill) => outcome.with_bill(&bill),
            None => outcome,
        })
    }

    pub async fn correct_start_time(&self, session_id: Uuid, start: DateTime<Utc>) -> Result<Outcome> {
        let now = self.clock.now();
        let mut session = self.load_session(session_id).await?;
        let card = self.rate_card(&session).await?;
        lifecycle::correct_start_time(&mut session, start, &card, now)?;

        let mut batch = WriteBatch::new();
        let bill = self.stage_session(&mut batch, &session).await?;
        self.store.commit(batch).await?;

        let outcome = Outcome::ok("Start time corrected").with_session(session);
        Ok(match bill {
            Some(bill) => outcome.with_bill(&bill),
            None => outcome,
        })
    }

    pub async fn set_session_discount(&self, session_id: Uuid, discount: Decimal) -> Result<Outcome> {
        let now = self.clock.now();
        let mut session = self.load_session(session_id).await?;
        let card = self.rate_card(&session).await?;
        lifecycle::apply_discount(&mut session, discount, &card, now)?;

        let mut batch = WriteBatch::new();
        let bill = self.stage_session(&mut batch, &session).await?;
        self.store.commit(batch).await?;

        let outcome = Outcome::ok(format!("Discount set to {discount}")).with_session(session);
        Ok(match bill {
            Some(bill) => outcome.with_bill(&bill),
            None => outcome,
        })
    }

    pub async fn session_cost(&self, session_id: Uuid) -> Result<CostView> {
        let session = self.load_session(session_id).await?;
        let card = self.rate_card(&session).await?;
        let current_cost = calculate_current_cost(&session, &card, self.clock.now())?;
        Ok(CostView {
            session_id,
            status: session.status,
            current_cost,
            discount: session.discount,
            current_final_cost: current_cost - session.discount,
        })
    }

    /// Live quotes for every active session of an organisation.
    pub async fn live_board(&self, organization: &str) -> Result<Vec<LiveQuote>> {
        let active: Vec<Session> = self
            .store
            .sessions_by_org(organization)
            .await?
            .into_iter()
            .filter(Session::is_active)
            .collect();
        let mut cards: HashMap<String, RateCard> = HashMap::new();
        for session in &active {
            if !cards.contains_key(&session.device.number) {
                let card = self.rate_card(session).await?;
                cards.insert(session.device.number.clone(), card);
            }
        }
        Ok(quote_sessions(&active, &cards, self.clock.now()))
    }

    /// Moves `session` onto `target` in one batch.  The source bill is
    /// recalculated, or folded into `target` and deleted when the move
    /// empties it.
    async fn relocate(&self, mut session: Session, mut target: Bill) -> Result<(Session, Bill)> {
        if session.bill == Some(target.id) {
            return Err(LoungeError::conflict(format!(
                "session is already on bill {}",
                target.bill_number
            )));
        }
        if target.organization != session.organization {
            return Err(LoungeError::validation("bill belongs to another organization"));
        }
        ensure_open(&target)?;

        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        let source = match session.bill {
            Some(id) => self.store.bill(id).await?,
            None => None,
        };

        session.bill = Some(target.id);
        session.updated_at = now;
        attach_session(&mut target, session.id);

        if let Some(mut source) = source {
            detach_session(&mut source, &session.id);
            source.updated_at = now;
            if source.is_empty() {
                if !source.payments.is_empty() || !source.notes.is_empty() || !source.paid.is_zero() {
                    absorb(&mut target, &source, now);
                }
                tracing::info!(bill = %source.bill_number, "source bill emptied by move");
                batch.delete_bill(source.id);
            } else {
                let sessions = self.bill_sessions(&source, None).await?;
                recalculate(&mut source, &sessions);
                batch.put_bill(source);
            }
        }

        let sessions = self.bill_sessions(&target, Some(&session)).await?;
        recalculate(&mut target, &sessions);
        target.updated_at = now;
        batch.put_session(session.clone()).put_bill(target.clone());
        self.store.commit(batch).await?;
        tracing::info!(session_id = %session.id, bill = %target.bill_number, "session moved");

        self.after_move(&session.organization).await;
        Ok((session, target))
    }

    async fn after_move(&self, organization: &str) {
        if !self.reconcile_after_moves {
            return;
        }
        if let Err(err) = reconcile::reconcile(self.store.as_ref(), organization, self.clock.now()).await {
            tracing::warn!(organization, error = %err, "post-move reconciliation failed");
        }
    }

    pub async fn move_session_to_bill(&self, session_id: Uuid, bill_id: Uuid) -> Result<Outcome> {
        let session = self.load_session(session_id).await?;
        let target = self.load_bill(bill_id).await?;
        let (session, target) = self.relocate(session, target).await?;
        Ok(Outcome::ok(format!("Session moved to bill {}", target.bill_number))
            .with_session(session)
            .with_bill(&target))
    }

    pub async fn link_session_to_table(&self, session_id: Uuid, table_id: &str) -> Result<Outcome> {
        let session = self.load_session(session_id).await?;
        let table = self.resolve_table(table_id)?;
        if let Some(current) = session.bill {
            if let Some(bill) = self.store.bill(current).await? {
                if bill.table_id() == Some(table_id) {
                    return Err(LoungeError::conflict(format!(
                        "session is already linked to table {}",
                        table.number
                    )));
                }
            }
        }

        let target = match self.open_table_bill(&session.organization, table_id).await? {
            Some(bill) => bill,
            None => {
                let mut bill = self
                    .draft_bill(
                        &session.organization,
                        &session.customer_name,
                        Some(table.clone()),
                        self.clock.now(),
                    )
                    .await?;
                bill.notes.push(format!("Opened for table {}", table.number));
                bill
            }
        };
        let (session, target) = self.relocate(session, target).await?;

        dispatch(
            self.notifier.as_ref(),
            &session.organization,
            Notification::TableLinked {
                session_id,
                bill_id: target.id,
                table_number: table.number.clone(),
            },
        )
        .await;
        Ok(Outcome::ok(format!("Session linked to table {}", table.number))
            .with_session(session)
            .with_bill(&target))
    }

    pub async fn unlink_session_from_table(&self, session_id: Uuid) -> Result<Outcome> {
        let session = self.load_session(session_id).await?;
        let table = match session.bill {
            Some(bill_id) => self.store.bill(bill_id).await?.and_then(|b| b.table),
            None => None,
        };
        let Some(table) = table else {
            return Err(LoungeError::conflict("session is not linked to a table"));
        };

        let target = self
            .draft_bill(
                &session.organization,
                &session.customer_name,
                None,
                self.clock.now(),
            )
            .await?;
        let (session, target) = self.relocate(session, target).await?;

        dispatch(
            self.notifier.as_ref(),
            &session.organization,
            Notification::TableUnlinked {
                session_id,
                bill_id: target.id,
                table_number: table.number.clone(),
            },
        )
        .await;
        Ok(Outcome::ok(format!("Session unlinked from table {}", table.number))
            .with_session(session)
            .with_bill(&target))
    }

    /// Folds `source_id` into `target_id` and deletes the source.
    pub async fn merge_bills(&self, source_id: Uuid, target_id: Uuid) -> Result<Outcome> {
        if source_id == target_id {
            return Err(LoungeError::validation("cannot merge a bill into itself"));
        }
        let source = self.load_bill(source_id).await?;
        let mut target = self.load_bill(target_id).await?;
        if source.organization != target.organization {
            return Err(LoungeError::validation("bills belong to different organizations"));
        }
        ensure_open(&source)?;
        ensure_open(&target)?;

        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        let mut moved = Vec::with_capacity(source.sessions.len());
        for id in &source.sessions {
            if let Some(mut session) = self.store.session(*id).await? {
                session.bill = Some(target.id);
                session.updated_at = now;
                moved.push(session);
            }
        }
        absorb(&mut target, &source, now);

        let mut sessions = self.bill_sessions(&target, None).await?;
        for session in &moved {
            sessions.retain(|s| s.id != session.id);
            sessions.push(session.clone());
            batch.put_session(session.clone());
        }
        recalculate(&mut target, &sessions);
        batch.put_bill(target.clone()).delete_bill(source.id);
        self.store.commit(batch).await?;
        tracing::info!(source = %source.bill_number, target = %target.bill_number, "bills merged");

        self.after_move(&target.organization).await;
        Ok(Outcome::ok(format!(
            "Bill {} merged into {}",
            source.bill_number, target.bill_number
        ))
        .with_bill(&target))
    }

    pub async fn record_payment(&self, bill_id: Uuid, amount: Decimal, method: &str) -> Result<Outcome> {
        let mut bill = self.load_bill(bill_id).await?;
        let sessions = self.bill_sessions(&bill, None).await?;
        billing::record_payment(&mut bill, amount, method, &sessions, self.clock.now())?;
        self.store.save_bill(bill.clone()).await?;
        tracing::info!(bill = %bill.bill_number, %amount, status = bill.status.as_str(), "payment recorded");
        Ok(Outcome::ok(format!("Payment of {amount} recorded")).with_bill(&bill))
    }

    pub async fn adjust_bill(
        &self,
        bill_id: Uuid,
        discount: Option<Decimal>,
        tax: Option<Decimal>,
    ) -> Result<Outcome> {
        let mut bill = self.load_bill(bill_id).await?;
        let sessions = self.bill_sessions(&bill, None).await?;
        billing::adjust(&mut bill, discount, tax, &sessions, self.clock.now())?;
        self.store.save_bill(bill.clone()).await?;
        Ok(Outcome::ok("Bill adjusted").with_bill(&bill))
    }

    pub async fn reconcile(&self, organization: &str) -> Result<ReconcileReport> {
        reconcile::reconcile(self.store.as_ref(), organization, self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{ps_card, t0};
    use crate::models::{BillStatus, DeviceType};
    use crate::notify::LogNotifier;
    use crate::store::InMemoryStore;
    use crate::tables::StaticTableRegistry;
    use async_trait::async_trait;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn device(number: &str) -> Device {
        Device {
            id: format!("dev-{number}"),
            number: number.into(),
            name: format!("PS5 {number}"),
            device_type: DeviceType::Playstation,
            controller_capacity: 4,
            rates: ps_card(),
            status: DeviceStatus::Available,
        }
    }

    fn tables() -> StaticTableRegistry {
        StaticTableRegistry::new([
            Table {
                id: "t-1".into(),
                number: "1".into(),
            },
            Table {
                id: "t-2".into(),
                number: "2".into(),
            },
        ])
    }

    struct Harness {
        service: LoungeService,
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
    }

    fn harness_with(notifier: Arc<dyn Notifier>) -> Harness {
        let store = Arc::new(InMemoryStore::with_devices([device("PS01"), device("PS02")]));
        let clock = Arc::new(FixedClock::new(t0()));
        let service = LoungeService::new(
            store.clone(),
            RateTable::default(),
            notifier,
            Arc::new(tables()),
            clock.clone(),
        );
        Harness {
            service,
            store,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(LogNotifier))
    }

    fn start(device_number: &str, controllers: u8) -> StartSession {
        StartSession {
            organization: "org-1".into(),
            device_number: device_number.into(),
            customer_name: "Sam".into(),
            controllers,
            table_id: None,
            bill_id: None,
        }
    }

    #[tokio::test]
    async fn start_session_opens_draft_bill_and_marks_device_busy() {
        let h = harness();
        let outcome = h.service.start_session(start("PS01", 2)).await.unwrap();
        assert!(outcome.success);
        let session = outcome.session.unwrap();
        let summary = outcome.bill.unwrap();
        assert_eq!(session.bill, Some(summary.id));
        assert_eq!(summary.status, BillStatus::Draft);
        assert_eq!(summary.session_count, 1);

        let device = h.store.device_by_number("PS01").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Busy);
    }

    #[tokio::test]
    async fn lists_devices_by_number() {
        let h = harness();
        let numbers: Vec<String> = h
            .service
            .devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.number)
            .collect();
        assert_eq!(numbers, vec!["PS01".to_string(), "PS02".to_string()]);
    }

    #[tokio::test]
    async fn device_in_use_is_rejected_before_any_write() {
        let h = harness();
        h.service.start_session(start("PS01", 2)).await.unwrap();
        let bills_before = h.store.bills_by_org("org-1").await.unwrap().len();

        let err = h.service.start_session(start("PS01", 1)).await.unwrap_err();
        assert!(matches!(err, LoungeError::StateConflict(_)));
        assert_eq!(h.store.sessions_by_org("org-1").await.unwrap().len(), 1);
        assert_eq!(h.store.bills_by_org("org-1").await.unwrap().len(), bills_before);
    }

    #[tokio::test]
    async fn start_session_errors_are_categorised() {
        let h = harness();
        assert!(matches!(
            h.service.start_session(start("PS01", 7)).await,
            Err(LoungeError::Validation(_))
        ));
        assert!(matches!(
            h.service.start_session(start("PS77", 2)).await,
            Err(LoungeError::NotFound { .. })
        ));
        let mut req = start("PS01", 2);
        req.table_id = Some("t-9".into());
        assert!(matches!(
            h.service.start_session(req).await,
            Err(LoungeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn sessions_on_one_table_share_a_bill() {
        let h = harness();
        let mut a = start("PS01", 2);
        a.table_id = Some("t-1".into());
        let mut b = start("PS02", 4);
        b.table_id = Some("t-1".into());
        let first = h.service.start_session(a).await.unwrap().bill.unwrap();
        let second = h.service.start_session(b).await.unwrap().bill.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.session_count, 2);
        assert_eq!(second.table_number.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn controller_change_and_end_update_session_and_bill() {
        let h = harness();
        let started = h.service.start_session(start("PS01", 2)).await.unwrap();
        let id = started.session.unwrap().id;

        h.clock.advance(Duration::hours(1));
        let changed = h.service.update_controllers(id, 4).await.unwrap();
        let session = changed.session.unwrap();
        assert_eq!(session.controllers_history.len(), 2);
        assert_eq!(changed.bill.unwrap().subtotal, dec!(20));

        h.clock.advance(Duration::hours(1));
        let ended = h.service.end_session(id).await.unwrap();
        let session = ended.session.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.total_cost, dec!(50));
        let bill = ended.bill.unwrap();
        assert_eq!(bill.total, dec!(50));
        assert_eq!(bill.remaining, dec!(50));

        let device = h.store.device_by_number("PS01").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Available);

        assert!(matches!(
            h.service.update_controllers(id, 3).await,
            Err(LoungeError::StateConflict(_))
        ));
        assert!(matches!(
            h.service.end_session(id).await,
            Err(LoungeError::StateConflict(_))
        ));
    }

    #[tokio::test]
    async fn controller_change_above_capacity_is_rejected() {
        let h = harness();
        let mut small = device("PS02");
        small.controller_capacity = 2;
        h.store.save_device(small).await.unwrap();
        let id = h.service.start_session(start("PS02", 2)).await.unwrap().session.unwrap().id;

        assert!(matches!(
            h.service.update_controllers(id, 4).await,
            Err(LoungeError::Validation(_))
        ));
        let stored = h.store.session(id).await.unwrap().unwrap();
        assert_eq!(stored.controllers, 2);
        assert_eq!(stored.controllers_history.len(), 1);
    }

    #[tokio::test]
    async fn live_cost_and_board() {
        let h = harness();
        let id = h.service.start_session(start("PS01", 2)).await.unwrap().session.unwrap().id;
        h.service.start_session(start("PS02", 4)).await.unwrap();
        h.clock.advance(Duration::minutes(30));

        let cost = h.service.session_cost(id).await.unwrap();
        assert_eq!(cost.current_cost, dec!(10));
        let stored = h.store.session(id).await.unwrap().unwrap();
        assert_eq!(stored.total_cost, dec!(0));

        let board = h.service.live_board("org-1").await.unwrap();
        let total: Decimal = board.iter().map(|q| q.current_cost).sum();
        assert_eq!(board.len(), 2);
        assert_eq!(total, dec!(25));
    }

    #[tokio::test]
    async fn discount_and_start_correction_flow_into_bill() {
        let h = harness();
        let id = h.service.start_session(start("PS01", 2)).await.unwrap().session.unwrap().id;
        h.clock.advance(Duration::hours(1));
        h.service.correct_start_time(id, t0() - Duration::hours(1)).await.unwrap();
        let outcome = h.service.set_session_discount(id, dec!(5)).await.unwrap();
        let session = outcome.session.unwrap();
        assert_eq!(session.total_cost, dec!(40));
        assert_eq!(session.final_cost, dec!(35));
        assert_eq!(outcome.bill.unwrap().subtotal, dec!(35));
    }

    #[tokio::test]
    async fn linking_to_table_moves_session_and_drops_empty_bill() {
        let h = harness();
        let mut on_table = start("PS01", 2);
        on_table.table_id = Some("t-1".into());
        let table_bill = h.service.start_session(on_table).await.unwrap().bill.unwrap();
        let walk_in = h.service.start_session(start("PS02", 2)).await.unwrap();
        let walk_in_bill = walk_in.bill.unwrap();
        let id = walk_in.session.unwrap().id;

        let outcome = h.service.link_session_to_table(id, "t-1").await.unwrap();
        assert_eq!(outcome.bill.as_ref().unwrap().id, table_bill.id);
        assert_eq!(outcome.session.unwrap().bill, Some(table_bill.id));
        assert!(h.store.bill(walk_in_bill.id).await.unwrap().is_none());

        let bill = h.store.bill(table_bill.id).await.unwrap().unwrap();
        assert_eq!(bill.sessions.len(), 2);
        assert!(matches!(
            h.service.link_session_to_table(id, "t-1").await,
            Err(LoungeError::StateConflict(_))
        ));
    }

    #[tokio::test]
    async fn unlinking_gives_session_its_own_bill() {
        let h = harness();
        let mut a = start("PS01", 2);
        a.table_id = Some("t-2".into());
        let mut b = start("PS02", 2);
        b.table_id = Some("t-2".into());
        let shared = h.service.start_session(a).await.unwrap().bill.unwrap();
        let id = h.service.start_session(b).await.unwrap().session.unwrap().id;

        let outcome = h.service.unlink_session_from_table(id).await.unwrap();
        let own = outcome.bill.unwrap();
        assert_ne!(own.id, shared.id);
        assert!(own.table_number.is_none());
        let shared = h.store.bill(shared.id).await.unwrap().unwrap();
        assert_eq!(shared.sessions.len(), 1);

        assert!(matches!(
            h.service.unlink_session_from_table(id).await,
            Err(LoungeError::StateConflict(_))
        ));
    }

    #[tokio::test]
    async fn moving_onto_a_paid_bill_is_rejected_without_writes() {
        let h = harness();
        let first = h.service.start_session(start("PS01", 2)).await.unwrap();
        let first_id = first.session.unwrap().id;
        let paid_bill = first.bill.unwrap();
        h.clock.advance(Duration::hours(1));
        h.service.end_session(first_id).await.unwrap();
        h.service.record_payment(paid_bill.id, dec!(20), "cash").await.unwrap();

        let second = h.service.start_session(start("PS02", 2)).await.unwrap();
        let id = second.session.unwrap().id;
        let own_bill = second.bill.unwrap().id;
        assert!(matches!(
            h.service.move_session_to_bill(id, paid_bill.id).await,
            Err(LoungeError::StateConflict(_))
        ));
        let session = h.store.session(id).await.unwrap().unwrap();
        assert_eq!(session.bill, Some(own_bill));
        assert!(h.store.bill(own_bill).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn emptied_source_with_payments_is_folded_into_target() {
        let h = harness();
        let a = h.service.start_session(start("PS01", 2)).await.unwrap();
        let b = h.service.start_session(start("PS02", 2)).await.unwrap();
        let a_id = a.session.unwrap().id;
        let a_bill = a.bill.unwrap().id;
        let b_bill = b.bill.unwrap().id;
        h.clock.advance(Duration::hours(1));
        h.service.end_session(a_id).await.unwrap();
        h.service.record_payment(a_bill, dec!(5), "cash").await.unwrap();

        h.service.move_session_to_bill(a_id, b_bill).await.unwrap();
        assert!(h.store.bill(a_bill).await.unwrap().is_none());
        let target = h.store.bill(b_bill).await.unwrap().unwrap();
        assert_eq!(target.paid, dec!(5));
        assert_eq!(target.payments.len(), 1);
        assert_eq!(target.status, BillStatus::Partial);
    }

    #[tokio::test]
    async fn merge_bills_repoints_every_session() {
        let h = harness();
        let a = h.service.start_session(start("PS01", 2)).await.unwrap();
        let b = h.service.start_session(start("PS02", 2)).await.unwrap();
        let source = a.bill.unwrap().id;
        let target = b.bill.unwrap().id;
        let a_id = a.session.unwrap().id;

        let outcome = h.service.merge_bills(source, target).await.unwrap();
        assert_eq!(outcome.bill.unwrap().session_count, 2);
        assert!(h.store.bill(source).await.unwrap().is_none());
        let session = h.store.session(a_id).await.unwrap().unwrap();
        assert_eq!(session.bill, Some(target));
        assert_eq!(h.service.reconcile("org-1").await.unwrap().mutations(), 0);

        assert!(matches!(
            h.service.merge_bills(target, target).await,
            Err(LoungeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn payments_and_adjustments() {
        let h = harness();
        let started = h.service.start_session(start("PS01", 2)).await.unwrap();
        let id = started.session.unwrap().id;
        let bill_id = started.bill.unwrap().id;
        h.clock.advance(Duration::hours(1));
        h.service.end_session(id).await.unwrap();

        let adjusted = h.service.adjust_bill(bill_id, None, Some(dec!(2))).await.unwrap();
        assert_eq!(adjusted.bill.unwrap().total, dec!(22));

        let partial = h.service.record_payment(bill_id, dec!(10), "cash").await.unwrap();
        assert_eq!(partial.bill.unwrap().status, BillStatus::Partial);
        let paid = h.service.record_payment(bill_id, dec!(12), "card").await.unwrap();
        let summary = paid.bill.unwrap();
        assert_eq!(summary.status, BillStatus::Paid);
        assert_eq!(summary.remaining, dec!(0));

        assert!(matches!(
            h.service.record_payment(Uuid::new_v4(), dec!(1), "cash").await,
            Err(LoungeError::NotFound { .. })
        ));
    }

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(&self, _organization: &str, _event: Notification) -> anyhow::Result<()> {
            anyhow::bail!("sms gateway down")
        }
    }

    #[tokio::test]
    async fn notification_failures_do_not_fail_operations() {
        let h = harness_with(Arc::new(BrokenNotifier));
        let started = h.service.start_session(start("PS01", 2)).await.unwrap();
        let id = started.session.unwrap().id;
        h.service.link_session_to_table(id, "t-1").await.unwrap();
        h.clock.advance(Duration::minutes(30));
        let ended = h.service.end_session(id).await.unwrap();
        assert!(ended.success);
    }

    #[tokio::test]
    async fn missing_device_record_prices_with_defaults() {
        let h = harness();
        let id = h.service.start_session(start("PS01", 4)).await.unwrap().session.unwrap().id;
        let mut gone = h.store.device_by_number("PS01").await.unwrap().unwrap();
        gone.number = "PS01-retired".into();
        // Re-key the only device so the session's number no longer resolves.
        let fresh = Arc::new(InMemoryStore::with_devices([gone]));
        fresh
            .save_session(h.store.session(id).await.unwrap().unwrap())
            .await
            .unwrap();
        let service = LoungeService::new(
            fresh,
            RateTable::default(),
            Arc::new(LogNotifier),
            Arc::new(tables()),
            h.clock.clone(),
        );
        h.clock.advance(Duration::hours(1));
        let cost = service.session_cost(id).await.unwrap();
        assert_eq!(cost.current_cost, dec!(30));
    }
}
