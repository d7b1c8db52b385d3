//! Persistence interface.
//!
//! The engine talks to its document store through the [`Store`]
//! trait.  Reads are per record or per organisation; all writes go
//! through [`Store::commit`], which applies a [`WriteBatch`] as one
//! atomic unit.  Multi-document operations such as moving a session
//! between bills build a single batch, so a failure cannot leave the
//! session half-moved.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Bill, Device, Session, SessionStatus};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A set of writes applied together.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub devices: Vec<Device>,
    pub sessions: Vec<Session>,
    pub bills: Vec<Bill>,
    pub deleted_bills: Vec<Uuid>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_device(&mut self, device: Device) -> &mut Self {
        self.devices.push(device);
        self
    }

    /// Queues a session upsert, replacing any earlier copy in the batch.
    pub fn put_session(&mut self, session: Session) -> &mut Self {
        self.sessions.retain(|s| s.id != session.id);
        self.sessions.push(session);
        self
    }

    /// Queues a bill upsert, replacing any earlier copy in the batch.
    pub fn put_bill(&mut self, bill: Bill) -> &mut Self {
        self.deleted_bills.retain(|id| *id != bill.id);
        self.bills.retain(|b| b.id != bill.id);
        self.bills.push(bill);
        self
    }

    pub fn delete_bill(&mut self, id: Uuid) -> &mut Self {
        self.bills.retain(|b| b.id != id);
        if !self.deleted_bills.contains(&id) {
            self.deleted_bills.push(id);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.sessions.is_empty()
            && self.bills.is_empty()
            && self.deleted_bills.is_empty()
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.devices.len() + self.sessions.len() + self.bills.len() + self.deleted_bills.len()
    }
}

/// Document store holding devices, sessions and bills.
#[async_trait]
pub trait Store: Send + Sync {
    async fn device_by_number(&self, number: &str) -> StoreResult<Option<Device>>;

    async fn devices(&self) -> StoreResult<Vec<Device>>;

    async fn session(&self, id: Uuid) -> StoreResult<Option<Session>>;

    /// All sessions of an organisation, oldest start first.
    async fn sessions_by_org(&self, organization: &str) -> StoreResult<Vec<Session>>;

    /// The active session on a device, if any.
    async fn active_session_for_device(&self, device_number: &str) -> StoreResult<Option<Session>>;

    async fn bill(&self, id: Uuid) -> StoreResult<Option<Bill>>;

    /// All bills of an organisation, oldest first.
    async fn bills_by_org(&self, organization: &str) -> StoreResult<Vec<Bill>>;

    /// Open bills on a table, newest first.
    async fn open_bills_for_table(&self, organization: &str, table_id: &str) -> StoreResult<Vec<Bill>>;

    /// Next unique bill number.
    async fn next_bill_number(&self, now: DateTime<Utc>) -> StoreResult<String>;

    /// Applies every write in `batch` or none of them.
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    async fn save_session(&self, session: Session) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_session(session);
        self.commit(batch).await
    }

    async fn save_bill(&self, bill: Bill) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_bill(bill);
        self.commit(batch).await
    }

    async fn delete_bill(&self, id: Uuid) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_bill(id);
        self.commit(batch).await
    }

    async fn save_device(&self, device: Device) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_device(device);
        self.commit(batch).await
    }
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    sessions: HashMap<Uuid, Session>,
    bills: HashMap<Uuid, Bill>,
    bill_seq: u64,
}

/// In-memory [`Store`].  Each batch is applied under a single write
/// lock.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with devices, keyed by device number.
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let inner = Inner {
            devices: devices.into_iter().map(|d| (d.number.clone(), d)).collect(),
            ..Inner::default()
        };
        Self {
            inner: RwLock::new(inner),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn device_by_number(&self, number: &str) -> StoreResult<Option<Device>> {
        Ok(self.inner.read().await.devices.get(number).cloned())
    }

    async fn devices(&self) -> StoreResult<Vec<Device>> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(devices)
    }

    async fn session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.inner.read().await.sessions.get(&id).cloned())
    }

    async fn sessions_by_org(&self, organization: &str) -> StoreResult<Vec<Session>> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.organization == organization)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn active_session_for_device(&self, device_number: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .find(|s| s.device.number == device_number && s.status == SessionStatus::Active)
            .cloned())
    }

    async fn bill(&self, id: Uuid) -> StoreResult<Option<Bill>> {
        Ok(self.inner.read().await.bills.get(&id).cloned())
    }

    async fn bills_by_org(&self, organization: &str) -> StoreResult<Vec<Bill>> {
        let inner = self.inner.read().await;
        let mut bills: Vec<Bill> = inner
            .bills
            .values()
            .filter(|b| b.organization == organization)
            .cloned()
            .collect();
        bills.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(bills)
    }

    async fn open_bills_for_table(&self, organization: &str, table_id: &str) -> StoreResult<Vec<Bill>> {
        let inner = self.inner.read().await;
        let mut bills: Vec<Bill> = inner
            .bills
            .values()
            .filter(|b| {
                b.organization == organization && b.status.is_open() && b.table_id() == Some(table_id)
            })
            .cloned()
            .collect();
        bills.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bills)
    }

    async fn next_bill_number(&self, now: DateTime<Utc>) -> StoreResult<String> {
        let mut inner = self.inner.write().await;
        inner.bill_seq += 1;
        Ok(format!("B-{}-{:04}", now.format("%Y%m%d"), inner.bill_seq))
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(missing) = batch
            .deleted_bills
            .iter()
            .find(|id| !inner.bills.contains_key(*id))
        {
            return Err(StoreError::BillNotFound(*missing));
        }
        for device in batch.devices {
            inner.devices.insert(device.number.clone(), device);
        }
        for session in batch.sessions {
            inner.sessions.insert(session.id, session);
        }
        for bill in batch.bills {
            inner.bills.insert(bill.id, bill);
        }
        for id in batch.deleted_bills {
            inner.bills.remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::new_bill;
    use crate::engine::tests::{session, t0};
    use crate::models::Table;
    use chrono::Duration;

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let s = session(2, vec![]);
        let mut batch = WriteBatch::new();
        batch.put_session(s.clone()).delete_bill(Uuid::new_v4());
        assert!(matches!(store.commit(batch).await, Err(StoreError::BillNotFound(_))));
        assert!(store.session(s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_keeps_last_write_per_record() {
        let mut bill = new_bill("B-1".into(), "org-1", "Sam", None, t0());
        let mut batch = WriteBatch::new();
        batch.put_bill(bill.clone());
        bill.customer_name = "Alex".into();
        batch.put_bill(bill.clone());
        assert_eq!(batch.len(), 1);

        batch.delete_bill(bill.id);
        assert_eq!(batch.len(), 1);
        assert!(batch.bills.is_empty());
    }

    #[tokio::test]
    async fn bill_numbers_are_unique() {
        let store = InMemoryStore::new();
        let a = store.next_bill_number(t0()).await.unwrap();
        let b = store.next_bill_number(t0()).await.unwrap();
        assert_eq!(a, "B-20240501-0001");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn open_table_bills_are_newest_first() {
        let store = InMemoryStore::new();
        let table = Table {
            id: "t-1".into(),
            number: "1".into(),
        };
        let older = new_bill("B-1".into(), "org-1", "Sam", Some(table.clone()), t0());
        let newer = new_bill(
            "B-2".into(),
            "org-1",
            "Sam",
            Some(table.clone()),
            t0() + Duration::minutes(5),
        );
        let mut paid = new_bill("B-3".into(), "org-1", "Sam", Some(table), t0() + Duration::minutes(9));
        paid.status = crate::models::BillStatus::Paid;
        for bill in [older.clone(), newer.clone(), paid] {
            store.save_bill(bill).await.unwrap();
        }
        let open = store.open_bills_for_table("org-1", "t-1").await.unwrap();
        let ids: Vec<Uuid> = open.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn finds_active_session_by_device() {
        let store = InMemoryStore::new();
        let s = session(2, vec![]);
        store.save_session(s.clone()).await.unwrap();
        let found = store.active_session_for_device("PS01").await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(s.id));
        assert!(store.active_session_for_device("PS02").await.unwrap().is_none());
    }
}
