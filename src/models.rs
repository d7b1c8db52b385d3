//! Data models for the Lounge Engine.
//!
//! The `models` module defines the serialisable records the engine
//! works on: devices with their rate cards, rental sessions with their
//! controller history, and the bills sessions roll up into.  Field
//! names serialise in camelCase so the records can be exchanged with
//! the document store and front end unchanged.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rates::RateCard;

/// Kind of rentable device.  Determines which pricing mode a device's
/// [`RateCard`] must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Playstation,
    Computer,
}

impl DeviceType {
    /// Prefix used in device numbers, e.g. `PS03` or `PC12`.
    pub fn number_prefix(&self) -> &'static str {
        match self {
            DeviceType::Playstation => "PS",
            DeviceType::Computer => "PC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Available,
    Busy,
    Maintenance,
}

/// A rentable PlayStation or computer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    /// Type-prefixed number shown on the floor, e.g. `PS03`.
    pub number: String,
    pub name: String,
    pub device_type: DeviceType,
    /// Maximum number of controllers that can be attached.  Always 1
    /// for computers.
    pub controller_capacity: u8,
    pub rates: RateCard,
    #[serde(default)]
    pub status: DeviceStatus,
}

impl Device {
    /// Reference embedded into sessions started on this device.
    pub fn to_ref(&self) -> DeviceRef {
        DeviceRef {
            id: self.id.clone(),
            number: self.number.clone(),
            name: self.name.clone(),
            device_type: self.device_type,
        }
    }
}

/// Copy of the device identity stored on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    pub id: String,
    pub number: String,
    pub name: String,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    /// Terminal status found on historical records.  No operation in
    /// this crate assigns it.
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// A contiguous span during which the controller count was constant.
/// `to` is `None` only for the last period of an active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPeriod {
    pub controllers: u8,
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
}

/// One rental occupancy of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub organization: String,
    pub device: DeviceRef,
    pub customer_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub controllers: u8,
    #[serde(default)]
    pub controllers_history: Vec<ControllerPeriod>,
    /// Cost before discount.
    pub total_cost: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    /// `total_cost - discount`.
    pub final_cost: Decimal,
    /// Bill the session currently belongs to.
    pub bill: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    Draft,
    Partial,
    Overdue,
    Paid,
    Cancelled,
}

impl BillStatus {
    /// Open bills can still take sessions, orders and payments.
    pub fn is_open(&self) -> bool {
        matches!(self, BillStatus::Draft | BillStatus::Partial | BillStatus::Overdue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Draft => "draft",
            BillStatus::Partial => "partial",
            BillStatus::Overdue => "overdue",
            BillStatus::Paid => "paid",
            BillStatus::Cancelled => "cancelled",
        }
    }
}

/// A payment recorded against a bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub amount: Decimal,
    pub method: String,
    pub paid_at: DateTime<Utc>,
}

/// An order line item attached to a bill (food, drinks, ...).  Only
/// its total matters to the bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub id: Uuid,
    pub amount: Decimal,
}

/// A venue table as known to the table registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    /// Display number, used in notes only.
    pub number: String,
}

/// Aggregates sessions and orders under one payable total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    pub id: Uuid,
    pub bill_number: String,
    pub organization: String,
    pub customer_name: String,
    pub table: Option<Table>,
    pub status: BillStatus,
    pub subtotal: Decimal,
    pub total: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub tax: Decimal,
    #[serde(default)]
    pub paid: Decimal,
    pub remaining: Decimal,
    /// Session ids.  Must not contain duplicates; reconciliation
    /// repairs them if it does.
    #[serde(default)]
    pub sessions: Vec<Uuid>,
    #[serde(default)]
    pub orders: Vec<OrderLine>,
    #[serde(default)]
    pub payments: Vec<Payment>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bill {
    /// A bill with no sessions and no orders.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.orders.is_empty()
    }

    pub fn contains_session(&self, session_id: &Uuid) -> bool {
        self.sessions.contains(session_id)
    }

    pub fn table_id(&self) -> Option<&str> {
        self.table.as_ref().map(|t| t.id.as_str())
    }
}

/// Compact view of a bill returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillSummary {
    pub id: Uuid,
    pub bill_number: String,
    pub status: BillStatus,
    pub table_number: Option<String>,
    pub session_count: usize,
    pub subtotal: Decimal,
    pub total: Decimal,
    pub paid: Decimal,
    pub remaining: Decimal,
}

impl From<&Bill> for BillSummary {
    fn from(bill: &Bill) -> Self {
        Self {
            id: bill.id,
            bill_number: bill.bill_number.clone(),
            status: bill.status,
            table_number: bill.table.as_ref().map(|t| t.number.clone()),
            session_count: bill.sessions.len(),
            subtotal: bill.subtotal,
            total: bill.total,
            paid: bill.paid,
            remaining: bill.remaining,
        }
    }
}
