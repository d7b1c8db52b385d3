//! Lounge Engine library crate.
//!
//! This crate implements the billing core of a gaming lounge: rental
//! sessions on PlayStations and computers are priced from their
//! controller history, rolled up into bills, moved between bills and
//! tables, and repaired by a reconciliation pass when the session and
//! bill sides disagree.  External applications may call into
//! [`service::LoungeService`] directly or embed the HTTP API via
//! `api::build_router`.

pub mod api;
pub mod billing;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod rates;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod tables;

pub use error::{LoungeError, Result};
