//! Hourly pricing.
//!
//! Each device carries a [`RateCard`]: computers have one hourly rate,
//! PlayStations have one hourly rate per controller count (1 to 4).
//! The [`RateTable`] resolves the card used for a session and holds
//! the venue-wide [`DefaultRates`], which are the only fallback prices
//! in the crate.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{LoungeError, Result};
use crate::models::{Device, DeviceType};

pub const MIN_CONTROLLERS: u8 = 1;
pub const MAX_CONTROLLERS: u8 = 4;

/// Rejects controller counts outside `[1, 4]`.
pub fn validate_controllers(count: u8) -> Result<()> {
    if (MIN_CONTROLLERS..=MAX_CONTROLLERS).contains(&count) {
        Ok(())
    } else {
        Err(LoungeError::validation(format!(
            "controller count must be between {MIN_CONTROLLERS} and {MAX_CONTROLLERS}, got {count}"
        )))
    }
}

/// Hourly rate per controller count.  Always holds an entry for every
/// count from 1 to 4, each non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<u8, Decimal>", into = "BTreeMap<u8, Decimal>")]
pub struct ControllerRates([Decimal; MAX_CONTROLLERS as usize]);

impl ControllerRates {
    pub fn new(rates: [Decimal; MAX_CONTROLLERS as usize]) -> Result<Self> {
        if let Some(negative) = rates.iter().find(|r| r.is_sign_negative()) {
            return Err(LoungeError::validation(format!(
                "controller rates must be non-negative, got {negative}"
            )));
        }
        Ok(Self(rates))
    }

    pub fn get(&self, controllers: u8) -> Result<Decimal> {
        validate_controllers(controllers)?;
        Ok(self.0[(controllers - 1) as usize])
    }
}

impl TryFrom<BTreeMap<u8, Decimal>> for ControllerRates {
    type Error = LoungeError;

    fn try_from(map: BTreeMap<u8, Decimal>) -> Result<Self> {
        let mut rates = [Decimal::ZERO; MAX_CONTROLLERS as usize];
        for count in MIN_CONTROLLERS..=MAX_CONTROLLERS {
            rates[(count - 1) as usize] = *map.get(&count).ok_or_else(|| {
                LoungeError::validation(format!("missing rate for {count} controllers"))
            })?;
        }
        if let Some(extra) = map.keys().find(|k| !(MIN_CONTROLLERS..=MAX_CONTROLLERS).contains(*k)) {
            return Err(LoungeError::validation(format!(
                "unexpected rate entry for {extra} controllers"
            )));
        }
        ControllerRates::new(rates)
    }
}

impl From<ControllerRates> for BTreeMap<u8, Decimal> {
    fn from(rates: ControllerRates) -> Self {
        (MIN_CONTROLLERS..=MAX_CONTROLLERS)
            .zip(rates.0)
            .collect()
    }
}

/// Pricing stored on a device record.  Exactly one pricing mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateCard {
    /// Single hourly rate (computers).
    Hourly(Decimal),
    /// Hourly rate keyed by controller count (PlayStations).
    PerController(ControllerRates),
}

impl RateCard {
    /// Hourly rate in effect while `controllers` controllers are in use.
    pub fn rate(&self, controllers: u8) -> Result<Decimal> {
        match self {
            RateCard::Hourly(rate) => Ok(*rate),
            RateCard::PerController(rates) => rates.get(controllers),
        }
    }

    /// Checks that the pricing mode matches the device type.
    pub fn validate_for(&self, device_type: DeviceType) -> Result<()> {
        match (self, device_type) {
            (RateCard::Hourly(rate), DeviceType::Computer) => {
                if rate.is_sign_negative() {
                    Err(LoungeError::validation("hourly rate must be non-negative"))
                } else {
                    Ok(())
                }
            }
            (RateCard::PerController(_), DeviceType::Playstation) => Ok(()),
            (RateCard::Hourly(_), DeviceType::Playstation) => Err(LoungeError::validation(
                "playstation devices need per-controller rates",
            )),
            (RateCard::PerController(_), DeviceType::Computer) => Err(LoungeError::validation(
                "computer devices need a single hourly rate",
            )),
        }
    }
}

/// Checks a device record before it is stored.
pub fn validate_device(device: &Device) -> Result<()> {
    if device.number.trim().is_empty() {
        return Err(LoungeError::validation("device number is required"));
    }
    let prefix = device.device_type.number_prefix();
    if !device.number.starts_with(prefix) {
        return Err(LoungeError::validation(format!(
            "device number {} must start with {prefix}",
            device.number
        )));
    }
    device.rates.validate_for(device.device_type)?;
    match device.device_type {
        DeviceType::Playstation => validate_controllers(device.controller_capacity),
        DeviceType::Computer if device.controller_capacity == 1 => Ok(()),
        DeviceType::Computer => Err(LoungeError::validation(
            "computer devices have a controller capacity of 1",
        )),
    }
}

/// Venue-wide fallback prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultRates {
    pub playstation: ControllerRates,
    pub computer: Decimal,
}

impl Default for DefaultRates {
    fn default() -> Self {
        Self {
            playstation: ControllerRates([dec!(20), dec!(20), dec!(25), dec!(30)]),
            computer: dec!(15),
        }
    }
}

impl DefaultRates {
    pub fn card_for(&self, device_type: DeviceType) -> RateCard {
        match device_type {
            DeviceType::Playstation => RateCard::PerController(self.playstation.clone()),
            DeviceType::Computer => RateCard::Hourly(self.computer),
        }
    }
}

/// Resolves the rate card for a session.  The device's own card wins;
/// the defaults for the device type apply only when the device record
/// is gone.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    defaults: DefaultRates,
}

impl RateTable {
    pub fn new(defaults: DefaultRates) -> Self {
        Self { defaults }
    }

    pub fn resolve(&self, device: Option<&Device>, device_type: DeviceType) -> RateCard {
        match device {
            Some(device) => device.rates.clone(),
            None => {
                tracing::warn!(
                    device_type = ?device_type,
                    "device record missing, pricing with default rates"
                );
                self.defaults.card_for(device_type)
            }
        }
    }
}
