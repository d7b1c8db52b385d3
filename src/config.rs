//! Configuration.
//!
//! Runtime settings come from environment variables.  The venue's
//! devices, tables and default rates come from a JSON catalog file,
//! loaded once at start-up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{Device, Table};
use crate::rates::{validate_device, DefaultRates};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Process settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Address the HTTP server binds to (`LOUNGE_BIND_ADDR`).
    pub bind_addr: String,
    /// Catalog file (`LOUNGE_CATALOG`).  `None` means an empty catalog
    /// with built-in default rates.
    pub catalog_path: Option<PathBuf>,
    /// Run a reconciliation pass after every table link, unlink or
    /// move (`LOUNGE_RECONCILE_AFTER_MOVES`).
    pub reconcile_after_moves: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            catalog_path: None,
            reconcile_after_moves: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Settings::default();
        let reconcile_after_moves = match lookup("LOUNGE_RECONCILE_AFTER_MOVES") {
            Some(raw) => parse_flag(&raw)
                .with_context(|| format!("invalid LOUNGE_RECONCILE_AFTER_MOVES value {raw:?}"))?,
            None => defaults.reconcile_after_moves,
        };
        Ok(Self {
            bind_addr: lookup("LOUNGE_BIND_ADDR").unwrap_or(defaults.bind_addr),
            catalog_path: lookup("LOUNGE_CATALOG").map(PathBuf::from),
            reconcile_after_moves,
        })
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

/// Devices, tables and default prices of a venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub default_rates: DefaultRates,
}

impl Catalog {
    /// Parses a catalog and validates every device in it.
    pub fn from_json(data: &str) -> Result<Self> {
        let catalog: Catalog = serde_json::from_str(data).context("failed to parse catalog")?;
        for device in &catalog.devices {
            validate_device(device)
                .with_context(|| format!("invalid device {}", device.number))?;
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        Self::from_json(&data)
    }

    /// Loads the catalog named by `settings`, or an empty one.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        match &settings.catalog_path {
            Some(path) => Self::load(path),
            None => Ok(Catalog::default()),
        }
    }
}
