//! Table registry.  Resolves table ids to display numbers for bill
//! notes and summaries; it plays no part in pricing.

use std::collections::HashMap;

use crate::models::Table;

pub trait TableRegistry: Send + Sync {
    fn table(&self, id: &str) -> Option<Table>;
}

/// Registry backed by a fixed list, usually loaded from the catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticTableRegistry {
    tables: HashMap<String, Table>,
}

impl StaticTableRegistry {
    pub fn new(tables: impl IntoIterator<Item = Table>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

impl TableRegistry for StaticTableRegistry {
    fn table(&self, id: &str) -> Option<Table> {
        self.tables.get(id).cloned()
    }
}
