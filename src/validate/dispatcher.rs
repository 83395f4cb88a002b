//! The write half of validation: applies the target settings a report
//! listed as prerequisites, before anything is created.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::validate::Report;
use crate::validate::inventory::Inventory;

pub struct Dispatcher {
    inventory: Arc<dyn Inventory>,
}

impl Dispatcher {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    /// Set every prerequisite of `report` that is not already in place.
    /// Returns how many settings were written.
    pub async fn apply_prerequisites(&self, report: &Report) -> Result<usize> {
        let mut written = 0;
        for p in &report.prerequisites {
            if self.inventory.option(&p.key).await?.as_deref() == Some(p.value.as_str()) {
                continue;
            }
            self.inventory.set_option(&p.key, &p.value).await?;
            info!(key = %p.key, value = %p.value, "target option set");
            written += 1;
        }
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
