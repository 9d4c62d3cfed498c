//! Offense recorder
//!
//! Writes one offense row per rule hit and queues it for HQ delivery.
//! The queue insert is skipped only when the offense insert yielded no id.

use crate::clock;
use crate::error::Result;
use crate::registry::{Module, Rule};
use crate::store::Store;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Recorder {
    store: Arc<Store>,
}

impl Recorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record a matched line, returning the offense id when the insert took
    pub fn record(
        &self,
        module: &Module,
        rule: &Rule,
        line: &str,
        ip: Ipv4Addr,
        user: Option<String>,
    ) -> Result<Option<i64>> {
        let id = self.store.record_offense(
            &clock::sdatetime(),
            &rule.service_id,
            line,
            &module.name,
            &ip.to_string(),
            &rule.keyword,
            user.as_deref().unwrap_or(""),
        )?;

        if let Some(id) = id
            && module.reports_to_hq()
        {
            self.store.enqueue_report(id)?;
        }

        debug!(module = %module.name, %ip, id = ?id, "offense recorded");
        Ok(id)
    }
}
