//! CRM status list resources

use super::registry::Resource;
use anyhow::Result;
use async_trait::async_trait;
use crm_realtime_shared::now_ms;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Status doctypes the CRM caches as lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDoctype {
    Lead,
    Deal,
    Communication,
}

impl StatusDoctype {
    pub const ALL: [StatusDoctype; 3] = [
        StatusDoctype::Lead,
        StatusDoctype::Deal,
        StatusDoctype::Communication,
    ];

    pub fn doctype(self) -> &'static str {
        match self {
            StatusDoctype::Lead => "CRM Lead Status",
            StatusDoctype::Deal => "CRM Deal Status",
            StatusDoctype::Communication => "CRM Communication Status",
        }
    }

    pub fn cache_key(self) -> &'static str {
        match self {
            StatusDoctype::Lead => "lead-statuses",
            StatusDoctype::Deal => "deal-statuses",
            StatusDoctype::Communication => "communication-statuses",
        }
    }
}

/// Cached list of one status doctype
pub struct StatusList {
    kind: StatusDoctype,
    reloads: AtomicU64,
    last_reload_ms: AtomicU64,
}

impl StatusList {
    pub fn new(kind: StatusDoctype) -> Self {
        Self {
            kind,
            reloads: AtomicU64::new(0),
            last_reload_ms: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> StatusDoctype {
        self.kind
    }

    /// Number of reloads so far
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Time of the last reload, 0 if never reloaded
    pub fn last_reload_ms(&self) -> u64 {
        self.last_reload_ms.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resource for StatusList {
    fn cache_key(&self) -> &str {
        self.kind.cache_key()
    }

    async fn reload(&self) -> Result<()> {
        let count = self.reloads.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_reload_ms.store(now_ms(), Ordering::SeqCst);
        info!(
            "Reloading {} list (cache: {}, reload #{})",
            self.kind.doctype(),
            self.kind.cache_key(),
            count
        );
        Ok(())
    }
}
