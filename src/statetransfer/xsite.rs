//! Status of state pushed to remote sites.
//!
//! Each node records how its push to every backup site ended. The status is purely
//! informational and can be cleared cluster-wide with a fire-and-forget
//! `ClearCrossSiteStatus` command.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome of a push to one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    /// The push is in progress.
    Sending,
    /// The push completed.
    Ok,
    /// The push failed.
    Error,
    /// The push was cancelled by an operator.
    Cancelled,
}

impl PushStatus {
    pub fn is_finished(self) -> bool {
        self != PushStatus::Sending
    }
}

/// Per-site push status for one cache on one node.
#[derive(Debug, Default)]
pub struct CrossSiteStateTransfer {
    statuses: DashMap<SmolStr, PushStatus>,
}

impl CrossSiteStateTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a push. Returns false if one is already running.
    pub fn start_push(&self, site: &str) -> bool {
        let mut started = false;
        self.statuses
            .entry(SmolStr::new(site))
            .and_modify(|status| {
                if status.is_finished() {
                    *status = PushStatus::Sending;
                    started = true;
                }
            })
            .or_insert_with(|| {
                started = true;
                PushStatus::Sending
            });
        if started {
            info!(site, "Cross-site push started");
        }
        started
    }

    /// Record how a push ended.
    pub fn mark_status(&self, site: &str, status: PushStatus) {
        debug!(site, ?status, "Cross-site push status");
        self.statuses.insert(SmolStr::new(site), status);
    }

    pub fn status_of(&self, site: &str) -> Option<PushStatus> {
        self.statuses.get(site).map(|s| *s)
    }

    pub fn is_sending(&self, site: &str) -> bool {
        self.status_of(site) == Some(PushStatus::Sending)
    }

    /// All known statuses, by site.
    pub fn status(&self) -> BTreeMap<String, PushStatus> {
        self.statuses
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect()
    }

    /// Forget every finished push. Pushes in progress are kept.
    ///
    /// Clearing an already clear status is a no-op.
    pub fn clear_status(&self) {
        let before = self.statuses.len();
        self.statuses.retain(|_, status| !status.is_finished());
        let cleared = before - self.statuses.len();
        if cleared > 0 {
            info!(cleared, "Cleared cross-site push status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_lifecycle() {
        let xsite = CrossSiteStateTransfer::new();
        assert!(xsite.start_push("NYC"));
        assert!(!xsite.start_push("NYC"));
        assert!(xsite.is_sending("NYC"));

        xsite.mark_status("NYC", PushStatus::Ok);
        assert!(!xsite.is_sending("NYC"));
        assert_eq!(xsite.status_of("NYC"), Some(PushStatus::Ok));

        // A finished push can be restarted.
        assert!(xsite.start_push("NYC"));
    }

    #[test]
    fn test_clear_keeps_running_pushes() {
        let xsite = CrossSiteStateTransfer::new();
        xsite.start_push("NYC");
        xsite.start_push("LON");
        xsite.mark_status("LON", PushStatus::Error);
        xsite.mark_status("SFO", PushStatus::Cancelled);

        xsite.clear_status();
        let status = xsite.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status.get("NYC"), Some(&PushStatus::Sending));

        xsite.clear_status();
        assert_eq!(xsite.status(), status);
    }
}
