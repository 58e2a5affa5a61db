use chrono::{DateTime, Utc};

use shared_config::QueueSettings;

use crate::models::{QueueEntryType, QueueItem, QueueItemStatus};
use crate::services::expiry::ExpirationEvaluator;

/// Produces the doctor-facing queue in priority order from a snapshot of
/// items. Five tiers, ties broken by creation time ascending:
/// committed work first, then on-time appointments, early appointments,
/// walk-ins/emergencies, and expired entries last. History statuses
/// (rejected, cancelled, closed) never appear in the live view.
pub struct QueueOrderingService {
    evaluator: ExpirationEvaluator,
}

impl QueueOrderingService {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            evaluator: ExpirationEvaluator::new(settings),
        }
    }

    /// Tier for a single item; lower sorts first.
    pub fn display_priority(&self, item: &QueueItem, now: DateTime<Utc>) -> u8 {
        if matches!(
            item.status,
            QueueItemStatus::Accepted | QueueItemStatus::InProgress
        ) {
            return 0;
        }

        if item.status == QueueItemStatus::Expired || self.evaluator.is_expired(item, now) {
            return 4;
        }

        match item.entry_type {
            QueueEntryType::Appointment => {
                match item.waiting_window(self.evaluator.settings()) {
                    Some((opens_at, _)) if now < opens_at => 2,
                    Some(_) => 1,
                    None => 3,
                }
            }
            QueueEntryType::WalkIn | QueueEntryType::EmergencyBroadcast => 3,
        }
    }

    pub fn is_visible(&self, item: &QueueItem) -> bool {
        !matches!(
            item.status,
            QueueItemStatus::Rejected | QueueItemStatus::Cancelled | QueueItemStatus::Closed
        )
    }

    /// Filter to the live view and sort by (tier, created_at).
    pub fn order(&self, items: Vec<QueueItem>, now: DateTime<Utc>) -> Vec<QueueItem> {
        let mut visible: Vec<QueueItem> = items
            .into_iter()
            .filter(|item| self.is_visible(item))
            .collect();
        visible.sort_by_key(|item| (self.display_priority(item, now), item.created_at));
        visible
    }
}
