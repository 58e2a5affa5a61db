use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use shared_config::QueueSettings;

use crate::error::QueueError;
use crate::models::{PaymentStatus, QueueEntryType, QueueItem, QueueItemStatus};
use crate::services::events::{EventSink, QueueEvent, QueueEventKind};
use crate::services::payment::PaymentGate;
use crate::services::store::{QueueItemStore, StatusChange, StoreError};

/// Lazy expiration: there is no background sweep. Whether an item is expired
/// is a pure function of (status, deadline, now), computed on every read and
/// re-checked before every mutation; the stored status is synchronized with
/// a conditional update that is safe to race against an in-flight accept.
#[derive(Debug, Clone)]
pub struct ExpirationEvaluator {
    settings: QueueSettings,
}

impl ExpirationEvaluator {
    pub fn new(settings: QueueSettings) -> Self {
        Self { settings }
    }

    /// The moment after which a still-pending item counts as expired.
    /// Appointment entries die at the end of the waiting-room window,
    /// everything else a fixed wait after creation.
    pub fn expiry_deadline(&self, item: &QueueItem) -> DateTime<Utc> {
        match item.entry_type {
            QueueEntryType::Appointment => item
                .waiting_window(&self.settings)
                .map(|(_, closes_at)| closes_at)
                // Malformed rows without a start time fall back to the
                // walk-in rule rather than living forever.
                .unwrap_or(item.created_at + Duration::minutes(self.settings.max_wait_minutes)),
            QueueEntryType::WalkIn | QueueEntryType::EmergencyBroadcast => {
                item.created_at + Duration::minutes(self.settings.max_wait_minutes)
            }
        }
    }

    pub fn is_expired(&self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        item.status == QueueItemStatus::Pending && now > self.expiry_deadline(item)
    }

    /// Materialize logical expiry into the store. Idempotent: a concurrent
    /// accept beats us with its own conditional write, in which case the
    /// fresh row is returned unchanged.
    pub async fn materialize(
        &self,
        store: &dyn QueueItemStore,
        events: &dyn EventSink,
        item: QueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        if !self.is_expired(&item, now) {
            return Ok(item);
        }

        match store
            .transition(
                item.id,
                &[QueueItemStatus::Pending],
                StatusChange::to(QueueItemStatus::Expired, now),
            )
            .await
        {
            Ok(expired) => {
                debug!("Queue item {} marked expired", expired.id);
                events.emit(QueueEvent::new(
                    expired.id,
                    QueueEventKind::Expired,
                    QueueItemStatus::Expired,
                    now,
                ));
                Ok(expired)
            }
            // Lost the race to another transition; whatever won is current.
            Err(StoreError::Conflict) => store.get(item.id).await,
            Err(e) => Err(e),
        }
    }

    /// Synchronize the stored payment status with the gate, which owns the
    /// payment truth. Returns the refreshed item.
    pub async fn sync_payment_status(
        &self,
        store: &dyn QueueItemStore,
        gate: &dyn PaymentGate,
        item: QueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let gate_status = gate
            .status_for(item.id)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        if gate_status == item.payment_status {
            return Ok(item);
        }

        store
            .set_payment_status(item.id, gate_status, now)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => QueueError::NotFound(item.id.to_string()),
                other => QueueError::Store(other.to_string()),
            })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }
}

/// Helper shared by mutating paths: payment states that block a transition.
pub fn payment_blocks_transition(status: PaymentStatus) -> Option<QueueError> {
    match status {
        PaymentStatus::Pending => Some(QueueError::PaymentRequired),
        PaymentStatus::Expired => Some(QueueError::PaymentWindowExpired),
        PaymentStatus::NotRequired | PaymentStatus::Paid => None,
    }
}
