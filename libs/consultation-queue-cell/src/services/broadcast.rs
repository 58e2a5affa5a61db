use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::QueueSettings;
use shared_models::auth::{Actor, ActorRole};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::models::{CreateEmergencyBroadcastRequest, QueueItem, QueueItemStatus};
use crate::services::events::{EventSink, QueueEvent, QueueEventKind};
use crate::services::quota::EmergencyQuotaTracker;
use crate::services::store::{QueueItemStore, StatusChange, StoreError};

/// Fans one patient emergency out to several candidate doctors as sibling
/// queue items, and resolves the race when any sibling is accepted: exactly
/// one member of a group may ever reach `accepted`, the rest are cancelled.
pub struct EmergencyBroadcastService {
    store: Arc<dyn QueueItemStore>,
    quota: EmergencyQuotaTracker,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl EmergencyBroadcastService {
    pub fn new(
        store: Arc<dyn QueueItemStore>,
        quota: EmergencyQuotaTracker,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            quota,
            events,
            clock,
            settings,
        }
    }

    /// Create one pending sibling per candidate doctor under a fresh group
    /// id. The quota increment happens before any row exists, so a rejected
    /// broadcast never leaves partial state behind.
    pub async fn create_broadcast(
        &self,
        actor: Actor,
        request: CreateEmergencyBroadcastRequest,
    ) -> Result<Vec<QueueItem>, QueueError> {
        if actor.role != ActorRole::Patient {
            return Err(QueueError::Forbidden(
                "Only patients may start an emergency broadcast".to_string(),
            ));
        }

        let note = request.note.trim();
        if note.is_empty() {
            return Err(QueueError::InvalidArgument(
                "An emergency broadcast needs a reason".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        let candidates: Vec<Uuid> = request
            .candidate_doctor_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        if candidates.is_empty() {
            return Err(QueueError::InvalidArgument(
                "At least one candidate doctor is required".to_string(),
            ));
        }
        if candidates.len() > self.settings.emergency_max_fanout {
            return Err(QueueError::TooManyCandidates {
                max: self.settings.emergency_max_fanout,
            });
        }

        let now = self.clock.now();
        self.quota.consume(actor.id, now).await?;

        let group_id = Uuid::new_v4();
        let siblings: Vec<QueueItem> = candidates
            .into_iter()
            .map(|doctor_id| {
                QueueItem::new_emergency(actor.id, doctor_id, group_id, note.to_string(), now)
            })
            .collect();

        let stored = self
            .store
            .insert_group(siblings)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        info!(
            "Emergency broadcast {} created for patient {} with {} candidates",
            group_id,
            actor.id,
            stored.len()
        );
        Ok(stored)
    }

    /// Decide the race for `group_id` in favor of `winner_id`: the accept
    /// and the cancellation of every still-pending sibling commit as one
    /// transaction. A caller whose sibling set was already decided gets
    /// `Conflict`, reported as a loss to another doctor.
    pub async fn claim(&self, group_id: Uuid, winner_id: Uuid) -> Result<QueueItem, QueueError> {
        let now = self.clock.now();
        let accept = StatusChange::to(QueueItemStatus::Accepted, now).with_accepted_at(now);
        let cancel = StatusChange::to(QueueItemStatus::Cancelled, now);

        match self
            .store
            .claim_group(group_id, winner_id, accept, cancel)
            .await
        {
            Ok((winner, cancelled)) => {
                info!(
                    "Emergency group {} decided for doctor {} ({} siblings cancelled)",
                    group_id,
                    winner.doctor_user_id,
                    cancelled.len()
                );
                for sibling in cancelled {
                    self.events.emit(QueueEvent::new(
                        sibling.id,
                        QueueEventKind::Cancelled,
                        QueueItemStatus::Cancelled,
                        now,
                    ));
                }
                Ok(winner)
            }
            Err(StoreError::Conflict) => Err(QueueError::Conflict(
                "Already accepted by another doctor".to_string(),
            )),
            Err(StoreError::NotFound) => Err(QueueError::NotFound(winner_id.to_string())),
            Err(e) => Err(QueueError::Store(e.to_string())),
        }
    }

    /// Compensating sweep: cancel every still-pending sibling of
    /// `winner_id` in `group_id`. The atomic claim normally leaves nothing
    /// for this to do; it exists for retries after a partially-applied
    /// resolution, since each cancel is a conditional update that is safe
    /// to re-run and safe to race against reader-side expiry.
    pub async fn resolve_accept(&self, group_id: Uuid, winner_id: Uuid) -> Result<(), QueueError> {
        let now = self.clock.now();
        let siblings = self
            .store
            .list_group(group_id)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        for sibling in siblings {
            if sibling.id == winner_id || sibling.status != QueueItemStatus::Pending {
                continue;
            }

            match self
                .store
                .transition(
                    sibling.id,
                    &[QueueItemStatus::Pending],
                    StatusChange::to(QueueItemStatus::Cancelled, now),
                )
                .await
            {
                Ok(cancelled) => {
                    debug!(
                        "Cancelled losing sibling {} in group {}",
                        cancelled.id, group_id
                    );
                    self.events.emit(QueueEvent::new(
                        cancelled.id,
                        QueueEventKind::Cancelled,
                        QueueItemStatus::Cancelled,
                        now,
                    ));
                }
                // Already moved by an expiry materialization or its own
                // terminal transition; nothing left to do.
                Err(StoreError::Conflict) | Err(StoreError::NotFound) => {}
                Err(e) => {
                    warn!(
                        "Failed to cancel sibling {} in group {}: {}",
                        sibling.id, group_id, e
                    );
                    return Err(QueueError::Store(e.to_string()));
                }
            }
        }

        Ok(())
    }
}
