use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::QueueSettings;
use shared_models::auth::{Actor, ActorRole};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::models::{
    CreateQueueItemRequest, PaymentHandle, QueueEntryType, QueueItem, QueueItemStatus,
    QueueItemView,
};
use crate::services::broadcast::EmergencyBroadcastService;
use crate::services::events::{EventSink, QueueEvent, QueueEventKind};
use crate::services::expiry::{payment_blocks_transition, ExpirationEvaluator};
use crate::services::ordering::QueueOrderingService;
use crate::services::payment::{PaymentGate, PaymentGateError};
use crate::services::store::{QueueItemStore, StatusChange, StoreError};

/// The state machine over queue items. Every transition is one conditional
/// read-modify-write keyed by the item id and the expected current status;
/// a caller whose observation went stale gets `Conflict` and state is left
/// untouched. Expiry is re-evaluated before business logic, payment gating
/// is consulted where the lifecycle demands it, and one domain event is
/// emitted per committed transition.
pub struct QueueLifecycleService {
    store: Arc<dyn QueueItemStore>,
    gate: Arc<dyn PaymentGate>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    broadcast: Arc<EmergencyBroadcastService>,
    evaluator: ExpirationEvaluator,
    ordering: QueueOrderingService,
    settings: QueueSettings,
}

impl QueueLifecycleService {
    pub fn new(
        store: Arc<dyn QueueItemStore>,
        gate: Arc<dyn PaymentGate>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        broadcast: Arc<EmergencyBroadcastService>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            gate,
            events,
            clock,
            broadcast,
            evaluator: ExpirationEvaluator::new(settings.clone()),
            ordering: QueueOrderingService::new(settings.clone()),
            settings,
        }
    }

    // ==========================================================================
    // CREATION AND READS
    // ==========================================================================

    /// Create a walk-in or appointment entry for the calling patient.
    /// Emergency fan-outs go through the broadcast coordinator instead.
    pub async fn create_queue_item(
        &self,
        actor: Actor,
        request: CreateQueueItemRequest,
    ) -> Result<QueueItemView, QueueError> {
        if actor.role != ActorRole::Patient {
            return Err(QueueError::Forbidden(
                "Only patients may join the queue".to_string(),
            ));
        }

        let now = self.clock.now();

        let item = match request.entry_type {
            QueueEntryType::WalkIn => {
                let reason = request
                    .reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| {
                        QueueError::InvalidArgument(
                            "A walk-in entry needs a reason".to_string(),
                        )
                    })?;
                QueueItem::new_walk_in(actor.id, request.doctor_user_id, reason.to_string(), now)
            }
            QueueEntryType::Appointment => {
                let appointment_id = request.appointment_id.ok_or_else(|| {
                    QueueError::InvalidArgument(
                        "An appointment entry needs an appointment id".to_string(),
                    )
                })?;
                let start_at = request.appointment_start_at.ok_or_else(|| {
                    QueueError::InvalidArgument(
                        "An appointment entry needs the appointment start time".to_string(),
                    )
                })?;

                // The waiting room only exists from `lead` minutes before
                // the appointment; earlier creation is rejected outright.
                let opens_at =
                    start_at - chrono::Duration::minutes(self.settings.appointment_lead_minutes);
                if now < opens_at {
                    return Err(QueueError::OutOfWindow {
                        opens_at,
                        closes_at: start_at
                            + chrono::Duration::minutes(self.settings.appointment_grace_minutes),
                    });
                }

                QueueItem::new_appointment(
                    actor.id,
                    request.doctor_user_id,
                    appointment_id,
                    start_at,
                    now,
                )
            }
            QueueEntryType::EmergencyBroadcast => {
                return Err(QueueError::InvalidArgument(
                    "Emergency entries are created through the broadcast endpoint".to_string(),
                ));
            }
        };

        let stored = self
            .store
            .insert(item)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        info!(
            "Queue item {} created ({} for doctor {})",
            stored.id, stored.entry_type, stored.doctor_user_id
        );
        Ok(self.view(stored, now))
    }

    /// Fetch a single item, materializing expiry and synchronizing payment
    /// state on the way out. Participants only.
    pub async fn get_queue_item(&self, actor: Actor, id: Uuid) -> Result<QueueItemView, QueueError> {
        let item = self.fetch(id).await?;
        if !item.is_participant(actor.id) {
            return Err(QueueError::Forbidden(
                "Only the participants of a queue item may view it".to_string(),
            ));
        }

        let now = self.clock.now();
        let item = self.materialize(item, now).await?;
        let item = self
            .evaluator
            .sync_payment_status(self.store.as_ref(), self.gate.as_ref(), item, now)
            .await?;

        Ok(self.view(item, now))
    }

    /// The doctor-facing live queue: expiry materialized, history excluded,
    /// five-tier priority order.
    pub async fn list_queue_for_doctor(&self, actor: Actor) -> Result<Vec<QueueItemView>, QueueError> {
        if actor.role != ActorRole::Doctor {
            return Err(QueueError::Forbidden(
                "Only doctors have a queue view".to_string(),
            ));
        }

        let now = self.clock.now();
        let snapshot = self
            .store
            .list_for_doctor(actor.id)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        let mut materialized = Vec::with_capacity(snapshot.len());
        for item in snapshot {
            materialized.push(self.materialize(item, now).await?);
        }

        let ordered = self.ordering.order(materialized, now);
        Ok(ordered.into_iter().map(|item| self.view(item, now)).collect())
    }

    // ==========================================================================
    // TRANSITIONS
    // ==========================================================================

    /// Doctor takes a pending entry. For appointment entries the call must
    /// land inside the waiting-room window; a pending charge blocks it; for
    /// emergency siblings the win triggers group resolution.
    pub async fn accept(&self, actor: Actor, id: Uuid) -> Result<QueueItemView, QueueError> {
        let item = self.fetch(id).await?;
        self.require_owning_doctor(&actor, &item)?;

        let now = self.clock.now();
        let item = self.materialize(item, now).await?;

        // A sibling cancelled by the group resolution means another doctor
        // already won this emergency, which callers treat as a race loss.
        if item.emergency_group_id.is_some() && item.status == QueueItemStatus::Cancelled {
            return Err(QueueError::Conflict(
                "Already accepted by another doctor".to_string(),
            ));
        }
        self.reject_if_not(&item, QueueItemStatus::Pending, "accept")?;

        if let Some((opens_at, closes_at)) = item.waiting_window(&self.settings) {
            if now < opens_at {
                return Err(QueueError::OutOfWindow { opens_at, closes_at });
            }
        }

        let item = self
            .evaluator
            .sync_payment_status(self.store.as_ref(), self.gate.as_ref(), item, now)
            .await?;
        if let Some(block) = payment_blocks_transition(item.payment_status) {
            return Err(block);
        }

        let accepted = match item.emergency_group_id {
            // The emergency win and the sibling cancellations commit as one
            // atomic claim; a per-row compare-and-swap would let two
            // doctors accept different siblings of the same group.
            Some(group_id) => self.broadcast.claim(group_id, item.id).await?,
            None => self
                .store
                .transition(
                    id,
                    &[QueueItemStatus::Pending],
                    StatusChange::to(QueueItemStatus::Accepted, now).with_accepted_at(now),
                )
                .await
                .map_err(|e| self.map_transition_error(e, &item))?,
        };

        self.events.emit(QueueEvent::new(
            accepted.id,
            QueueEventKind::Accepted,
            QueueItemStatus::Accepted,
            now,
        ));

        info!("Queue item {} accepted by doctor {}", accepted.id, actor.id);
        Ok(self.view(accepted, now))
    }

    /// Doctor declines a pending entry.
    pub async fn reject(
        &self,
        actor: Actor,
        id: Uuid,
        reason: String,
    ) -> Result<QueueItemView, QueueError> {
        let item = self.fetch(id).await?;
        self.require_owning_doctor(&actor, &item)?;

        let now = self.clock.now();
        let item = self.materialize(item, now).await?;
        self.reject_if_not(&item, QueueItemStatus::Pending, "reject")?;

        let rejected = self
            .store
            .transition(
                id,
                &[QueueItemStatus::Pending],
                StatusChange::to(QueueItemStatus::Rejected, now),
            )
            .await
            .map_err(|e| self.map_transition_error(e, &item))?;

        self.events.emit(QueueEvent::new(
            rejected.id,
            QueueEventKind::Rejected,
            QueueItemStatus::Rejected,
            now,
        ));

        info!(
            "Queue item {} rejected by doctor {}: {}",
            rejected.id, actor.id, reason
        );
        Ok(self.view(rejected, now))
    }

    /// Either participant backs out before the consultation starts. Allowed
    /// from pending or accepted, and deliberately skips the expiry check so
    /// stale entries can always be cleaned up.
    pub async fn cancel(
        &self,
        actor: Actor,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<QueueItemView, QueueError> {
        let item = self.fetch(id).await?;
        if !item.is_participant(actor.id) {
            return Err(QueueError::Forbidden(
                "Only the participants of a queue item may cancel it".to_string(),
            ));
        }

        // No expiry re-evaluation here: a stale entry may always be
        // cancelled for cleanup. Statuses that already left the queue are
        // still rejected.
        if !matches!(
            item.status,
            QueueItemStatus::Pending | QueueItemStatus::Accepted
        ) {
            return Err(QueueError::InvalidState {
                status: item.status,
                detail: "cancel requires status pending or accepted".to_string(),
            });
        }

        let now = self.clock.now();
        let cancelled = self
            .store
            .transition(
                id,
                &[QueueItemStatus::Pending, QueueItemStatus::Accepted],
                StatusChange::to(QueueItemStatus::Cancelled, now),
            )
            .await
            .map_err(|e| self.map_transition_error(e, &item))?;

        self.events.emit(QueueEvent::new(
            cancelled.id,
            QueueEventKind::Cancelled,
            QueueItemStatus::Cancelled,
            now,
        ));

        if let Some(reason) = reason {
            debug!("Queue item {} cancelled: {}", cancelled.id, reason);
        }
        info!("Queue item {} cancelled by {}", cancelled.id, actor.id);
        Ok(self.view(cancelled, now))
    }

    /// Doctor starts the live consultation for an accepted entry. Payment
    /// must be settled or never asked for; the consultation handle is
    /// stamped exactly once.
    pub async fn start(&self, actor: Actor, id: Uuid) -> Result<QueueItemView, QueueError> {
        let item = self.fetch(id).await?;
        self.require_owning_doctor(&actor, &item)?;

        let now = self.clock.now();
        let item = self.materialize(item, now).await?;
        self.reject_if_not(&item, QueueItemStatus::Accepted, "start")?;

        let item = self
            .evaluator
            .sync_payment_status(self.store.as_ref(), self.gate.as_ref(), item, now)
            .await?;
        if let Some(block) = payment_blocks_transition(item.payment_status) {
            return Err(block);
        }

        let consultation_id = Uuid::new_v4();
        let started = self
            .store
            .transition(
                id,
                &[QueueItemStatus::Accepted],
                StatusChange::to(QueueItemStatus::InProgress, now)
                    .with_consultation(consultation_id),
            )
            .await
            .map_err(|e| self.map_transition_error(e, &item))?;

        self.events.emit(QueueEvent::new(
            started.id,
            QueueEventKind::Started,
            QueueItemStatus::InProgress,
            now,
        ));

        info!(
            "Consultation {} started for queue item {}",
            consultation_id, started.id
        );
        Ok(self.view(started, now))
    }

    /// Wrap up an in-progress consultation.
    pub async fn close(&self, actor: Actor, id: Uuid) -> Result<QueueItemView, QueueError> {
        let item = self.fetch(id).await?;
        if !item.is_participant(actor.id) {
            return Err(QueueError::Forbidden(
                "Only the participants of a consultation may close it".to_string(),
            ));
        }

        let now = self.clock.now();
        self.reject_if_not(&item, QueueItemStatus::InProgress, "close")?;

        let closed = self
            .store
            .transition(
                id,
                &[QueueItemStatus::InProgress],
                StatusChange::to(QueueItemStatus::Closed, now).with_closed_at(now),
            )
            .await
            .map_err(|e| self.map_transition_error(e, &item))?;

        self.events.emit(QueueEvent::new(
            closed.id,
            QueueEventKind::Closed,
            QueueItemStatus::Closed,
            now,
        ));

        info!("Queue item {} closed", closed.id);
        Ok(self.view(closed, now))
    }

    // ==========================================================================
    // PAYMENT
    // ==========================================================================

    /// Doctor opts to charge for a walk-in or emergency entry. Appointment
    /// entries are settled with the appointment itself.
    pub async fn enable_payment(
        &self,
        actor: Actor,
        id: Uuid,
    ) -> Result<(PaymentHandle, QueueItemView), QueueError> {
        let item = self.fetch(id).await?;
        self.require_owning_doctor(&actor, &item)?;

        if item.entry_type == QueueEntryType::Appointment {
            return Err(QueueError::InvalidArgument(
                "Appointment entries are settled with the appointment".to_string(),
            ));
        }

        let now = self.clock.now();
        let item = self.materialize(item, now).await?;
        if !matches!(
            item.status,
            QueueItemStatus::Pending | QueueItemStatus::Accepted
        ) {
            return Err(QueueError::InvalidState {
                status: item.status,
                detail: "payment can only be enabled before the consultation starts".to_string(),
            });
        }

        let handle = self
            .gate
            .enable_payment(id)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        let updated = self
            .evaluator
            .sync_payment_status(self.store.as_ref(), self.gate.as_ref(), item, now)
            .await?;

        info!("Payment enabled for queue item {} by doctor {}", id, actor.id);
        Ok((handle, self.view(updated, now)))
    }

    /// Checkout completion callback: the patient finished paying. A closed
    /// checkout window surfaces as `PaymentWindowExpired` and the stored
    /// status is synchronized to match the gate.
    pub async fn complete_payment(&self, actor: Actor, id: Uuid) -> Result<QueueItemView, QueueError> {
        let item = self.fetch(id).await?;
        if item.patient_user_id != actor.id {
            return Err(QueueError::Forbidden(
                "Only the paying patient may complete checkout".to_string(),
            ));
        }

        let now = self.clock.now();
        let paid = self.gate.mark_paid(id).await;

        let item = self
            .evaluator
            .sync_payment_status(self.store.as_ref(), self.gate.as_ref(), item, now)
            .await?;

        match paid {
            Ok(()) => Ok(self.view(item, now)),
            Err(PaymentGateError::WindowClosed) => Err(QueueError::PaymentWindowExpired),
            Err(PaymentGateError::NoCharge) => Err(QueueError::InvalidArgument(
                "No charge was enabled for this queue item".to_string(),
            )),
            Err(PaymentGateError::Backend(msg)) => Err(QueueError::Store(msg)),
        }
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    async fn fetch(&self, id: Uuid) -> Result<QueueItem, QueueError> {
        match self.store.get(id).await {
            Ok(item) => Ok(item),
            Err(StoreError::NotFound) => Err(QueueError::NotFound(id.to_string())),
            Err(e) => Err(QueueError::Store(e.to_string())),
        }
    }

    async fn materialize(
        &self,
        item: QueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        self.evaluator
            .materialize(self.store.as_ref(), self.events.as_ref(), item, now)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))
    }

    fn require_owning_doctor(&self, actor: &Actor, item: &QueueItem) -> Result<(), QueueError> {
        if actor.role != ActorRole::Doctor || item.doctor_user_id != actor.id {
            return Err(QueueError::Forbidden(
                "Only the assigned doctor may do this".to_string(),
            ));
        }
        Ok(())
    }

    fn reject_if_not(
        &self,
        item: &QueueItem,
        required: QueueItemStatus,
        action: &str,
    ) -> Result<(), QueueError> {
        if item.status != required {
            return Err(QueueError::InvalidState {
                status: item.status,
                detail: format!("{} requires status {}", action, required),
            });
        }
        Ok(())
    }

    /// Turn a conditional-write loss into the caller-facing error. A lost
    /// race on an emergency sibling means another doctor won the broadcast.
    fn map_transition_error(&self, error: StoreError, item: &QueueItem) -> QueueError {
        match error {
            StoreError::NotFound => QueueError::NotFound(item.id.to_string()),
            StoreError::Conflict => {
                if item.emergency_group_id.is_some() {
                    QueueError::Conflict("Already accepted by another doctor".to_string())
                } else {
                    warn!("Optimistic write lost for queue item {}", item.id);
                    QueueError::Conflict(
                        "Queue item changed concurrently, refresh and retry".to_string(),
                    )
                }
            }
            StoreError::Backend(msg) => QueueError::Store(msg),
        }
    }

    fn view(&self, item: QueueItem, now: DateTime<Utc>) -> QueueItemView {
        let is_expired =
            item.status == QueueItemStatus::Expired || self.evaluator.is_expired(&item, now);
        let display_priority = self.ordering.display_priority(&item, now);
        QueueItemView {
            item,
            is_expired,
            display_priority,
        }
    }
}
