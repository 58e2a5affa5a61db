use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use shared_config::QueueSettings;

// ==============================================================================
// CORE QUEUE MODELS
// ==============================================================================

/// One doctor-patient pairing attempt. The unit of coordination: created
/// `pending`, mutated only through the lifecycle service, immutable once in a
/// terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub doctor_user_id: Uuid,
    pub patient_user_id: Uuid,
    pub entry_type: QueueEntryType,
    pub appointment_id: Option<Uuid>,
    pub appointment_start_at: Option<DateTime<Utc>>,
    pub emergency_group_id: Option<Uuid>,
    pub status: QueueItemStatus,
    pub payment_status: PaymentStatus,
    pub reason: Option<String>,
    pub consultation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryType {
    WalkIn,
    Appointment,
    EmergencyBroadcast,
}

impl fmt::Display for QueueEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEntryType::WalkIn => write!(f, "walk_in"),
            QueueEntryType::Appointment => write!(f, "appointment"),
            QueueEntryType::EmergencyBroadcast => write!(f, "emergency_broadcast"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    Expired,
    InProgress,
    Closed,
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueItemStatus::Pending => write!(f, "pending"),
            QueueItemStatus::Accepted => write!(f, "accepted"),
            QueueItemStatus::Rejected => write!(f, "rejected"),
            QueueItemStatus::Cancelled => write!(f, "cancelled"),
            QueueItemStatus::Expired => write!(f, "expired"),
            QueueItemStatus::InProgress => write!(f, "in_progress"),
            QueueItemStatus::Closed => write!(f, "closed"),
        }
    }
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Rejected
                | QueueItemStatus::Cancelled
                | QueueItemStatus::Expired
                | QueueItemStatus::Closed
        )
    }

    /// All statuses reachable from this one.
    pub fn valid_transitions(&self) -> Vec<QueueItemStatus> {
        match self {
            QueueItemStatus::Pending => vec![
                QueueItemStatus::Accepted,
                QueueItemStatus::Rejected,
                QueueItemStatus::Cancelled,
                QueueItemStatus::Expired,
            ],
            QueueItemStatus::Accepted => {
                vec![QueueItemStatus::InProgress, QueueItemStatus::Cancelled]
            }
            QueueItemStatus::InProgress => vec![QueueItemStatus::Closed],
            // Terminal states
            QueueItemStatus::Rejected
            | QueueItemStatus::Cancelled
            | QueueItemStatus::Expired
            | QueueItemStatus::Closed => vec![],
        }
    }

    pub fn can_transition_to(&self, target: &QueueItemStatus) -> bool {
        self.valid_transitions().contains(target)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    NotRequired,
    Pending,
    Paid,
    Expired,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::NotRequired => write!(f, "not_required"),
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Paid => write!(f, "paid"),
            PaymentStatus::Expired => write!(f, "expired"),
        }
    }
}

impl PaymentStatus {
    /// A consultation may only start once payment is settled or was never
    /// asked for.
    pub fn allows_start(&self) -> bool {
        matches!(self, PaymentStatus::NotRequired | PaymentStatus::Paid)
    }
}

impl QueueItem {
    pub fn new_walk_in(patient_user_id: Uuid, doctor_user_id: Uuid, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            doctor_user_id,
            patient_user_id,
            entry_type: QueueEntryType::WalkIn,
            appointment_id: None,
            appointment_start_at: None,
            emergency_group_id: None,
            status: QueueItemStatus::Pending,
            payment_status: PaymentStatus::NotRequired,
            reason: Some(reason),
            consultation_id: None,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            closed_at: None,
        }
    }

    pub fn new_appointment(
        patient_user_id: Uuid,
        doctor_user_id: Uuid,
        appointment_id: Uuid,
        appointment_start_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            doctor_user_id,
            patient_user_id,
            entry_type: QueueEntryType::Appointment,
            appointment_id: Some(appointment_id),
            appointment_start_at: Some(appointment_start_at),
            emergency_group_id: None,
            status: QueueItemStatus::Pending,
            payment_status: PaymentStatus::NotRequired,
            reason: None,
            consultation_id: None,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            closed_at: None,
        }
    }

    pub fn new_emergency(
        patient_user_id: Uuid,
        doctor_user_id: Uuid,
        emergency_group_id: Uuid,
        note: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            doctor_user_id,
            patient_user_id,
            entry_type: QueueEntryType::EmergencyBroadcast,
            appointment_id: None,
            appointment_start_at: None,
            emergency_group_id: Some(emergency_group_id),
            status: QueueItemStatus::Pending,
            payment_status: PaymentStatus::NotRequired,
            reason: Some(note),
            consultation_id: None,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            closed_at: None,
        }
    }

    /// The waiting-room window `[start - lead, start + grace]`.
    /// `None` for entries not tied to an appointment.
    pub fn waiting_window(&self, settings: &QueueSettings) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.appointment_start_at.map(|start| {
            (
                start - Duration::minutes(settings.appointment_lead_minutes),
                start + Duration::minutes(settings.appointment_grace_minutes),
            )
        })
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.doctor_user_id == user_id || self.patient_user_id == user_id
    }
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQueueItemRequest {
    pub doctor_user_id: Uuid,
    pub entry_type: QueueEntryType,
    pub appointment_id: Option<Uuid>,
    pub appointment_start_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEmergencyBroadcastRequest {
    pub candidate_doctor_ids: Vec<Uuid>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectQueueItemRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelQueueItemRequest {
    pub reason: Option<String>,
}

/// Full API representation of a queue item, including the derived fields
/// that are computed at read time and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemView {
    #[serde(flatten)]
    pub item: QueueItem,
    pub is_expired: bool,
    pub display_priority: u8,
}

/// Identifiers a client needs to complete checkout for an enabled charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentHandle {
    pub payment_id: Uuid,
    pub checkout_ref: String,
    pub expires_at: DateTime<Utc>,
}
