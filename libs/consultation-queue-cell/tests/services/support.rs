use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use consultation_queue_cell::*;
use shared_config::QueueSettings;
use shared_models::auth::{Actor, ActorRole};

/// All services wired onto the in-memory store, gate, and quota counters
/// with a manual clock, so tests travel in time instead of sleeping.
pub struct TestEngine {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryQueueItemStore>,
    pub gate: Arc<InMemoryPaymentGate>,
    pub events: Arc<BroadcastEventSink>,
    pub lifecycle: Arc<QueueLifecycleService>,
    pub broadcast: Arc<EmergencyBroadcastService>,
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
}

pub fn engine() -> TestEngine {
    engine_with(QueueSettings::default())
}

pub fn engine_with(settings: QueueSettings) -> TestEngine {
    let clock = Arc::new(ManualClock::new(base_time()));
    let store = Arc::new(InMemoryQueueItemStore::new());
    let gate = Arc::new(InMemoryPaymentGate::new(
        clock.clone(),
        settings.payment_window_minutes,
    ));
    let events = Arc::new(BroadcastEventSink::new(64));

    let tracker = EmergencyQuotaTracker::new(
        Arc::new(InMemoryQuotaStore::new()),
        settings.emergency_daily_limit,
        settings.emergency_monthly_limit,
    );

    let broadcast = Arc::new(EmergencyBroadcastService::new(
        store.clone(),
        tracker,
        events.clone(),
        clock.clone(),
        settings.clone(),
    ));

    let lifecycle = Arc::new(QueueLifecycleService::new(
        store.clone(),
        gate.clone(),
        events.clone(),
        clock.clone(),
        broadcast.clone(),
        settings,
    ));

    TestEngine {
        clock,
        store,
        gate,
        events,
        lifecycle,
        broadcast,
    }
}

pub fn doctor() -> Actor {
    Actor {
        id: Uuid::new_v4(),
        role: ActorRole::Doctor,
    }
}

pub fn patient() -> Actor {
    Actor {
        id: Uuid::new_v4(),
        role: ActorRole::Patient,
    }
}

pub fn walk_in_request(doctor_id: Uuid) -> CreateQueueItemRequest {
    CreateQueueItemRequest {
        doctor_user_id: doctor_id,
        entry_type: QueueEntryType::WalkIn,
        appointment_id: None,
        appointment_start_at: None,
        reason: Some("persistent cough".to_string()),
    }
}

pub fn appointment_request(doctor_id: Uuid, start_at: DateTime<Utc>) -> CreateQueueItemRequest {
    CreateQueueItemRequest {
        doctor_user_id: doctor_id,
        entry_type: QueueEntryType::Appointment,
        appointment_id: Some(Uuid::new_v4()),
        appointment_start_at: Some(start_at),
        reason: None,
    }
}

pub fn broadcast_request(candidates: Vec<Uuid>) -> CreateEmergencyBroadcastRequest {
    CreateEmergencyBroadcastRequest {
        candidate_doctor_ids: candidates,
        note: "sudden chest pain".to_string(),
    }
}
