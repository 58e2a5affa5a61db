use assert_matches::assert_matches;
use chrono::Duration;
use uuid::Uuid;

use consultation_queue_cell::*;
use shared_config::QueueSettings;

use super::*;

// ==============================================================================
// CREATION
// ==============================================================================

#[tokio::test]
async fn patient_creates_walk_in_entry() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .expect("walk-in creation succeeds");

    assert_eq!(view.item.status, QueueItemStatus::Pending);
    assert_eq!(view.item.entry_type, QueueEntryType::WalkIn);
    assert_eq!(view.item.patient_user_id, pat.id);
    assert_eq!(view.item.doctor_user_id, doc.id);
    assert_eq!(view.item.payment_status, PaymentStatus::NotRequired);
    assert!(!view.is_expired);
}

#[tokio::test]
async fn walk_in_without_reason_is_rejected() {
    let e = engine();
    let mut request = walk_in_request(doctor().id);
    request.reason = Some("   ".to_string());

    let err = e
        .lifecycle
        .create_queue_item(patient(), request)
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::InvalidArgument(_));
}

#[tokio::test]
async fn doctors_cannot_join_the_queue() {
    let e = engine();
    let doc = doctor();

    let err = e
        .lifecycle
        .create_queue_item(doc, walk_in_request(doc.id))
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::Forbidden(_));
}

#[tokio::test]
async fn emergency_entries_cannot_be_created_directly() {
    let e = engine();
    let mut request = walk_in_request(doctor().id);
    request.entry_type = QueueEntryType::EmergencyBroadcast;

    let err = e
        .lifecycle
        .create_queue_item(patient(), request)
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::InvalidArgument(_));
}

#[tokio::test]
async fn appointment_entry_requires_appointment_fields() {
    let e = engine();
    let mut request = appointment_request(doctor().id, base_time() + Duration::minutes(10));
    request.appointment_id = None;

    let err = e
        .lifecycle
        .create_queue_item(patient(), request)
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::InvalidArgument(_));
}

#[tokio::test]
async fn appointment_entry_cannot_be_created_before_window_opens() {
    let e = engine();

    // Window opens 15 minutes before start; 20 minutes out is too early.
    let err = e
        .lifecycle
        .create_queue_item(
            patient(),
            appointment_request(doctor().id, base_time() + Duration::minutes(20)),
        )
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::OutOfWindow { .. });

    let view = e
        .lifecycle
        .create_queue_item(
            patient(),
            appointment_request(doctor().id, base_time() + Duration::minutes(10)),
        )
        .await
        .expect("creation inside the window succeeds");
    assert_eq!(view.item.status, QueueItemStatus::Pending);
}

// ==============================================================================
// WAITING-ROOM WINDOW
// ==============================================================================

#[tokio::test]
async fn accept_respects_the_waiting_room_window() {
    let e = engine();
    let doc = doctor();
    let pat = patient();
    let start_at = base_time() + Duration::minutes(30);

    // Seed the row directly so the accept-side window check is exercised
    // in isolation from the creation-side one.
    let item = QueueItem::new_appointment(pat.id, doc.id, Uuid::new_v4(), start_at, base_time());
    e.store.insert(item.clone()).await.unwrap();

    // 30 minutes early: the waiting room is not open yet.
    let err = e.lifecycle.accept(doc, item.id).await.unwrap_err();
    match err {
        QueueError::OutOfWindow { opens_at, .. } => {
            assert_eq!(opens_at, start_at - Duration::minutes(15));
        }
        other => panic!("expected OutOfWindow, got {:?}", other),
    }

    // Ten minutes before start: inside the window.
    e.clock.set(start_at - Duration::minutes(10));
    let view = e.lifecycle.accept(doc, item.id).await.unwrap();
    assert_eq!(view.item.status, QueueItemStatus::Accepted);
    assert_eq!(view.item.accepted_at, Some(start_at - Duration::minutes(10)));
}

#[tokio::test]
async fn accept_after_grace_finds_the_item_expired() {
    let e = engine();
    let doc = doctor();
    let pat = patient();
    let start_at = base_time() + Duration::minutes(30);

    let item = QueueItem::new_appointment(pat.id, doc.id, Uuid::new_v4(), start_at, base_time());
    e.store.insert(item.clone()).await.unwrap();

    // Twenty minutes past start is beyond the 15-minute grace.
    e.clock.set(start_at + Duration::minutes(20));
    let err = e.lifecycle.accept(doc, item.id).await.unwrap_err();
    assert_matches!(err, QueueError::InvalidState { status: QueueItemStatus::Expired, .. });

    let stored = e.store.get(item.id).await.unwrap();
    assert_eq!(stored.status, QueueItemStatus::Expired);
}

// ==============================================================================
// LAZY EXPIRATION
// ==============================================================================

#[tokio::test]
async fn expiry_is_materialized_on_read_and_never_reverts() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    e.clock.advance(Duration::minutes(31));

    // Any number of reads yields expired.
    for _ in 0..3 {
        let read = e.lifecycle.get_queue_item(pat, id).await.unwrap();
        assert!(read.is_expired);
        assert_eq!(read.item.status, QueueItemStatus::Expired);
    }

    // And the doctor's list agrees, sorting it last.
    let listed = e.lifecycle.list_queue_for_doctor(doc).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_expired);
    assert_eq!(listed[0].display_priority, 4);
}

#[tokio::test]
async fn expired_entries_cannot_be_accepted() {
    let e = engine();
    let doc = doctor();

    let view = e
        .lifecycle
        .create_queue_item(patient(), walk_in_request(doc.id))
        .await
        .unwrap();

    e.clock.advance(Duration::minutes(31));

    let err = e.lifecycle.accept(doc, view.item.id).await.unwrap_err();
    assert_matches!(err, QueueError::InvalidState { status: QueueItemStatus::Expired, .. });
}

// ==============================================================================
// PAYMENT GATING
// ==============================================================================

fn long_wait_settings() -> QueueSettings {
    QueueSettings {
        max_wait_minutes: 240,
        ..QueueSettings::default()
    }
}

#[tokio::test]
async fn pending_payment_blocks_accept_until_paid() {
    let e = engine_with(long_wait_settings());
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    let (handle, charged) = e.lifecycle.enable_payment(doc, id).await.unwrap();
    assert_eq!(charged.item.payment_status, PaymentStatus::Pending);
    assert!(handle.expires_at > base_time());

    let err = e.lifecycle.accept(doc, id).await.unwrap_err();
    assert_matches!(err, QueueError::PaymentRequired);

    let paid = e.lifecycle.complete_payment(pat, id).await.unwrap();
    assert_eq!(paid.item.payment_status, PaymentStatus::Paid);

    let accepted = e.lifecycle.accept(doc, id).await.unwrap();
    assert_eq!(accepted.item.status, QueueItemStatus::Accepted);
}

#[tokio::test]
async fn lapsed_checkout_window_surfaces_as_payment_window_expired() {
    let e = engine_with(long_wait_settings());
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    e.lifecycle.enable_payment(doc, id).await.unwrap();
    e.clock.advance(Duration::minutes(31));

    let err = e.lifecycle.accept(doc, id).await.unwrap_err();
    assert_matches!(err, QueueError::PaymentWindowExpired);

    let err = e.lifecycle.complete_payment(pat, id).await.unwrap_err();
    assert_matches!(err, QueueError::PaymentWindowExpired);

    // The stored status was synchronized from the gate on the way.
    let stored = e.store.get(id).await.unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Expired);
}

#[tokio::test]
async fn start_requires_settled_payment() {
    let e = engine_with(long_wait_settings());
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    e.lifecycle.accept(doc, id).await.unwrap();

    // Doctor decides to charge after accepting.
    e.lifecycle.enable_payment(doc, id).await.unwrap();
    let err = e.lifecycle.start(doc, id).await.unwrap_err();
    assert_matches!(err, QueueError::PaymentRequired);

    e.lifecycle.complete_payment(pat, id).await.unwrap();
    let started = e.lifecycle.start(doc, id).await.unwrap();
    assert_eq!(started.item.status, QueueItemStatus::InProgress);
    assert!(started.item.consultation_id.is_some());
}

#[tokio::test]
async fn appointment_entries_cannot_be_charged() {
    let e = engine();
    let doc = doctor();

    let view = e
        .lifecycle
        .create_queue_item(
            patient(),
            appointment_request(doc.id, base_time() + Duration::minutes(10)),
        )
        .await
        .unwrap();

    let err = e.lifecycle.enable_payment(doc, view.item.id).await.unwrap_err();
    assert_matches!(err, QueueError::InvalidArgument(_));
}

// ==============================================================================
// FULL LIFECYCLE AND TERMINALITY
// ==============================================================================

#[tokio::test]
async fn accept_start_close_happy_path() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    let accepted = e.lifecycle.accept(doc, id).await.unwrap();
    assert_eq!(accepted.item.status, QueueItemStatus::Accepted);

    let started = e.lifecycle.start(doc, id).await.unwrap();
    assert_eq!(started.item.status, QueueItemStatus::InProgress);
    let consultation_id = started.item.consultation_id.unwrap();

    let closed = e.lifecycle.close(doc, id).await.unwrap();
    assert_eq!(closed.item.status, QueueItemStatus::Closed);
    assert_eq!(closed.item.consultation_id, Some(consultation_id));
    assert!(closed.item.closed_at.is_some());
}

#[tokio::test]
async fn terminal_items_refuse_every_further_transition() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    e.lifecycle.accept(doc, id).await.unwrap();
    e.lifecycle.start(doc, id).await.unwrap();
    e.lifecycle.close(doc, id).await.unwrap();

    assert_matches!(
        e.lifecycle.accept(doc, id).await.unwrap_err(),
        QueueError::InvalidState { .. }
    );
    assert_matches!(
        e.lifecycle
            .reject(doc, id, "too late".to_string())
            .await
            .unwrap_err(),
        QueueError::InvalidState { .. }
    );
    assert_matches!(
        e.lifecycle.cancel(pat, id, None).await.unwrap_err(),
        QueueError::InvalidState { .. }
    );
    assert_matches!(
        e.lifecycle.start(doc, id).await.unwrap_err(),
        QueueError::InvalidState { .. }
    );
    assert_matches!(
        e.lifecycle.close(doc, id).await.unwrap_err(),
        QueueError::InvalidState { .. }
    );
}

#[tokio::test]
async fn reject_is_for_pending_entries_only() {
    let e = engine();
    let doc = doctor();

    let view = e
        .lifecycle
        .create_queue_item(patient(), walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    e.lifecycle.accept(doc, id).await.unwrap();
    let err = e
        .lifecycle
        .reject(doc, id, "changed my mind".to_string())
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::InvalidState { status: QueueItemStatus::Accepted, .. });
}

// ==============================================================================
// CANCELLATION
// ==============================================================================

#[tokio::test]
async fn either_participant_may_cancel_before_start() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    // Patient cancels a pending entry.
    let first = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let cancelled = e.lifecycle.cancel(pat, first.item.id, None).await.unwrap();
    assert_eq!(cancelled.item.status, QueueItemStatus::Cancelled);

    // Doctor cancels an accepted one.
    let second = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    e.lifecycle.accept(doc, second.item.id).await.unwrap();
    let cancelled = e
        .lifecycle
        .cancel(doc, second.item.id, Some("equipment failure".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.item.status, QueueItemStatus::Cancelled);
}

#[tokio::test]
async fn cancel_works_past_the_expiry_deadline() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();

    // Deadline passed but nothing read the item yet, so it is still stored
    // pending; cleanup cancellation goes through.
    e.clock.advance(Duration::minutes(45));
    let cancelled = e.lifecycle.cancel(pat, view.item.id, None).await.unwrap();
    assert_eq!(cancelled.item.status, QueueItemStatus::Cancelled);
}

#[tokio::test]
async fn strangers_cannot_touch_an_item() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    let id = view.item.id;

    let other_doctor = doctor();
    assert_matches!(
        e.lifecycle.accept(other_doctor, id).await.unwrap_err(),
        QueueError::Forbidden(_)
    );

    let other_patient = patient();
    assert_matches!(
        e.lifecycle.cancel(other_patient, id, None).await.unwrap_err(),
        QueueError::Forbidden(_)
    );
    assert_matches!(
        e.lifecycle.get_queue_item(other_patient, id).await.unwrap_err(),
        QueueError::Forbidden(_)
    );
}

// ==============================================================================
// QUEUE VIEW
// ==============================================================================

#[tokio::test]
async fn doctor_queue_hides_history_and_orders_by_tier() {
    let e = engine();
    let doc = doctor();
    let pat = patient();

    // An accepted walk-in, a pending walk-in, and a rejected one.
    let accepted = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    e.lifecycle.accept(doc, accepted.item.id).await.unwrap();

    e.clock.advance(Duration::minutes(1));
    let pending = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();

    e.clock.advance(Duration::minutes(1));
    let rejected = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    e.lifecycle
        .reject(doc, rejected.item.id, "outside specialty".to_string())
        .await
        .unwrap();

    let listed = e.lifecycle.list_queue_for_doctor(doc).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|view| view.item.id).collect();
    assert_eq!(ids, vec![accepted.item.id, pending.item.id]);
    assert_eq!(listed[0].display_priority, 0);
    assert_eq!(listed[1].display_priority, 3);
}

#[tokio::test]
async fn patients_have_no_queue_view() {
    let e = engine();
    let err = e
        .lifecycle
        .list_queue_for_doctor(patient())
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::Forbidden(_));
}

#[tokio::test]
async fn unknown_items_are_not_found() {
    let e = engine();
    let err = e
        .lifecycle
        .get_queue_item(patient(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::NotFound(_));
}

// ==============================================================================
// EVENTS
// ==============================================================================

#[tokio::test]
async fn transitions_emit_domain_events() {
    let e = engine();
    let doc = doctor();
    let pat = patient();
    let mut rx = e.events.subscribe();

    let view = e
        .lifecycle
        .create_queue_item(pat, walk_in_request(doc.id))
        .await
        .unwrap();
    e.lifecycle.accept(doc, view.item.id).await.unwrap();
    e.lifecycle.start(doc, view.item.id).await.unwrap();
    e.lifecycle.close(doc, view.item.id).await.unwrap();

    let kinds: Vec<QueueEventKind> = vec![
        rx.recv().await.unwrap().kind,
        rx.recv().await.unwrap().kind,
        rx.recv().await.unwrap().kind,
    ];
    assert_eq!(
        kinds,
        vec![
            QueueEventKind::Accepted,
            QueueEventKind::Started,
            QueueEventKind::Closed,
        ]
    );
}
