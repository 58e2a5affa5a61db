use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::Duration;
use futures::future::join_all;
use uuid::Uuid;

use consultation_queue_cell::*;
use shared_models::auth::{Actor, ActorRole};

use super::*;

// ==============================================================================
// CREATION
// ==============================================================================

#[tokio::test]
async fn broadcast_creates_one_pending_sibling_per_candidate() {
    let e = engine();
    let pat = patient();
    let candidates: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    let siblings = e
        .broadcast
        .create_broadcast(pat, broadcast_request(candidates.clone()))
        .await
        .expect("broadcast creation succeeds");

    assert_eq!(siblings.len(), 3);
    let group_id = siblings[0].emergency_group_id.unwrap();
    for (sibling, doctor_id) in siblings.iter().zip(candidates) {
        assert_eq!(sibling.status, QueueItemStatus::Pending);
        assert_eq!(sibling.entry_type, QueueEntryType::EmergencyBroadcast);
        assert_eq!(sibling.emergency_group_id, Some(group_id));
        assert_eq!(sibling.doctor_user_id, doctor_id);
        assert_eq!(sibling.patient_user_id, pat.id);
    }
}

#[tokio::test]
async fn duplicate_candidates_collapse_to_one_sibling() {
    let e = engine();
    let repeated = Uuid::new_v4();

    let siblings = e
        .broadcast
        .create_broadcast(patient(), broadcast_request(vec![repeated, repeated]))
        .await
        .unwrap();
    assert_eq!(siblings.len(), 1);
}

#[tokio::test]
async fn fan_out_above_the_cap_is_rejected_before_anything_happens() {
    let e = engine();
    let pat = patient();
    let candidates: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
    let first_doctor = candidates[0];

    let err = e
        .broadcast
        .create_broadcast(pat, broadcast_request(candidates))
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::TooManyCandidates { max: 5 });

    // No rows and no quota were consumed.
    let leftovers = e.store.list_for_doctor(first_doctor).await.unwrap();
    assert!(leftovers.is_empty());
    for _ in 0..3 {
        e.broadcast
            .create_broadcast(pat, broadcast_request(vec![Uuid::new_v4()]))
            .await
            .expect("cap rejections must not eat quota");
    }
}

#[tokio::test]
async fn broadcast_needs_a_note_and_candidates() {
    let e = engine();

    let mut request = broadcast_request(vec![Uuid::new_v4()]);
    request.note = "  ".to_string();
    assert_matches!(
        e.broadcast
            .create_broadcast(patient(), request)
            .await
            .unwrap_err(),
        QueueError::InvalidArgument(_)
    );

    assert_matches!(
        e.broadcast
            .create_broadcast(patient(), broadcast_request(vec![]))
            .await
            .unwrap_err(),
        QueueError::InvalidArgument(_)
    );
}

#[tokio::test]
async fn only_patients_may_broadcast() {
    let e = engine();
    let err = e
        .broadcast
        .create_broadcast(doctor(), broadcast_request(vec![Uuid::new_v4()]))
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::Forbidden(_));
}

// ==============================================================================
// QUOTA
// ==============================================================================

#[tokio::test]
async fn quota_ceiling_rejects_and_resets() {
    let e = engine();
    let pat = patient();

    // Default daily ceiling is three broadcasts.
    for _ in 0..3 {
        e.broadcast
            .create_broadcast(pat, broadcast_request(vec![Uuid::new_v4()]))
            .await
            .unwrap();
    }

    let blocked_doctor = Uuid::new_v4();
    let err = e
        .broadcast
        .create_broadcast(pat, broadcast_request(vec![blocked_doctor]))
        .await
        .unwrap_err();
    match err {
        QueueError::EmergencyLimitReached {
            reset_at,
            retry_after_seconds,
        } => {
            assert!(reset_at > base_time());
            assert!(retry_after_seconds > 0);
        }
        other => panic!("expected EmergencyLimitReached, got {:?}", other),
    }

    // The rejected broadcast created nothing.
    assert!(e.store.list_for_doctor(blocked_doctor).await.unwrap().is_empty());

    // Past the daily reset the patient may broadcast again.
    e.clock.advance(Duration::days(1));
    e.broadcast
        .create_broadcast(pat, broadcast_request(vec![Uuid::new_v4()]))
        .await
        .expect("quota resets after the window boundary");
}

// ==============================================================================
// RACE RESOLUTION
// ==============================================================================

#[tokio::test]
async fn accepting_one_sibling_cancels_the_rest() {
    let e = engine();
    let pat = patient();
    let candidates: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    let siblings = e
        .broadcast
        .create_broadcast(pat, broadcast_request(candidates.clone()))
        .await
        .unwrap();

    let winner = Actor {
        id: candidates[1],
        role: ActorRole::Doctor,
    };
    let accepted = e.lifecycle.accept(winner, siblings[1].id).await.unwrap();
    assert_eq!(accepted.item.status, QueueItemStatus::Accepted);

    let group = e
        .store
        .list_group(siblings[0].emergency_group_id.unwrap())
        .await
        .unwrap();
    for sibling in group {
        if sibling.id == siblings[1].id {
            assert_eq!(sibling.status, QueueItemStatus::Accepted);
        } else {
            assert_eq!(sibling.status, QueueItemStatus::Cancelled);
        }
    }
}

#[tokio::test]
async fn losers_of_the_race_observe_a_conflict() {
    let e = engine();
    let pat = patient();
    let candidates: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();

    let siblings = e
        .broadcast
        .create_broadcast(pat, broadcast_request(candidates.clone()))
        .await
        .unwrap();

    let winner = Actor {
        id: candidates[0],
        role: ActorRole::Doctor,
    };
    e.lifecycle.accept(winner, siblings[0].id).await.unwrap();

    let loser = Actor {
        id: candidates[1],
        role: ActorRole::Doctor,
    };
    let err = e.lifecycle.accept(loser, siblings[1].id).await.unwrap_err();
    assert_matches!(err, QueueError::Conflict(_));
}

#[tokio::test]
async fn concurrent_accepts_produce_exactly_one_winner() {
    let e = engine();
    let pat = patient();
    let candidates: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

    let siblings = e
        .broadcast
        .create_broadcast(pat, broadcast_request(candidates.clone()))
        .await
        .unwrap();
    let group_id = siblings[0].emergency_group_id.unwrap();

    // Every candidate doctor races to accept their own sibling.
    let lifecycle = e.lifecycle.clone();
    let tasks: Vec<_> = siblings
        .iter()
        .map(|sibling| {
            let lifecycle = Arc::clone(&lifecycle);
            let doctor = Actor {
                id: sibling.doctor_user_id,
                role: ActorRole::Doctor,
            };
            let id = sibling.id;
            tokio::spawn(async move { lifecycle.accept(doctor, id).await })
        })
        .collect();

    let outcomes: Vec<Result<_, QueueError>> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("accept task must not panic"))
        .collect();

    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one sibling accept may win");
    for outcome in &outcomes {
        if let Err(err) = outcome {
            assert_matches!(err, QueueError::Conflict(_));
        }
    }

    // At no point may a second sibling reach accepted or beyond.
    let group = e.store.list_group(group_id).await.unwrap();
    let accepted = group
        .iter()
        .filter(|item| {
            matches!(
                item.status,
                QueueItemStatus::Accepted | QueueItemStatus::InProgress | QueueItemStatus::Closed
            )
        })
        .count();
    let cancelled = group
        .iter()
        .filter(|item| item.status == QueueItemStatus::Cancelled)
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(cancelled, group.len() - 1);
}

#[tokio::test]
async fn resolution_is_idempotent() {
    let e = engine();
    let pat = patient();
    let candidates: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    let siblings = e
        .broadcast
        .create_broadcast(pat, broadcast_request(candidates.clone()))
        .await
        .unwrap();
    let group_id = siblings[0].emergency_group_id.unwrap();

    let winner = Actor {
        id: candidates[0],
        role: ActorRole::Doctor,
    };
    e.lifecycle.accept(winner, siblings[0].id).await.unwrap();

    // A compensating retry of the fan-out cancellation changes nothing.
    e.broadcast
        .resolve_accept(group_id, siblings[0].id)
        .await
        .unwrap();

    let group = e.store.list_group(group_id).await.unwrap();
    assert_eq!(
        group
            .iter()
            .filter(|item| item.status == QueueItemStatus::Accepted)
            .count(),
        1
    );
}
