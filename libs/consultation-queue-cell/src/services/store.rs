use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{PaymentStatus, QueueItem, QueueItemStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Queue item not found")]
    NotFound,

    #[error("Stored status no longer matches the expected status")]
    Conflict,

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// The status change a transition wants to commit, together with the
/// timestamps it stamps exactly once.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub status: QueueItemStatus,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub consultation_id: Option<Uuid>,
}

impl StatusChange {
    pub fn to(status: QueueItemStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: now,
            accepted_at: None,
            closed_at: None,
            consultation_id: None,
        }
    }

    pub fn with_accepted_at(mut self, at: DateTime<Utc>) -> Self {
        self.accepted_at = Some(at);
        self
    }

    pub fn with_closed_at(mut self, at: DateTime<Utc>) -> Self {
        self.closed_at = Some(at);
        self
    }

    pub fn with_consultation(mut self, id: Uuid) -> Self {
        self.consultation_id = Some(id);
        self
    }
}

/// Persistence seam for queue items; the only component allowed to mutate
/// their state. `transition` is the compare-and-swap every state change
/// rides on: the write commits only if the stored status is still one the
/// caller observed, otherwise the caller gets `Conflict` and nothing moves.
#[async_trait]
pub trait QueueItemStore: Send + Sync {
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError>;

    /// Insert a whole emergency sibling group, all-or-nothing.
    async fn insert_group(&self, items: Vec<QueueItem>) -> Result<Vec<QueueItem>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<QueueItem, StoreError>;

    async fn list_for_doctor(&self, doctor_user_id: Uuid) -> Result<Vec<QueueItem>, StoreError>;

    async fn list_group(&self, emergency_group_id: Uuid) -> Result<Vec<QueueItem>, StoreError>;

    /// Conditionally apply `change` iff the stored status is in `expected`.
    async fn transition(
        &self,
        id: Uuid,
        expected: &[QueueItemStatus],
        change: StatusChange,
    ) -> Result<QueueItem, StoreError>;

    /// Atomically decide an emergency group: apply `accept` to the winner
    /// and `cancel` to every still-pending sibling, in one transaction.
    /// Fails with `Conflict` unless the winner is still pending and no
    /// sibling has reached accepted or beyond. Per-row compare-and-swap
    /// alone cannot enforce that, since the racing accepts touch different
    /// rows of the same group.
    async fn claim_group(
        &self,
        emergency_group_id: Uuid,
        winner_id: Uuid,
        accept: StatusChange,
        cancel: StatusChange,
    ) -> Result<(QueueItem, Vec<QueueItem>), StoreError>;

    async fn set_payment_status(
        &self,
        id: Uuid,
        payment_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError>;
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

/// Single-node store. The map mutex makes every read-modify-write atomic,
/// which is all the optimistic-concurrency contract needs.
#[derive(Default)]
pub struct InMemoryQueueItemStore {
    items: Mutex<HashMap<Uuid, QueueItem>>,
}

impl InMemoryQueueItemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueItemStore for InMemoryQueueItemStore {
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError> {
        let mut items = self.items.lock().await;
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn insert_group(&self, group: Vec<QueueItem>) -> Result<Vec<QueueItem>, StoreError> {
        let mut items = self.items.lock().await;
        for item in &group {
            items.insert(item.id, item.clone());
        }
        Ok(group)
    }

    async fn get(&self, id: Uuid) -> Result<QueueItem, StoreError> {
        let items = self.items.lock().await;
        items.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_for_doctor(&self, doctor_user_id: Uuid) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.items.lock().await;
        let mut matched: Vec<QueueItem> = items
            .values()
            .filter(|item| item.doctor_user_id == doctor_user_id)
            .cloned()
            .collect();
        matched.sort_by_key(|item| item.created_at);
        Ok(matched)
    }

    async fn list_group(&self, emergency_group_id: Uuid) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.items.lock().await;
        let mut matched: Vec<QueueItem> = items
            .values()
            .filter(|item| item.emergency_group_id == Some(emergency_group_id))
            .cloned()
            .collect();
        matched.sort_by_key(|item| item.created_at);
        Ok(matched)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[QueueItemStatus],
        change: StatusChange,
    ) -> Result<QueueItem, StoreError> {
        let mut items = self.items.lock().await;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound)?;

        if !expected.contains(&item.status) {
            return Err(StoreError::Conflict);
        }

        item.status = change.status;
        item.updated_at = change.updated_at;
        if let Some(at) = change.accepted_at {
            item.accepted_at = Some(at);
        }
        if let Some(at) = change.closed_at {
            item.closed_at = Some(at);
        }
        if let Some(consultation_id) = change.consultation_id {
            item.consultation_id = Some(consultation_id);
        }

        Ok(item.clone())
    }

    async fn claim_group(
        &self,
        emergency_group_id: Uuid,
        winner_id: Uuid,
        accept: StatusChange,
        cancel: StatusChange,
    ) -> Result<(QueueItem, Vec<QueueItem>), StoreError> {
        let mut items = self.items.lock().await;

        {
            let winner = items.get(&winner_id).ok_or(StoreError::NotFound)?;
            if winner.emergency_group_id != Some(emergency_group_id) {
                return Err(StoreError::NotFound);
            }
            if winner.status != QueueItemStatus::Pending {
                return Err(StoreError::Conflict);
            }
        }

        // Invariant guard: at most one group member ever reaches accepted.
        let group_decided = items.values().any(|item| {
            item.emergency_group_id == Some(emergency_group_id)
                && matches!(
                    item.status,
                    QueueItemStatus::Accepted
                        | QueueItemStatus::InProgress
                        | QueueItemStatus::Closed
                )
        });
        if group_decided {
            return Err(StoreError::Conflict);
        }

        let loser_ids: Vec<Uuid> = items
            .values()
            .filter(|item| {
                item.emergency_group_id == Some(emergency_group_id)
                    && item.id != winner_id
                    && item.status == QueueItemStatus::Pending
            })
            .map(|item| item.id)
            .collect();

        let winner = items.get_mut(&winner_id).expect("winner checked above");
        winner.status = accept.status;
        winner.updated_at = accept.updated_at;
        if let Some(at) = accept.accepted_at {
            winner.accepted_at = Some(at);
        }
        let winner = winner.clone();

        let mut cancelled = Vec::with_capacity(loser_ids.len());
        for loser_id in loser_ids {
            let loser = items.get_mut(&loser_id).expect("loser ids come from the map");
            loser.status = cancel.status;
            loser.updated_at = cancel.updated_at;
            cancelled.push(loser.clone());
        }

        Ok((winner, cancelled))
    }

    async fn set_payment_status(
        &self,
        id: Uuid,
        payment_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        let mut items = self.items.lock().await;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound)?;
        item.payment_status = payment_status;
        item.updated_at = now;
        Ok(item.clone())
    }
}

// ==============================================================================
// SUPABASE STORE
// ==============================================================================

const QUEUE_ITEMS_TABLE: &str = "queue_items";

/// PostgREST-backed store. Conditional updates are expressed as PATCH
/// requests filtered on both id and current status; zero returned rows
/// means the optimistic check failed.
pub struct SupabaseQueueItemStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseQueueItemStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    fn status_filter(expected: &[QueueItemStatus]) -> String {
        let statuses: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        format!("status=in.({})", statuses.join(","))
    }

    fn parse_rows(rows: Vec<serde_json::Value>) -> Result<Vec<QueueItem>, StoreError> {
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(|e| StoreError::Backend(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl QueueItemStore for SupabaseQueueItemStore {
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError> {
        let row = serde_json::to_value(&item).map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = self
            .supabase
            .insert_rows(QUEUE_ITEMS_TABLE, json!([row]), None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::parse_rows(rows)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend("insert returned no rows".to_string()))
    }

    async fn insert_group(&self, group: Vec<QueueItem>) -> Result<Vec<QueueItem>, StoreError> {
        // One POST with the full sibling array; PostgREST runs it as a
        // single statement, so the fan-out is all-or-nothing.
        let rows = serde_json::to_value(&group).map_err(|e| StoreError::Backend(e.to_string()))?;
        let stored = self
            .supabase
            .insert_rows(QUEUE_ITEMS_TABLE, rows, None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::parse_rows(stored)
    }

    async fn get(&self, id: Uuid) -> Result<QueueItem, StoreError> {
        let rows = self
            .supabase
            .select_rows(QUEUE_ITEMS_TABLE, &format!("id=eq.{}", id), None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::parse_rows(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    async fn list_for_doctor(&self, doctor_user_id: Uuid) -> Result<Vec<QueueItem>, StoreError> {
        let filter = format!("doctor_user_id=eq.{}&order=created_at.asc", doctor_user_id);
        let rows = self
            .supabase
            .select_rows(QUEUE_ITEMS_TABLE, &filter, None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::parse_rows(rows)
    }

    async fn list_group(&self, emergency_group_id: Uuid) -> Result<Vec<QueueItem>, StoreError> {
        let filter = format!(
            "emergency_group_id=eq.{}&order=created_at.asc",
            emergency_group_id
        );
        let rows = self
            .supabase
            .select_rows(QUEUE_ITEMS_TABLE, &filter, None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::parse_rows(rows)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[QueueItemStatus],
        change: StatusChange,
    ) -> Result<QueueItem, StoreError> {
        let filter = format!("id=eq.{}&{}", id, Self::status_filter(expected));

        let mut patch = json!({
            "status": change.status,
            "updated_at": change.updated_at,
        });
        if let Some(at) = change.accepted_at {
            patch["accepted_at"] = json!(at);
        }
        if let Some(at) = change.closed_at {
            patch["closed_at"] = json!(at);
        }
        if let Some(consultation_id) = change.consultation_id {
            patch["consultation_id"] = json!(consultation_id);
        }

        let rows = self
            .supabase
            .patch_rows(QUEUE_ITEMS_TABLE, &filter, patch, None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match Self::parse_rows(rows)?.into_iter().next() {
            Some(item) => Ok(item),
            None => {
                // The filter matched nothing: either the row is gone or its
                // status moved. Re-read to tell the two apart.
                debug!("Conditional update on {} matched no rows", id);
                self.get(id).await?;
                Err(StoreError::Conflict)
            }
        }
    }

    async fn claim_group(
        &self,
        emergency_group_id: Uuid,
        winner_id: Uuid,
        accept: StatusChange,
        cancel: StatusChange,
    ) -> Result<(QueueItem, Vec<QueueItem>), StoreError> {
        // One stored procedure call = one transaction: the function accepts
        // the winner only while it is pending and no sibling has been
        // accepted, cancels the remaining pending siblings, and returns the
        // whole group.
        let body = json!({
            "p_group_id": emergency_group_id,
            "p_winner_id": winner_id,
            "p_accepted_at": accept.accepted_at,
            "p_updated_at": accept.updated_at,
            "p_cancelled_at": cancel.updated_at,
        });
        let rows: Vec<serde_json::Value> = self
            .supabase
            .request(
                reqwest::Method::POST,
                "/rest/v1/rpc/claim_emergency_group",
                None,
                Some(body),
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let group = Self::parse_rows(rows)?;
        let winner = group
            .iter()
            .find(|item| item.id == winner_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        if winner.status != QueueItemStatus::Accepted {
            return Err(StoreError::Conflict);
        }

        let cancelled = group
            .into_iter()
            .filter(|item| item.id != winner_id && item.updated_at == cancel.updated_at)
            .collect();
        Ok((winner, cancelled))
    }

    async fn set_payment_status(
        &self,
        id: Uuid,
        payment_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        let patch = json!({
            "payment_status": payment_status,
            "updated_at": now,
        });
        let rows = self
            .supabase
            .patch_rows(QUEUE_ITEMS_TABLE, &format!("id=eq.{}", id), patch, None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::parse_rows(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }
}
