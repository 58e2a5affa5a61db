use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::QueueError;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Quota exhausted, resets at {reset_at}")]
    Exhausted { reset_at: DateTime<Utc> },

    #[error("Quota store error: {0}")]
    Backend(String),
}

/// The two rolling windows an emergency broadcast is counted against.
#[derive(Debug, Clone, Copy)]
pub struct QuotaWindows {
    pub day_reset_at: DateTime<Utc>,
    pub month_reset_at: DateTime<Utc>,
    pub daily_limit: u32,
    pub monthly_limit: u32,
}

/// Counter store for emergency-broadcast quotas. The increment must be
/// atomic with respect to concurrent broadcasts by the same patient:
/// increment-if-below-ceiling, never increment-then-check from two racers.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn try_increment(
        &self,
        patient_id: Uuid,
        now: DateTime<Utc>,
        windows: QuotaWindows,
    ) -> Result<(), QuotaError>;
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

/// Process-local quota counters keyed by patient and window bucket.
#[derive(Default)]
pub struct InMemoryQuotaStore {
    counters: Mutex<HashMap<String, u32>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn day_key(patient_id: Uuid, now: DateTime<Utc>) -> String {
        format!("emergency_quota:{}:d:{}", patient_id, now.date_naive())
    }

    fn month_key(patient_id: Uuid, now: DateTime<Utc>) -> String {
        format!(
            "emergency_quota:{}:m:{}-{:02}",
            patient_id,
            now.year(),
            now.month()
        )
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn try_increment(
        &self,
        patient_id: Uuid,
        now: DateTime<Utc>,
        windows: QuotaWindows,
    ) -> Result<(), QuotaError> {
        let mut counters = self.counters.lock().await;

        let day_key = Self::day_key(patient_id, now);
        let month_key = Self::month_key(patient_id, now);

        let day_count = counters.get(&day_key).copied().unwrap_or(0);
        let month_count = counters.get(&month_key).copied().unwrap_or(0);

        if day_count >= windows.daily_limit {
            return Err(QuotaError::Exhausted {
                reset_at: windows.day_reset_at,
            });
        }
        if month_count >= windows.monthly_limit {
            return Err(QuotaError::Exhausted {
                reset_at: windows.month_reset_at,
            });
        }

        counters.insert(day_key, day_count + 1);
        counters.insert(month_key, month_count + 1);
        Ok(())
    }
}

// ==============================================================================
// REDIS STORE
// ==============================================================================

/// Redis-backed counters shared across process instances behind a load
/// balancer. INCR is atomic; an increment that lands past the ceiling is
/// rolled back before rejecting.
pub struct RedisQuotaStore {
    pool: Pool,
}

impl RedisQuotaStore {
    pub fn new(redis_url: &str) -> Result<Self, QuotaError> {
        let cfg = Config::from_url(redis_url.to_string());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QuotaError::Backend(format!("Pool creation error: {}", e)))?;
        info!("Redis quota store initialized");
        Ok(Self { pool })
    }

    async fn bump(
        &self,
        conn: &mut deadpool_redis::Connection,
        key: &str,
        limit: u32,
        expires_in: Duration,
        reset_at: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        let count: u32 = conn
            .incr(key, 1u32)
            .await
            .map_err(|e| QuotaError::Backend(e.to_string()))?;

        if count == 1 {
            let ttl = expires_in.num_seconds().max(1) as i64;
            let _: () = conn
                .expire(key, ttl)
                .await
                .map_err(|e| QuotaError::Backend(e.to_string()))?;
        }

        if count > limit {
            let _: () = conn
                .decr(key, 1u32)
                .await
                .map_err(|e| QuotaError::Backend(e.to_string()))?;
            return Err(QuotaError::Exhausted { reset_at });
        }

        Ok(())
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn try_increment(
        &self,
        patient_id: Uuid,
        now: DateTime<Utc>,
        windows: QuotaWindows,
    ) -> Result<(), QuotaError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QuotaError::Backend(e.to_string()))?;

        let day_key = InMemoryQuotaStore::day_key(patient_id, now);
        let month_key = InMemoryQuotaStore::month_key(patient_id, now);

        self.bump(
            &mut conn,
            &day_key,
            windows.daily_limit,
            windows.day_reset_at - now,
            windows.day_reset_at,
        )
        .await?;

        if let Err(e) = self
            .bump(
                &mut conn,
                &month_key,
                windows.monthly_limit,
                windows.month_reset_at - now,
                windows.month_reset_at,
            )
            .await
        {
            // Roll back the daily bump so a monthly rejection does not eat
            // daily budget.
            let _: Result<(), _> = conn.decr(&day_key, 1u32).await;
            return Err(e);
        }

        Ok(())
    }
}

// ==============================================================================
// TRACKER
// ==============================================================================

/// Counts a patient's emergency broadcasts against the configured daily and
/// monthly ceilings; rejects creation, never queues it, once a ceiling is
/// reached.
pub struct EmergencyQuotaTracker {
    store: Arc<dyn QuotaStore>,
    daily_limit: u32,
    monthly_limit: u32,
}

impl EmergencyQuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>, daily_limit: u32, monthly_limit: u32) -> Self {
        Self {
            store,
            daily_limit,
            monthly_limit,
        }
    }

    pub fn day_reset_at(now: DateTime<Utc>) -> DateTime<Utc> {
        (now.date_naive() + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc()
    }

    pub fn month_reset_at(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive()
            .with_day(1)
            .expect("day 1 is valid for every month")
            .checked_add_months(Months::new(1))
            .expect("timestamps stay far from the calendar limits")
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc()
    }

    /// Consume one broadcast from both windows, or reject with the earliest
    /// moment a retry can succeed.
    pub async fn consume(&self, patient_id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let windows = QuotaWindows {
            day_reset_at: Self::day_reset_at(now),
            month_reset_at: Self::month_reset_at(now),
            daily_limit: self.daily_limit,
            monthly_limit: self.monthly_limit,
        };

        match self.store.try_increment(patient_id, now, windows).await {
            Ok(()) => {
                debug!("Emergency quota consumed for patient {}", patient_id);
                Ok(())
            }
            Err(QuotaError::Exhausted { reset_at }) => Err(QueueError::EmergencyLimitReached {
                reset_at,
                retry_after_seconds: (reset_at - now).num_seconds().max(0),
            }),
            Err(QuotaError::Backend(msg)) => Err(QueueError::Store(msg)),
        }
    }
}
