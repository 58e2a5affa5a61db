use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tracing::warn;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_utils::extractor::auth_middleware;

use crate::clock::{Clock, SystemClock};
use crate::handlers::{
    accept_queue_item, cancel_queue_item, close_consultation, complete_payment,
    create_emergency_broadcast, create_queue_item, enable_payment, get_queue_item, list_queue,
    reject_queue_item, start_consultation,
};
use crate::services::broadcast::EmergencyBroadcastService;
use crate::services::events::{EventSink, TracingEventSink};
use crate::services::lifecycle::QueueLifecycleService;
use crate::services::payment::{InMemoryPaymentGate, PaymentGate};
use crate::services::quota::{
    EmergencyQuotaTracker, InMemoryQuotaStore, QuotaStore, RedisQuotaStore,
};
use crate::services::store::{InMemoryQueueItemStore, QueueItemStore, SupabaseQueueItemStore};

/// Shared engine state: the assembled services, built once at router
/// construction and cloned into every handler.
#[derive(Clone)]
pub struct ConsultationQueueState {
    pub config: Arc<AppConfig>,
    pub lifecycle: Arc<QueueLifecycleService>,
    pub broadcast: Arc<EmergencyBroadcastService>,
}

impl ConsultationQueueState {
    /// Wire the engine from configuration: Supabase-backed items and
    /// Redis-backed quotas when configured, process-local fallbacks
    /// otherwise.
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        let store: Arc<dyn QueueItemStore> = if config.is_configured() {
            let supabase = Arc::new(SupabaseClient::new(&config));
            Arc::new(SupabaseQueueItemStore::new(supabase))
        } else {
            warn!("Supabase not configured, queue items held in process memory");
            Arc::new(InMemoryQueueItemStore::new())
        };

        let quota_store: Arc<dyn QuotaStore> = match config.redis_url.as_deref() {
            Some(url) => match RedisQuotaStore::new(url) {
                Ok(redis) => Arc::new(redis),
                Err(e) => {
                    warn!("Redis quota store unavailable ({}), falling back to memory", e);
                    Arc::new(InMemoryQuotaStore::new())
                }
            },
            None => Arc::new(InMemoryQuotaStore::new()),
        };

        Self::assemble(config, store, quota_store)
    }

    /// Fully process-local wiring, used by tests and single-node setups.
    pub fn in_memory(config: Arc<AppConfig>) -> Self {
        Self::assemble(
            config,
            Arc::new(InMemoryQueueItemStore::new()),
            Arc::new(InMemoryQuotaStore::new()),
        )
    }

    fn assemble(
        config: Arc<AppConfig>,
        store: Arc<dyn QueueItemStore>,
        quota_store: Arc<dyn QuotaStore>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let gate: Arc<dyn PaymentGate> = Arc::new(InMemoryPaymentGate::new(
            clock.clone(),
            config.queue.payment_window_minutes,
        ));

        let tracker = EmergencyQuotaTracker::new(
            quota_store,
            config.queue.emergency_daily_limit,
            config.queue.emergency_monthly_limit,
        );

        let broadcast = Arc::new(EmergencyBroadcastService::new(
            store.clone(),
            tracker,
            events.clone(),
            clock.clone(),
            config.queue.clone(),
        ));

        let lifecycle = Arc::new(QueueLifecycleService::new(
            store,
            gate,
            events,
            clock,
            broadcast.clone(),
            config.queue.clone(),
        ));

        Self {
            config,
            lifecycle,
            broadcast,
        }
    }
}

pub fn create_consultation_queue_router(config: Arc<AppConfig>) -> Router {
    let state = ConsultationQueueState::from_config(config);
    queue_router(state)
}

/// Router over an already-assembled state; lets tests inject in-memory
/// wiring.
pub fn queue_router(state: ConsultationQueueState) -> Router {
    let protected_routes = Router::new()
        .route("/items", post(create_queue_item).get(list_queue))
        .route("/items/{id}", get(get_queue_item))
        .route("/items/{id}/accept", post(accept_queue_item))
        .route("/items/{id}/reject", post(reject_queue_item))
        .route("/items/{id}/cancel", post(cancel_queue_item))
        .route("/items/{id}/start", post(start_consultation))
        .route("/items/{id}/close", post(close_consultation))
        .route("/items/{id}/enable-payment", post(enable_payment))
        .route("/items/{id}/payment-complete", post(complete_payment))
        .route("/emergency", post(create_emergency_broadcast))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    Router::new().merge(protected_routes).with_state(state)
}
