use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{PaymentHandle, PaymentStatus};

#[derive(Error, Debug)]
pub enum PaymentGateError {
    #[error("No charge exists for this queue item")]
    NoCharge,

    #[error("The checkout window for this charge has closed")]
    WindowClosed,

    #[error("Payment gate error: {0}")]
    Backend(String),
}

/// Capability interface over the external payment workflow. The gate is the
/// sole source of truth for `paid`/`expired`; the engine never inspects
/// provider-specific payment fields.
#[async_trait]
pub trait PaymentGate: Send + Sync {
    /// Current payment state for a queue item. `NotRequired` when no charge
    /// was ever enabled.
    async fn status_for(&self, queue_item_id: Uuid) -> Result<PaymentStatus, PaymentGateError>;

    /// Create a charge for a queue item and return what the client needs to
    /// complete checkout. Idempotent: a still-open charge is returned as-is.
    async fn enable_payment(&self, queue_item_id: Uuid) -> Result<PaymentHandle, PaymentGateError>;

    /// Checkout completion callback surface.
    async fn mark_paid(&self, queue_item_id: Uuid) -> Result<(), PaymentGateError>;
}

struct Charge {
    handle: PaymentHandle,
    paid_at: Option<DateTime<Utc>>,
}

/// Payment gate holding charges in process memory, with the checkout window
/// enforced at read time the same way queue-item expiry is.
pub struct InMemoryPaymentGate {
    charges: Mutex<HashMap<Uuid, Charge>>,
    clock: Arc<dyn Clock>,
    checkout_window: Duration,
}

impl InMemoryPaymentGate {
    pub fn new(clock: Arc<dyn Clock>, payment_window_minutes: i64) -> Self {
        Self {
            charges: Mutex::new(HashMap::new()),
            clock,
            checkout_window: Duration::minutes(payment_window_minutes),
        }
    }
}

#[async_trait]
impl PaymentGate for InMemoryPaymentGate {
    async fn status_for(&self, queue_item_id: Uuid) -> Result<PaymentStatus, PaymentGateError> {
        let charges = self.charges.lock().await;
        let Some(charge) = charges.get(&queue_item_id) else {
            return Ok(PaymentStatus::NotRequired);
        };

        if charge.paid_at.is_some() {
            return Ok(PaymentStatus::Paid);
        }
        if self.clock.now() > charge.handle.expires_at {
            return Ok(PaymentStatus::Expired);
        }
        Ok(PaymentStatus::Pending)
    }

    async fn enable_payment(&self, queue_item_id: Uuid) -> Result<PaymentHandle, PaymentGateError> {
        let mut charges = self.charges.lock().await;
        let now = self.clock.now();

        if let Some(existing) = charges.get(&queue_item_id) {
            if existing.paid_at.is_none() && now <= existing.handle.expires_at {
                debug!("Charge already open for item {}", queue_item_id);
                return Ok(existing.handle.clone());
            }
        }

        let payment_id = Uuid::new_v4();
        let handle = PaymentHandle {
            payment_id,
            checkout_ref: format!("checkout_{}", payment_id.simple()),
            expires_at: now + self.checkout_window,
        };
        charges.insert(
            queue_item_id,
            Charge {
                handle: handle.clone(),
                paid_at: None,
            },
        );

        debug!("Charge {} enabled for item {}", payment_id, queue_item_id);
        Ok(handle)
    }

    async fn mark_paid(&self, queue_item_id: Uuid) -> Result<(), PaymentGateError> {
        let mut charges = self.charges.lock().await;
        let now = self.clock.now();

        let charge = charges
            .get_mut(&queue_item_id)
            .ok_or(PaymentGateError::NoCharge)?;

        if charge.paid_at.is_some() {
            return Ok(());
        }
        if now > charge.handle.expires_at {
            return Err(PaymentGateError::WindowClosed);
        }

        charge.paid_at = Some(now);
        Ok(())
    }
}
