pub mod broadcast;
pub mod events;
pub mod expiry;
pub mod lifecycle;
pub mod ordering;
pub mod payment;
pub mod quota;
pub mod store;

pub use broadcast::EmergencyBroadcastService;
pub use events::{BroadcastEventSink, EventSink, QueueEvent, QueueEventKind, TracingEventSink};
pub use expiry::ExpirationEvaluator;
pub use lifecycle::QueueLifecycleService;
pub use ordering::QueueOrderingService;
pub use payment::{InMemoryPaymentGate, PaymentGate, PaymentGateError};
pub use quota::{
    EmergencyQuotaTracker, InMemoryQuotaStore, QuotaError, QuotaStore, QuotaWindows,
    RedisQuotaStore,
};
pub use store::{InMemoryQueueItemStore, QueueItemStore, StatusChange, StoreError, SupabaseQueueItemStore};
